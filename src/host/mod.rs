pub mod active;
pub mod builder;
pub mod change_monitor;
pub mod load_context;
pub mod script_host;

pub use active::ActiveHost;
pub use builder::{HostBuildRequest, HostBuilder, ScriptHostBuilder};
pub use load_context::{LoadContext, LoadContextProvider};
pub use script_host::{HostLease, ScriptHost};
