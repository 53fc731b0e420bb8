pub mod channel;
pub mod error_tracker;
pub mod manager;
pub mod process;
pub mod subprocess;

pub use channel::{ChannelError, WorkerChannel};
pub use manager::{LaunchContext, WorkerChannelManager, WorkerManagerConfig};
pub use process::{WorkerProcessFactory, WorkerLaunch};
pub use subprocess::SubprocessWorkerFactory;
