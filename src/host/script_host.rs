use std::{
    collections::{BTreeSet, HashMap},
    ops::Deref,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use data_model::{FunctionMetadata, HostMode};
use funchost_utils::get_epoch_time_in_ms;
use tokio::sync::Notify;
use tracing::{info, warn};

use super::load_context::LoadContext;

/// One built host: its functions, its load context and the invocations
/// currently leased against it.
pub struct ScriptHost {
    generation: u64,
    mode: HostMode,
    worker_runtime: Option<String>,
    script_root: PathBuf,
    functions: HashMap<String, FunctionMetadata>,
    load_context: Arc<LoadContext>,
    in_flight: AtomicUsize,
    idle: Notify,
    disposed: AtomicBool,
    created_at: u64,
}

impl std::fmt::Debug for ScriptHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptHost")
            .field("generation", &self.generation)
            .field("mode", &self.mode)
            .field("functions", &self.functions.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl ScriptHost {
    pub fn new(
        generation: u64,
        mode: HostMode,
        worker_runtime: Option<String>,
        script_root: PathBuf,
        functions: Vec<FunctionMetadata>,
        load_context: Arc<LoadContext>,
    ) -> Self {
        Self {
            generation,
            mode,
            worker_runtime,
            script_root,
            functions: functions
                .into_iter()
                .map(|f| (f.name.clone(), f))
                .collect(),
            load_context,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            disposed: AtomicBool::new(false),
            created_at: get_epoch_time_in_ms(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mode(&self) -> HostMode {
        self.mode
    }

    pub fn worker_runtime(&self) -> Option<&str> {
        self.worker_runtime.as_deref()
    }

    pub fn script_root(&self) -> &Path {
        &self.script_root
    }

    pub fn load_context(&self) -> &Arc<LoadContext> {
        &self.load_context
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn function(&self, name: &str) -> Option<&FunctionMetadata> {
        self.functions.get(name)
    }

    pub fn function_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    /// Languages needed by the enabled functions.
    pub fn languages(&self) -> BTreeSet<String> {
        self.functions
            .values()
            .filter(|f| !f.disabled)
            .map(|f| f.language.clone())
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Pins this host for the duration of one invocation.
    pub fn lease(self: &Arc<Self>) -> HostLease {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        HostLease { host: self.clone() }
    }

    /// Waits until no invocation holds a lease, or `grace` elapses. Returns
    /// true when the host went idle.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.in_flight() == 0 {
                return true;
            }
            tokio::select! {
                _ = &mut idle => {}
                _ = tokio::time::sleep_until(deadline) => return self.in_flight() == 0,
            }
        }
    }

    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let in_flight = self.in_flight();
        if in_flight > 0 {
            warn!(
                generation = self.generation,
                in_flight, "disposing host with invocations still in flight"
            );
        } else {
            info!(generation = self.generation, mode = %self.mode, "host disposed");
        }
    }
}

pub struct HostLease {
    host: Arc<ScriptHost>,
}

impl HostLease {
    pub fn host(&self) -> &Arc<ScriptHost> {
        &self.host
    }
}

impl Deref for HostLease {
    type Target = ScriptHost;

    fn deref(&self) -> &Self::Target {
        &self.host
    }
}

impl Drop for HostLease {
    fn drop(&mut self) {
        if self.host.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.host.idle.notify_waiters();
        }
    }
}
