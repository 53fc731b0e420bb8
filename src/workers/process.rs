use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use data_model::{InvocationRequest, WorkerId};
use tokio::sync::oneshot;

use crate::config::LanguageWorkerConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub code: Option<i32>,
    pub reason: String,
}

impl WorkerExit {
    pub fn new(code: Option<i32>, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    /// The worker could not be reached or went away mid-invocation.
    #[error("worker transport failed: {0}")]
    Transport(String),
    /// The worker ran the function and reported a failure.
    #[error("function failed: {0}")]
    Function(String),
}

/// Everything a factory needs to launch one worker process.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub worker_id: WorkerId,
    pub language: String,
    pub config: LanguageWorkerConfig,
    pub script_root: PathBuf,
    pub environment: HashMap<String, String>,
}

#[async_trait::async_trait]
pub trait WorkerProcess: Send + Sync {
    fn pid(&self) -> Option<u32>;

    /// Resolves once the worker has completed its startup handshake.
    async fn wait_ready(&self, timeout: Duration) -> Result<()>;

    async fn invoke(&self, request: &InvocationRequest) -> Result<serde_json::Value, InvokeError>;

    /// Asks the process to stop. Completion is reported through the exit
    /// receiver handed out at spawn time.
    async fn kill(&self) -> Result<()>;
}

pub struct SpawnedWorker {
    pub process: Arc<dyn WorkerProcess>,
    /// Fires exactly once when the process is gone, whatever the cause.
    pub exited: oneshot::Receiver<WorkerExit>,
}

#[async_trait::async_trait]
pub trait WorkerProcessFactory: Send + Sync {
    async fn spawn(&self, launch: WorkerLaunch) -> Result<SpawnedWorker>;
}
