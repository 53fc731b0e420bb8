use std::{process::Stdio, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use data_model::{InvocationRequest, WorkerId};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    sync::{oneshot, watch, Mutex},
};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LinesCodec},
    sync::CancellationToken,
};
use tracing::{debug, error, info, warn};

use super::process::{
    InvokeError,
    SpawnedWorker,
    WorkerExit,
    WorkerLaunch,
    WorkerProcess,
    WorkerProcessFactory,
};

const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

/// Target of every line a worker logs, through stderr or `log` messages.
pub const WORKER_LOG_TARGET: &str = "funchost::worker";

/// Messages sent from the host to a worker, one JSON document per line.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Init {
        worker_id: String,
        script_root: String,
    },
    Invoke {
        invocation_id: String,
        function_name: String,
        payload: serde_json::Value,
    },
}

/// Messages sent from a worker to the host.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready,
    Result {
        invocation_id: String,
        output: serde_json::Value,
    },
    Error {
        invocation_id: String,
        message: String,
    },
    Log {
        message: String,
    },
}

type PendingInvocations = DashMap<String, oneshot::Sender<Result<serde_json::Value, InvokeError>>>;

pub struct SubprocessWorker {
    worker_id: WorkerId,
    pid: Option<u32>,
    writer: Mutex<FramedWrite<ChildStdin, LinesCodec>>,
    pending: Arc<PendingInvocations>,
    ready_rx: watch::Receiver<bool>,
    exited: CancellationToken,
    kill: CancellationToken,
}

impl SubprocessWorker {
    async fn send(&self, message: &HostMessage) -> Result<(), InvokeError> {
        let line =
            serde_json::to_string(message).map_err(|e| InvokeError::Transport(e.to_string()))?;
        let mut writer = self.writer.lock().await;
        writer
            .send(line)
            .await
            .map_err(|e| InvokeError::Transport(e.to_string()))
    }
}

#[async_trait::async_trait]
impl WorkerProcess for SubprocessWorker {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut ready_rx = self.ready_rx.clone();
        let handshake = async {
            tokio::select! {
                res = ready_rx.wait_for(|ready| *ready) => {
                    res.map(|_| ()).map_err(|_| anyhow!("worker closed its output before the handshake"))
                }
                _ = self.exited.cancelled() => {
                    Err(anyhow!("worker exited before the handshake"))
                }
            }
        };
        tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| anyhow!("worker {} handshake timed out after {:?}", self.worker_id, timeout))?
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<serde_json::Value, InvokeError> {
        if self.exited.is_cancelled() {
            return Err(InvokeError::Transport("worker has exited".to_string()));
        }
        let (tx, rx) = oneshot::channel();
        let invocation_id = request.id.get().to_string();
        self.pending.insert(invocation_id.clone(), tx);
        let message = HostMessage::Invoke {
            invocation_id: invocation_id.clone(),
            function_name: request.function_name.clone(),
            payload: request.payload.clone(),
        };
        if let Err(err) = self.send(&message).await {
            self.pending.remove(&invocation_id);
            return Err(err);
        }
        tokio::select! {
            biased;
            res = rx => match res {
                Ok(result) => result,
                Err(_) => Err(InvokeError::Transport(
                    "worker exited with the invocation in flight".to_string(),
                )),
            },
            _ = self.exited.cancelled() => {
                self.pending.remove(&invocation_id);
                Err(InvokeError::Transport(
                    "worker exited with the invocation in flight".to_string(),
                ))
            }
        }
    }

    async fn kill(&self) -> Result<()> {
        self.kill.cancel();
        Ok(())
    }
}

pub struct SubprocessWorkerFactory {}

impl SubprocessWorkerFactory {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for SubprocessWorkerFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl WorkerProcessFactory for SubprocessWorkerFactory {
    async fn spawn(&self, launch: WorkerLaunch) -> Result<SpawnedWorker> {
        let mut command = Command::new(&launch.config.executable);
        command
            .args(&launch.config.arguments)
            .envs(&launch.config.environment)
            .envs(&launch.environment)
            .env("FUNCHOST_WORKER_ID", launch.worker_id.get())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if launch.script_root.is_dir() {
            command.current_dir(&launch.script_root);
        }
        let mut child = command.spawn().with_context(|| {
            format!(
                "failed to spawn {} worker using {}",
                launch.language, launch.config.executable
            )
        })?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("worker stdin is not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("worker stdout is not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("worker stderr is not piped"))?;

        let (ready_tx, ready_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = oneshot::channel();
        let pending: Arc<PendingInvocations> = Arc::new(DashMap::new());
        let exited = CancellationToken::new();
        let kill = CancellationToken::new();

        tokio::spawn(read_worker_output(
            launch.worker_id.clone(),
            stdout,
            ready_tx,
            pending.clone(),
        ));
        tokio::spawn(forward_worker_stderr(
            launch.worker_id.clone(),
            launch.language.clone(),
            stderr,
        ));
        tokio::spawn(watch_worker_exit(
            launch.worker_id.clone(),
            child,
            kill.clone(),
            launch.config.shutdown_timeout(),
            pending.clone(),
            exited.clone(),
            exit_tx,
        ));

        let worker = SubprocessWorker {
            worker_id: launch.worker_id.clone(),
            pid,
            writer: Mutex::new(FramedWrite::new(
                stdin,
                LinesCodec::new_with_max_length(MAX_LINE_LENGTH),
            )),
            pending,
            ready_rx,
            exited,
            kill,
        };
        let init = HostMessage::Init {
            worker_id: launch.worker_id.get().to_string(),
            script_root: launch.script_root.display().to_string(),
        };
        if let Err(err) = worker.send(&init).await {
            // the exit watcher owns the child; only it can stop the process
            worker.kill.cancel();
            return Err(anyhow!(
                "failed to initialize worker {}: {}",
                launch.worker_id,
                err
            ));
        }

        info!(
            worker_id = %launch.worker_id,
            language = %launch.language,
            pid = ?pid,
            "spawned language worker process"
        );
        Ok(SpawnedWorker {
            process: Arc::new(worker),
            exited: exit_rx,
        })
    }
}

async fn read_worker_output(
    worker_id: WorkerId,
    stdout: ChildStdout,
    ready_tx: watch::Sender<bool>,
    pending: Arc<PendingInvocations>,
) {
    let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    while let Some(line) = lines.next().await {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                error!(worker_id = %worker_id, "error reading worker output: {:?}", err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<WorkerMessage>(&line) {
            Ok(WorkerMessage::Ready) => {
                debug!(worker_id = %worker_id, "worker handshake completed");
                let _ = ready_tx.send(true);
            }
            Ok(WorkerMessage::Result {
                invocation_id,
                output,
            }) => {
                if let Some((_, tx)) = pending.remove(&invocation_id) {
                    let _ = tx.send(Ok(output));
                }
            }
            Ok(WorkerMessage::Error {
                invocation_id,
                message,
            }) => {
                if let Some((_, tx)) = pending.remove(&invocation_id) {
                    let _ = tx.send(Err(InvokeError::Function(message)));
                }
            }
            Ok(WorkerMessage::Log { message }) => {
                info!(target: WORKER_LOG_TARGET, worker_id = %worker_id, "{}", message);
            }
            Err(err) => {
                warn!(worker_id = %worker_id, line = %line, "unrecognized worker message: {}", err);
            }
        }
    }
}

async fn forward_worker_stderr(worker_id: WorkerId, language: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                warn!(
                    target: WORKER_LOG_TARGET,
                    worker_id = %worker_id,
                    language = %language,
                    stream = "stderr",
                    "{}",
                    line
                );
            }
            Ok(None) => break,
            Err(err) => {
                debug!(worker_id = %worker_id, "stopped reading worker stderr: {:?}", err);
                break;
            }
        }
    }
}

async fn watch_worker_exit(
    worker_id: WorkerId,
    mut child: Child,
    kill: CancellationToken,
    shutdown_timeout: Duration,
    pending: Arc<PendingInvocations>,
    exited: CancellationToken,
    exit_tx: oneshot::Sender<WorkerExit>,
) {
    let exit = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => WorkerExit::new(status.code(), format!("process exited: {}", status)),
            Err(err) => WorkerExit::new(None, format!("failed waiting on process: {}", err)),
        },
        _ = kill.cancelled() => {
            if let Err(err) = child.start_kill() {
                warn!(worker_id = %worker_id, "failed to signal worker process: {:?}", err);
            }
            match tokio::time::timeout(shutdown_timeout, child.wait()).await {
                Ok(Ok(status)) => WorkerExit::new(status.code(), "process stopped by host"),
                Ok(Err(err)) => WorkerExit::new(None, format!("failed waiting on process: {}", err)),
                Err(_) => WorkerExit::new(None, "process did not exit within the shutdown timeout"),
            }
        }
    };
    exited.cancel();
    // dropping the senders fails every invocation still waiting on this worker
    pending.clear();
    debug!(worker_id = %worker_id, reason = %exit.reason, "worker process gone");
    let _ = exit_tx.send(exit);
}
