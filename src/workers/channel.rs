use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use data_model::{ChannelState, InvocationRequest, WorkerChannelDescriptor, WorkerId};
use funchost_utils::get_epoch_time_in_ms;
use tokio::sync::Notify;
use tracing::{info, warn};

use super::process::{InvokeError, WorkerProcess};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("worker channel {0} is not ready")]
    NotReady(WorkerId),
    #[error("worker channel {worker_id} faulted: {message}")]
    Faulted { worker_id: WorkerId, message: String },
    #[error("function failed in worker {worker_id}: {message}")]
    FunctionFailed { worker_id: WorkerId, message: String },
}

impl ChannelError {
    /// Channel-level faults can be resubmitted to another channel.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ChannelError::FunctionFailed { .. })
    }
}

/// Host side of one worker process. Moves NotReady -> Ready -> Terminated and
/// never comes back from Terminated.
pub struct WorkerChannel {
    id: WorkerId,
    language: String,
    process: Arc<dyn WorkerProcess>,
    state: AtomicU8,
    pending: AtomicU64,
    idle: Notify,
    created_at: u64,
    ready_at: AtomicU64,
    stopping: AtomicBool,
}

impl fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("id", &self.id)
            .field("language", &self.language)
            .field("state", &self.state())
            .field("pending", &self.pending_invocations())
            .finish()
    }
}

impl WorkerChannel {
    pub fn new(id: WorkerId, language: &str, process: Arc<dyn WorkerProcess>) -> Self {
        Self {
            id,
            language: language.to_string(),
            process,
            state: AtomicU8::new(ChannelState::NotReady.as_u8()),
            pending: AtomicU64::new(0),
            idle: Notify::new(),
            created_at: get_epoch_time_in_ms(),
            ready_at: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ChannelState::Ready
    }

    pub fn pending_invocations(&self) -> u64 {
        self.pending.load(Ordering::SeqCst)
    }

    /// Whether the host asked this channel to stop, as opposed to a crash.
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn has_been_ready(&self) -> bool {
        self.ready_at.load(Ordering::Acquire) > 0
    }

    pub async fn wait_ready(&self, timeout: Duration) -> anyhow::Result<()> {
        self.process.wait_ready(timeout).await
    }

    pub fn mark_ready(&self) -> bool {
        let swapped = self
            .state
            .compare_exchange(
                ChannelState::NotReady.as_u8(),
                ChannelState::Ready.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if swapped {
            self.ready_at
                .store(get_epoch_time_in_ms(), Ordering::Release);
        }
        swapped
    }

    /// Returns true only for the call that performed the transition.
    pub fn mark_terminated(&self) -> bool {
        self.state
            .swap(ChannelState::Terminated.as_u8(), Ordering::SeqCst) !=
            ChannelState::Terminated.as_u8()
    }

    pub fn descriptor(&self) -> WorkerChannelDescriptor {
        let ready_at = self.ready_at.load(Ordering::Acquire);
        WorkerChannelDescriptor {
            id: self.id.clone(),
            language: self.language.clone(),
            state: self.state(),
            pending_invocations: self.pending_invocations(),
            created_at: self.created_at,
            ready_at: (ready_at > 0).then_some(ready_at),
        }
    }

    pub async fn invoke(
        &self,
        request: &InvocationRequest,
    ) -> Result<serde_json::Value, ChannelError> {
        // counted before the state check so a retiring channel either sees
        // this invocation or the invocation sees the channel leave Ready
        self.pending.fetch_add(1, Ordering::SeqCst);
        let _pending = PendingInvocation(self);
        if !self.is_ready() {
            return Err(ChannelError::NotReady(self.id.clone()));
        }
        match self.process.invoke(request).await {
            Ok(output) => Ok(output),
            Err(InvokeError::Function(message)) => Err(ChannelError::FunctionFailed {
                worker_id: self.id.clone(),
                message,
            }),
            Err(InvokeError::Transport(message)) => {
                // a broken transport means the process is no longer usable
                if self.mark_terminated() {
                    warn!(
                        worker_id = %self.id,
                        language = %self.language,
                        "worker channel transport failed, terminating: {}",
                        message
                    );
                    self.kill().await;
                }
                Err(ChannelError::Faulted {
                    worker_id: self.id.clone(),
                    message,
                })
            }
        }
    }

    fn finish_invocation(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Waits until no invocation is pending, or `grace` elapses. Returns true
    /// when the channel went idle.
    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();
            if self.pending_invocations() == 0 {
                return true;
            }
            tokio::select! {
                _ = &mut idle => {}
                _ = tokio::time::sleep_until(deadline) => return self.pending_invocations() == 0,
            }
        }
    }

    fn begin_stop(&self) {
        self.stopping.store(true, Ordering::Release);
        if self.mark_terminated() {
            info!(
                worker_id = %self.id,
                language = %self.language,
                pid = ?self.process.pid(),
                pending = self.pending_invocations(),
                "stopping worker channel"
            );
        }
    }

    async fn kill(&self) {
        if let Err(err) = self.process.kill().await {
            warn!(worker_id = %self.id, "failed to kill worker: {:?}", err);
        }
    }

    /// Host-initiated stop. In-flight invocations are left to fail on their
    /// own once the process is gone.
    pub async fn terminate(&self) {
        self.begin_stop();
        self.kill().await;
    }

    /// Takes the channel out of rotation at once, then kills the process when
    /// its pending invocations finish or `grace` runs out.
    pub async fn retire(&self, grace: Duration) {
        self.begin_stop();
        if !self.wait_idle(grace).await {
            warn!(
                worker_id = %self.id,
                pending = self.pending_invocations(),
                "grace period elapsed before worker went idle"
            );
        }
        self.kill().await;
    }
}

// Also released when the caller drops the invocation future.
struct PendingInvocation<'a>(&'a WorkerChannel);

impl Drop for PendingInvocation<'_> {
    fn drop(&mut self) {
        self.0.finish_invocation();
    }
}
