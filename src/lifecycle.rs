use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
        Mutex,
        MutexGuard,
        Weak,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use data_model::{
    ControlAck,
    DrainState,
    HostState,
    HostStatus,
    SpecializationContext,
    WorkerChannelDescriptor,
    WorkerPoolSnapshot,
};
use funchost_utils::get_epoch_time_in_ms;
use metrics::create_timed_future;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::ServerConfig,
    drain::{DrainModeController, DrainOutcome},
    host::{change_monitor::spawn_change_monitor, ActiveHost, HostLease, ScriptHost},
    metrics_publisher::MetricsPublisher,
    standby::SpecializationManager,
    workers::{LaunchContext, WorkerChannelManager},
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("invalid host state transition from {from} to {to}")]
    InvalidTransition { from: HostState, to: HostState },
}

struct LifecycleBook {
    last_error: Option<String>,
    context: Option<SpecializationContext>,
    updated_at: u64,
}

/// Owns the host state machine. Every transition goes through one lock and
/// is checked against `HostState::can_transition_to`.
pub struct LifecycleOrchestrator {
    config: Arc<ServerConfig>,
    state_tx: watch::Sender<HostState>,
    book: Mutex<LifecycleBook>,
    active: Arc<ActiveHost>,
    specialization: Arc<SpecializationManager>,
    workers: Arc<WorkerChannelManager>,
    drain: DrainModeController,
    publisher: Arc<MetricsPublisher>,
    specialized: AtomicBool,
    change_monitor: Mutex<Option<CancellationToken>>,
    weak_self: Weak<LifecycleOrchestrator>,
}

impl LifecycleOrchestrator {
    pub fn new(
        config: Arc<ServerConfig>,
        active: Arc<ActiveHost>,
        specialization: Arc<SpecializationManager>,
        workers: Arc<WorkerChannelManager>,
        drain: DrainModeController,
        publisher: Arc<MetricsPublisher>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(HostState::Initializing);
        Arc::new_cyclic(|weak_self| Self {
            config,
            state_tx,
            book: Mutex::new(LifecycleBook {
                last_error: None,
                context: None,
                updated_at: get_epoch_time_in_ms(),
            }),
            active,
            specialization,
            workers,
            drain,
            publisher,
            specialized: AtomicBool::new(false),
            change_monitor: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    fn book(&self) -> MutexGuard<'_, LifecycleBook> {
        self.book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> HostState {
        *self.state_tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<HostState> {
        self.state_tx.subscribe()
    }

    pub fn drain_state(&self) -> DrainState {
        self.drain.state()
    }

    /// Pins the active host for one invocation.
    pub fn lease_active_host(&self) -> Option<HostLease> {
        self.active.lease()
    }

    // Callers hold the book lock.
    fn apply(&self, book: &mut LifecycleBook, next: HostState) -> Result<HostState, LifecycleError> {
        let current = self.state();
        if current == next {
            return Ok(current);
        }
        if !current.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition {
                from: current,
                to: next,
            });
        }
        if next != HostState::Error {
            book.last_error = None;
        }
        book.updated_at = get_epoch_time_in_ms();
        self.state_tx.send_replace(next);
        info!(from = %current, to = %next, "host state changed");
        Ok(current)
    }

    pub fn transition(&self, next: HostState) -> Result<HostState, LifecycleError> {
        let mut book = self.book();
        self.apply(&mut book, next)
    }

    /// Transitions only if the host is still in `expected`.
    pub fn transition_if(&self, expected: HostState, next: HostState) -> bool {
        let mut book = self.book();
        if self.state() != expected {
            return false;
        }
        self.apply(&mut book, next).is_ok()
    }

    pub fn fail(&self, err: &anyhow::Error) {
        let mut book = self.book();
        error!("host failed: {:?}", err);
        book.last_error = Some(format!("{:#}", err));
        let _ = self.apply(&mut book, HostState::Error);
    }

    pub async fn status(&self) -> HostStatus {
        let mut status = HostStatus::new(self.state(), self.drain.state());
        {
            let book = self.book();
            status.last_error = book.last_error.clone();
            status.updated_at = book.updated_at;
        }
        if let Some(host) = self.active.load() {
            status.mode = Some(host.mode());
            status.generation = Some(host.generation());
            status.functions = host.function_names();
        }
        status
    }

    pub async fn worker_pool_snapshot(&self, language: &str) -> Option<WorkerPoolSnapshot> {
        self.workers.pool_snapshot(language).await
    }

    pub async fn worker_pool_snapshots(&self) -> Vec<WorkerPoolSnapshot> {
        self.workers.pool_snapshots().await
    }

    pub async fn worker_channels(&self, language: &str) -> Vec<WorkerChannelDescriptor> {
        self.workers.get_channels(language).await
    }

    fn configured_context(&self) -> Option<SpecializationContext> {
        self.config.worker_runtime.as_ref().map(|runtime| {
            let mut context = SpecializationContext::new(runtime);
            context.script_root = Some(self.config.script_root.to_string_lossy().to_string());
            context
        })
    }

    /// Brings the host up: a standby host in placeholder mode, otherwise the
    /// customer host for the configured runtime.
    pub async fn boot(self: &Arc<Self>) -> Result<()> {
        self.workers.start();
        if self.config.placeholder_mode {
            if let Err(err) = self.specialization.warmup().await {
                self.fail(&err);
                return Err(err);
            }
            // pre-warm a worker per configured language for a fast assignment
            if let Err(err) = self
                .workers
                .ensure_languages(self.workers.configured_languages())
                .await
            {
                warn!("unable to pre-warm standby workers: {:?}", err);
            }
            self.transition(HostState::Standby)?;
            info!("host is in standby, waiting for assignment");
            return Ok(());
        }
        let Some(context) = self.configured_context() else {
            let err = anyhow!("no worker runtime configured and placeholder mode is off");
            self.fail(&err);
            return Err(err);
        };
        self.specialize(context).await?;
        Ok(())
    }

    /// Control-plane form of `specialize`: answers at once, the outcome is
    /// observed through `status()`.
    pub fn request_specialization(self: &Arc<Self>, context: SpecializationContext) -> ControlAck {
        let mut book = self.book();
        match self.state() {
            HostState::Standby => {
                if let Err(err) = self.apply(&mut book, HostState::Specializing) {
                    return ControlAck::rejected(err.to_string());
                }
                book.context = Some(context.clone());
                drop(book);
                self.spawn_specialization(context);
                ControlAck::Accepted
            }
            HostState::Specializing => ControlAck::AlreadyInProgress,
            HostState::Running | HostState::Restarting | HostState::Draining
                if self.specialized.load(Ordering::Acquire) =>
            {
                ControlAck::AlreadyInProgress
            }
            HostState::Initializing if self.config.placeholder_mode => {
                drop(book);
                self.spawn_specialization(context);
                ControlAck::Accepted
            }
            state => ControlAck::rejected(format!("cannot specialize while {}", state)),
        }
    }

    fn spawn_specialization(self: &Arc<Self>, context: SpecializationContext) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.specialize(context).await {
                warn!("specialization request failed: {:#}", err);
            }
        });
    }

    /// Awaiting form of specialization. Concurrent callers share one build and
    /// get the same host.
    pub async fn specialize(
        self: &Arc<Self>,
        context: SpecializationContext,
    ) -> Result<Arc<ScriptHost>> {
        if self.config.placeholder_mode {
            let mut state_rx = self.watch();
            state_rx
                .wait_for(|s| *s != HostState::Initializing)
                .await
                .map_err(|_| anyhow!("host state channel closed"))?;
            let mut book = self.book();
            if self.state() == HostState::Standby {
                self.apply(&mut book, HostState::Specializing)?;
            }
            book.context.get_or_insert_with(|| context.clone());
        } else {
            self.book().context.get_or_insert_with(|| context.clone());
        }

        match self.specialization.specialize(context.clone()).await {
            Ok(host) => {
                self.complete_specialization(&host, &context).await?;
                Ok(host)
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    /// Runs once per process, after the first successful customer build.
    async fn complete_specialization(
        &self,
        host: &Arc<ScriptHost>,
        context: &SpecializationContext,
    ) -> Result<()> {
        if self.specialized.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let runtime = context.worker_runtime.clone();
        self.workers.set_launch_context(LaunchContext {
            script_root: host.script_root().to_path_buf(),
            environment: context.app_settings.clone(),
        });
        self.workers.shutdown_languages_except(&runtime).await;
        let mut languages = host.languages();
        languages.insert(runtime.clone());
        if let Err(err) = self.workers.ensure_languages(languages).await {
            self.fail(&err);
            return Err(err);
        }
        self.publisher.start();
        self.start_change_monitor(host.script_root().to_path_buf());

        let mut book = self.book();
        if matches!(self.state(), HostState::Initializing | HostState::Specializing) {
            self.apply(&mut book, HostState::Running)?;
        }
        info!(
            worker_runtime = %runtime,
            generation = host.generation(),
            functions = ?host.function_names(),
            "host specialized"
        );
        Ok(())
    }

    fn start_change_monitor(&self, script_root: PathBuf) {
        let interval = self.config.host.file_watch_interval_ms;
        if interval == 0 {
            return;
        }
        let weak = self.weak_self.clone();
        let token = spawn_change_monitor(script_root, Duration::from_millis(interval), move || {
            if let Some(this) = weak.upgrade() {
                let ack = this.request_restart();
                info!(ack = ?ack, "restart requested after function metadata change");
            }
        });
        let previous = match self.change_monitor.lock() {
            Ok(mut slot) => slot.replace(token),
            Err(_) => None,
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    fn stop_change_monitor(&self) {
        let token = match self.change_monitor.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Rebuilds the customer host and restarts every worker pool. Queues
    /// behind an in-flight specialization.
    pub fn request_restart(self: &Arc<Self>) -> ControlAck {
        let mut book = self.book();
        match self.state() {
            HostState::Running | HostState::Error => {
                let Some(context) = book.context.clone().or_else(|| self.configured_context())
                else {
                    return ControlAck::rejected("host has never been specialized");
                };
                if let Err(err) = self.apply(&mut book, HostState::Restarting) {
                    return ControlAck::rejected(err.to_string());
                }
                drop(book);
                let this = self.clone();
                tokio::spawn(async move { this.run_restart(context).await });
                ControlAck::Accepted
            }
            HostState::Restarting => ControlAck::AlreadyInProgress,
            HostState::Specializing => {
                drop(book);
                let this = self.clone();
                tokio::spawn(async move {
                    let mut state_rx = this.watch();
                    if state_rx
                        .wait_for(|s| *s != HostState::Specializing)
                        .await
                        .is_ok()
                    {
                        let ack = this.request_restart();
                        info!(ack = ?ack, "queued restart issued after specialization");
                    }
                });
                ControlAck::Accepted
            }
            state => ControlAck::rejected(format!("cannot restart while {}", state)),
        }
    }

    async fn run_restart(self: Arc<Self>, context: SpecializationContext) {
        info!("restarting host");
        match self.specialization.rebuild(context.clone()).await {
            Ok(host) => {
                self.workers.restart_all().await;
                if let Err(err) = self.complete_specialization(&host, &context).await {
                    warn!("unable to finish restart: {:?}", err);
                    return;
                }
                if !self.transition_if(HostState::Restarting, HostState::Running) {
                    warn!(state = %self.state(), "host left Restarting during rebuild");
                }
            }
            Err(err) => self.fail(&err),
        }
    }

    /// Stops admitting drain-aware invocations and goes Offline once the
    /// in-flight ones finish or the drain timeout passes.
    pub fn request_drain(self: &Arc<Self>) -> ControlAck {
        let mut book = self.book();
        match self.state() {
            HostState::Running => {
                if let Err(err) = self.apply(&mut book, HostState::Draining) {
                    return ControlAck::rejected(err.to_string());
                }
                drop(book);
                self.drain.drain();
                let this = self.clone();
                tokio::spawn(async move { this.finish_drain().await });
                ControlAck::Accepted
            }
            HostState::Draining | HostState::Offline => ControlAck::AlreadyInProgress,
            state => ControlAck::rejected(format!("cannot drain while {}", state)),
        }
    }

    async fn finish_drain(self: Arc<Self>) {
        let timeout = self.config.drain.drain_timeout();
        let wait = create_timed_future(self.drain.wait_for_completion(timeout), |elapsed| {
            info!(elapsed_ms = elapsed.as_millis() as u64, "drain wait finished");
        });
        match wait.await {
            DrainOutcome::Completed | DrainOutcome::NotDraining => {
                info!("drain finished cleanly");
            }
            DrainOutcome::TimedOut { remaining } => {
                warn!(
                    remaining,
                    timeout_ms = timeout.as_millis() as u64,
                    "drain timed out, going offline with invocations still in flight"
                );
            }
        }
        self.transition_if(HostState::Draining, HostState::Offline);
    }

    /// Lifts drain mode and puts the host back in service.
    pub fn request_resume(&self) -> ControlAck {
        let ack = self.drain.resume();
        if !ack.is_accepted() {
            return ack;
        }
        let mut book = self.book();
        match self.state() {
            HostState::Draining | HostState::Offline => {
                if let Err(err) = self.apply(&mut book, HostState::Running) {
                    return ControlAck::rejected(err.to_string());
                }
                ControlAck::Accepted
            }
            _ => ack,
        }
    }

    /// Drains, then stops workers, the publisher and the change monitor.
    pub async fn shutdown(self: &Arc<Self>) {
        if self.state() == HostState::Running {
            self.request_drain();
        }
        if self.state() == HostState::Draining {
            let outcome = self
                .drain
                .wait_for_completion(self.config.drain.drain_timeout())
                .await;
            info!(outcome = ?outcome, "shutdown drain finished");
            self.transition_if(HostState::Draining, HostState::Offline);
        }
        self.stop_change_monitor();
        self.publisher.stop();
        self.workers.shutdown().await;
        if let Some(host) = self.active.clear() {
            info!(generation = host.generation(), "active host released");
        }
        info!(state = %self.state(), "host shut down");
    }
}
