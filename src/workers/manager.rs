use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use data_model::{ChannelState, WorkerChannelDescriptor, WorkerId, WorkerPoolSnapshot};
use futures::future::join_all;
use metrics::host_stats;
use opentelemetry::KeyValue;
use tokio::{
    sync::{mpsc, Notify, RwLock},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    channel::WorkerChannel,
    error_tracker::WorkerErrorTracker,
    process::{WorkerExit, WorkerLaunch, WorkerProcessFactory},
};
use crate::config::{LanguageWorkerConfig, ServerConfig};

#[derive(Debug, Clone)]
pub struct WorkerManagerConfig {
    pub workers: HashMap<String, LanguageWorkerConfig>,
    pub error_window: Duration,
    pub capacity_check_interval: Duration,
    pub script_root: PathBuf,
    /// How long a restarted worker may finish its pending invocations.
    pub retire_grace: Duration,
}

impl WorkerManagerConfig {
    pub fn from_server_config(config: &ServerConfig) -> Self {
        Self {
            workers: config.workers.clone(),
            error_window: config.worker_error_window(),
            capacity_check_interval: config.capacity_check_interval(),
            script_root: config.script_root.clone(),
            retire_grace: config.host.restart_grace_period(),
        }
    }
}

/// Where and with which settings new workers are started. Swapped on
/// specialization.
#[derive(Debug, Clone, Default)]
pub struct LaunchContext {
    pub script_root: PathBuf,
    pub environment: HashMap<String, String>,
}

#[derive(Debug)]
pub enum PoolEvent {
    Exited {
        language: String,
        pool_id: u64,
        worker_id: WorkerId,
        exit: WorkerExit,
    },
}

struct LanguageWorkerPool {
    pool_id: u64,
    language: String,
    config: LanguageWorkerConfig,
    target: usize,
    // creation order
    channels: Vec<Arc<WorkerChannel>>,
    last_started_at: Option<Instant>,
    launching: bool,
    restart_not_before: Option<Instant>,
    errors: WorkerErrorTracker,
    error: Option<String>,
    next: AtomicUsize,
}

impl LanguageWorkerPool {
    fn new(
        pool_id: u64,
        language: &str,
        config: LanguageWorkerConfig,
        target: usize,
        error_window: Duration,
    ) -> Self {
        let errors = WorkerErrorTracker::new(error_window, target);
        Self {
            pool_id,
            language: language.to_string(),
            config,
            target,
            channels: Vec::new(),
            last_started_at: None,
            launching: false,
            restart_not_before: None,
            errors,
            error: None,
            next: AtomicUsize::new(0),
        }
    }

    fn live_count(&self) -> usize {
        self.channels
            .iter()
            .filter(|c| c.state() != ChannelState::Terminated)
            .count()
    }

    fn next_launch_at(&self) -> Option<Instant> {
        let throttle = self
            .last_started_at
            .map(|at| at + self.config.startup_interval());
        match (throttle, self.restart_not_before) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }

    fn snapshot(&self) -> WorkerPoolSnapshot {
        WorkerPoolSnapshot {
            language: self.language.clone(),
            target_process_count: self.target,
            channels: self.channels.iter().map(|c| c.descriptor()).collect(),
            error: self.error.clone(),
        }
    }
}

/// Owns one worker pool per language. Pools grow one throttled launch at a
/// time toward their target; every restart or shutdown bumps the epoch so
/// capacity ticks scheduled before it launch nothing.
pub struct WorkerChannelManager {
    config: WorkerManagerConfig,
    factory: Arc<dyn WorkerProcessFactory>,
    metrics: Arc<host_stats::Metrics>,
    launch_context: ArcSwap<LaunchContext>,
    pools: RwLock<HashMap<String, LanguageWorkerPool>>,
    epoch: AtomicU64,
    next_pool_id: AtomicU64,
    wake: Notify,
    channel_ready: Notify,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<PoolEvent>>>,
    cancel: CancellationToken,
}

impl WorkerChannelManager {
    pub fn new(
        config: WorkerManagerConfig,
        factory: Arc<dyn WorkerProcessFactory>,
        metrics: Arc<host_stats::Metrics>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let launch_context = LaunchContext {
            script_root: config.script_root.clone(),
            environment: HashMap::new(),
        };
        Self {
            config,
            factory,
            metrics,
            launch_context: ArcSwap::from_pointee(launch_context),
            pools: RwLock::new(HashMap::new()),
            epoch: AtomicU64::new(0),
            next_pool_id: AtomicU64::new(1),
            wake: Notify::new(),
            channel_ready: Notify::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
        }
    }

    /// Starts the capacity loop and the exit event loop. Calling it again is
    /// a no-op.
    pub fn start(self: &Arc<Self>) {
        let events_rx = match self.events_rx.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        let Some(events_rx) = events_rx else {
            return;
        };
        tokio::spawn(self.clone().run_event_loop(events_rx));
        tokio::spawn(self.clone().run_capacity_loop());
        info!(
            languages = ?self.configured_languages(),
            "worker channel manager started"
        );
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn configured_languages(&self) -> Vec<String> {
        let mut languages: Vec<String> = self.config.workers.keys().cloned().collect();
        languages.sort();
        languages
    }

    pub fn set_launch_context(&self, launch_context: LaunchContext) {
        self.launch_context.store(Arc::new(launch_context));
    }

    /// Creates the pool for `language` on first need.
    pub async fn ensure_language(&self, language: &str) -> Result<()> {
        let mut pools = self.pools.write().await;
        if pools.contains_key(language) {
            return Ok(());
        }
        let config = self
            .config
            .workers
            .get(language)
            .cloned()
            .ok_or_else(|| anyhow!("no worker configuration for language {}", language))?;
        let target = config.process_count.min(config.max_process_count);
        let pool_id = self.next_pool_id.fetch_add(1, Ordering::AcqRel);
        pools.insert(
            language.to_string(),
            LanguageWorkerPool::new(pool_id, language, config, target, self.config.error_window),
        );
        drop(pools);
        info!(language = %language, target, "created worker pool");
        self.wake.notify_one();
        Ok(())
    }

    pub async fn ensure_languages<I, S>(&self, languages: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for language in languages {
            self.ensure_language(language.as_ref()).await?;
        }
        Ok(())
    }

    pub async fn get_channels(&self, language: &str) -> Vec<WorkerChannelDescriptor> {
        let pools = self.pools.read().await;
        pools
            .get(language)
            .map(|p| p.channels.iter().map(|c| c.descriptor()).collect())
            .unwrap_or_default()
    }

    /// Round-robin over the Ready channels of `language`. Never waits.
    pub async fn get_ready_channel(&self, language: &str) -> Option<Arc<WorkerChannel>> {
        let pools = self.pools.read().await;
        let pool = pools.get(language)?;
        let ready: Vec<&Arc<WorkerChannel>> =
            pool.channels.iter().filter(|c| c.is_ready()).collect();
        if ready.is_empty() {
            return None;
        }
        let idx = pool.next.fetch_add(1, Ordering::Relaxed) % ready.len();
        Some(ready[idx].clone())
    }

    /// Waits up to `timeout` for a Ready channel. Gives up early when the
    /// pool's circuit breaker is open.
    pub async fn wait_for_ready_channel(
        &self,
        language: &str,
        timeout: Duration,
    ) -> Option<Arc<WorkerChannel>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.channel_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(channel) = self.get_ready_channel(language).await {
                return Some(channel);
            }
            if self.pool_error(language).await.is_some() {
                return None;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => return None,
                _ = self.cancel.cancelled() => return None,
            }
        }
    }

    pub async fn pool_error(&self, language: &str) -> Option<String> {
        let pools = self.pools.read().await;
        pools.get(language).and_then(|p| p.error.clone())
    }

    pub async fn pool_snapshot(&self, language: &str) -> Option<WorkerPoolSnapshot> {
        let pools = self.pools.read().await;
        pools.get(language).map(|p| p.snapshot())
    }

    pub async fn pool_snapshots(&self) -> Vec<WorkerPoolSnapshot> {
        let pools = self.pools.read().await;
        let mut snapshots: Vec<WorkerPoolSnapshot> = pools.values().map(|p| p.snapshot()).collect();
        snapshots.sort_by(|a, b| a.language.cmp(&b.language));
        snapshots
    }

    /// Starts at most one launch for `language` if the pool is below target,
    /// nothing is in flight, and the startup throttle allows it. A tick whose
    /// `epoch` is older than the manager's launches nothing.
    pub async fn ensure_capacity(self: &Arc<Self>, language: &str, epoch: u64) -> bool {
        let (pool_id, launch) = {
            let mut pools = self.pools.write().await;
            if self.current_epoch() != epoch || self.cancel.is_cancelled() {
                debug!(
                    language = %language,
                    scheduled_epoch = epoch,
                    current_epoch = self.current_epoch(),
                    "discarding stale capacity tick"
                );
                return false;
            }
            let Some(pool) = pools.get_mut(language) else {
                return false;
            };
            if pool.error.is_some() || pool.launching || pool.live_count() >= pool.target {
                return false;
            }
            let now = Instant::now();
            if pool.next_launch_at().is_some_and(|at| now < at) {
                return false;
            }
            pool.launching = true;
            pool.last_started_at = Some(now);
            let launch_context = self.launch_context.load();
            let launch = WorkerLaunch {
                worker_id: WorkerId::generate(language),
                language: language.to_string(),
                config: pool.config.clone(),
                script_root: launch_context.script_root.clone(),
                environment: launch_context.environment.clone(),
            };
            (pool.pool_id, launch)
        };
        info!(
            language = %language,
            worker_id = %launch.worker_id,
            "launching language worker"
        );
        tokio::spawn(self.clone().launch(pool_id, epoch, launch));
        true
    }

    /// Whether a launch decided under `pool_id` and `epoch` may still start a
    /// process. A stale launch releases its pool's launch slot.
    async fn launch_still_current(&self, language: &str, pool_id: u64, epoch: u64) -> bool {
        let mut pools = self.pools.write().await;
        let current = self.current_epoch() == epoch && !self.cancel.is_cancelled();
        match pools.get_mut(language).filter(|p| p.pool_id == pool_id) {
            Some(_) if current => true,
            Some(pool) => {
                pool.launching = false;
                false
            }
            None => false,
        }
    }

    async fn launch(self: Arc<Self>, pool_id: u64, epoch: u64, launch: WorkerLaunch) {
        let worker_id = launch.worker_id.clone();
        let language = launch.language.clone();
        let handshake_timeout = launch.config.handshake_timeout();
        if !self.launch_still_current(&language, pool_id, epoch).await {
            debug!(
                worker_id = %worker_id,
                language = %language,
                scheduled_epoch = epoch,
                current_epoch = self.current_epoch(),
                "discarding launch scheduled before a restart"
            );
            self.wake.notify_one();
            return;
        }
        self.metrics
            .worker_launches
            .add(1, &[KeyValue::new("language", language.clone())]);

        let spawned = match self.factory.spawn(launch).await {
            Ok(spawned) => spawned,
            Err(err) => {
                self.on_start_failed(&language, pool_id, &worker_id, &format!("{:#}", err))
                    .await;
                return;
            }
        };
        let channel = Arc::new(WorkerChannel::new(
            worker_id.clone(),
            &language,
            spawned.process,
        ));

        let registered = {
            let mut pools = self.pools.write().await;
            match pools.get_mut(&language) {
                Some(pool) if pool.pool_id == pool_id => {
                    pool.channels.push(channel.clone());
                    true
                }
                _ => false,
            }
        };
        let events_tx = self.events_tx.clone();
        let exited = spawned.exited;
        let (exit_language, exit_worker_id) = (language.clone(), worker_id.clone());
        tokio::spawn(async move {
            let exit = exited
                .await
                .unwrap_or_else(|_| WorkerExit::new(None, "exit notification dropped"));
            let _ = events_tx.send(PoolEvent::Exited {
                language: exit_language,
                pool_id,
                worker_id: exit_worker_id,
                exit,
            });
        });
        if !registered {
            info!(worker_id = %worker_id, "worker pool was replaced during launch, stopping worker");
            channel.terminate().await;
            return;
        }

        match channel.wait_ready(handshake_timeout).await {
            Ok(()) => {
                let mut pools = self.pools.write().await;
                let Some(pool) = pools.get_mut(&language).filter(|p| p.pool_id == pool_id) else {
                    drop(pools);
                    channel.terminate().await;
                    return;
                };
                pool.launching = false;
                // the next launch is spaced from handshake completion too
                pool.last_started_at = Some(Instant::now());
                if channel.mark_ready() {
                    info!(
                        worker_id = %worker_id,
                        language = %language,
                        live = pool.live_count(),
                        target = pool.target,
                        "language worker ready"
                    );
                    drop(pools);
                    self.channel_ready.notify_waiters();
                }
                self.wake.notify_one();
            }
            Err(err) => {
                channel.terminate().await;
                self.on_start_failed(&language, pool_id, &worker_id, &format!("{:#}", err))
                    .await;
            }
        }
    }

    async fn on_start_failed(&self, language: &str, pool_id: u64, worker_id: &WorkerId, err: &str) {
        error!(
            worker_id = %worker_id,
            language = %language,
            "language worker failed to start: {}",
            err
        );
        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get_mut(language).filter(|p| p.pool_id == pool_id) {
            pool.launching = false;
            self.record_failure(pool, err);
        }
        drop(pools);
        self.wake.notify_one();
    }

    fn record_failure(&self, pool: &mut LanguageWorkerPool, reason: &str) {
        self.metrics
            .worker_failures
            .add(1, &[KeyValue::new("language", pool.language.clone())]);
        let now = Instant::now();
        if pool.errors.record(now) {
            let message = format!(
                "{} worker failed {} times within {:?}, automatic restarts stopped; last error: {}",
                pool.language,
                pool.errors.threshold(),
                self.config.error_window,
                reason
            );
            error!(language = %pool.language, "{}", message);
            pool.error = Some(message);
        } else {
            pool.restart_not_before = Some(now + pool.config.restart_interval());
        }
    }

    async fn handle_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::Exited {
                language,
                pool_id,
                worker_id,
                exit,
            } => {
                let mut pools = self.pools.write().await;
                let Some(pool) = pools.get_mut(&language).filter(|p| p.pool_id == pool_id) else {
                    debug!(worker_id = %worker_id, "exit from a retired worker pool");
                    return;
                };
                let Some(pos) = pool.channels.iter().position(|c| c.id() == &worker_id) else {
                    return;
                };
                let channel = pool.channels.remove(pos);
                channel.mark_terminated();
                // handshake failures are counted by the launch itself
                if channel.has_been_ready() && !channel.is_stopping() {
                    warn!(
                        worker_id = %worker_id,
                        language = %language,
                        code = ?exit.code,
                        "language worker exited unexpectedly: {}",
                        exit.reason
                    );
                    self.record_failure(pool, &exit.reason);
                } else {
                    info!(worker_id = %worker_id, language = %language, "language worker exited");
                }
                drop(pools);
                self.wake.notify_one();
            }
        }
    }

    async fn run_event_loop(self: Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<PoolEvent>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                event = events_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => return,
                }
            }
        }
    }

    async fn run_capacity_loop(self: Arc<Self>) {
        let interval = self.config.capacity_check_interval;
        loop {
            let scheduled_epoch = self.current_epoch();
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("worker capacity loop stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
                _ = self.wake.notified() => {}
            }
            if !self.run_capacity_pass(scheduled_epoch).await {
                // the restart that invalidated the tick wants workers now
                self.run_capacity_pass(self.current_epoch()).await;
            }
        }
    }

    async fn run_capacity_pass(self: &Arc<Self>, epoch: u64) -> bool {
        if self.current_epoch() != epoch {
            debug!(scheduled_epoch = epoch, "discarding stale capacity tick");
            return false;
        }
        let languages: Vec<String> = self.pools.read().await.keys().cloned().collect();
        for language in languages {
            self.ensure_capacity(&language, epoch).await;
        }
        true
    }

    /// Rebuilds each pool empty with the same target. Old workers leave the
    /// rotation at once and are stopped once their pending invocations finish
    /// or the retire grace runs out. Replacements come up through the
    /// throttled capacity loop.
    pub async fn restart_all(&self) {
        let retired = {
            let mut pools = self.pools.write().await;
            let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
            let mut retired = Vec::new();
            for pool in pools.values_mut() {
                let pool_id = self.next_pool_id.fetch_add(1, Ordering::AcqRel);
                let fresh = LanguageWorkerPool::new(
                    pool_id,
                    &pool.language,
                    pool.config.clone(),
                    pool.target,
                    self.config.error_window,
                );
                let old = std::mem::replace(pool, fresh);
                retired.extend(old.channels);
            }
            info!(epoch, workers = retired.len(), "restarting all worker pools");
            retired
        };
        let grace = self.config.retire_grace;
        for channel in retired {
            tokio::spawn(async move { channel.retire(grace).await });
        }
        self.wake.notify_one();
    }

    /// Drops pools of every language other than `keep`.
    pub async fn shutdown_languages_except(&self, keep: &str) {
        let retired = {
            let mut pools = self.pools.write().await;
            let languages: Vec<String> = pools.keys().filter(|l| *l != keep).cloned().collect();
            let mut retired = Vec::new();
            for language in languages {
                if let Some(pool) = pools.remove(&language) {
                    info!(language = %language, "shutting down worker pool");
                    retired.extend(pool.channels);
                }
            }
            retired
        };
        join_all(retired.iter().map(|c| c.terminate())).await;
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let retired = {
            let mut pools = self.pools.write().await;
            self.epoch.fetch_add(1, Ordering::AcqRel);
            pools
                .drain()
                .flat_map(|(_, pool)| pool.channels)
                .collect::<Vec<_>>()
        };
        join_all(retired.iter().map(|c| c.terminate())).await;
        info!(workers = retired.len(), "worker channel manager shut down");
    }
}
