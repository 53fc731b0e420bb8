use std::{
    collections::{HashMap, HashSet},
    future::Future,
    ops::Deref,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
        Mutex,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use data_model::{
    test_objects::tests::{mock_functions, TEST_LANGUAGE, TEST_OTHER_LANGUAGE},
    HostMode,
    InvocationRequest,
    WorkerId,
};
use tempfile::TempDir;
use tokio::{sync::oneshot, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::subscriber;
use tracing_subscriber::{layer::SubscriberExt, Layer};

use crate::{
    config::{
        DrainConfig,
        HostConfig,
        LanguageWorkerConfig,
        MetricsPublisherConfig,
        ServerConfig,
    },
    host::{builder::FUNCTION_METADATA_FILE, HostBuildRequest, HostBuilder, ScriptHost, ScriptHostBuilder},
    service::Service,
    workers::{
        process::{InvokeError, SpawnedWorker, WorkerExit, WorkerProcess},
        WorkerLaunch,
        WorkerManagerConfig,
        WorkerProcessFactory,
    },
};

pub fn init_test_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"));
    let _ = subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_filter(env_filter)),
    );
}

/// Polls `check` every 10ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(anyhow!("condition not met within {:?}", timeout));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn write_function(script_root: &Path, name: &str, trigger: &str) -> Result<()> {
    let dir = script_root.join(name);
    std::fs::create_dir_all(&dir)?;
    let metadata = serde_json::json!({
        "bindings": [
            {"type": trigger, "direction": "in", "name": "input"},
            {"type": "http", "direction": "out", "name": "$return"}
        ],
        "scriptFile": "index.js"
    });
    std::fs::write(dir.join(FUNCTION_METADATA_FILE), serde_json::to_vec_pretty(&metadata)?)?;
    std::fs::write(
        dir.join("index.js"),
        "module.exports = async function (context) { return context; };",
    )?;
    Ok(())
}

pub fn fake_worker_config(process_count: usize, startup_interval: Duration) -> LanguageWorkerConfig {
    LanguageWorkerConfig {
        process_count,
        process_startup_interval_ms: startup_interval.as_millis() as u64,
        process_restart_interval_ms: 50,
        process_shutdown_timeout_ms: 1_000,
        handshake_timeout_ms: 5_000,
        ..LanguageWorkerConfig::new("fake-worker")
    }
}

pub fn test_manager_config(process_count: usize, startup_interval: Duration) -> WorkerManagerConfig {
    WorkerManagerConfig {
        workers: HashMap::from([
            (
                TEST_LANGUAGE.to_string(),
                fake_worker_config(process_count, startup_interval),
            ),
            (
                TEST_OTHER_LANGUAGE.to_string(),
                fake_worker_config(process_count, startup_interval),
            ),
        ]),
        error_window: Duration::from_secs(600),
        capacity_check_interval: Duration::from_millis(20),
        script_root: PathBuf::from("/tmp"),
        retire_grace: Duration::from_secs(30),
    }
}

/// In-process worker. Payload `{"sleep_ms": n}` delays the reply,
/// `{"fail": true}` makes the function fail; anything else is echoed.
pub struct FakeWorker {
    exit_tx: Mutex<Option<oneshot::Sender<WorkerExit>>>,
    killed: AtomicBool,
    gone: CancellationToken,
}

impl FakeWorker {
    fn exit(&self, exit: WorkerExit) {
        self.gone.cancel();
        if let Some(tx) = self.exit_tx.lock().unwrap().take() {
            let _ = tx.send(exit);
        }
    }
}

#[async_trait::async_trait]
impl WorkerProcess for FakeWorker {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn wait_ready(&self, _timeout: Duration) -> Result<()> {
        if self.gone.is_cancelled() {
            return Err(anyhow!("worker exited before handshake"));
        }
        Ok(())
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<serde_json::Value, InvokeError> {
        if self.gone.is_cancelled() {
            return Err(InvokeError::Transport("worker is gone".to_string()));
        }
        if let Some(ms) = request.payload.get("sleep_ms").and_then(|v| v.as_u64()) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                _ = self.gone.cancelled() => {
                    return Err(InvokeError::Transport("worker exited mid-invocation".to_string()));
                }
            }
        }
        if request.payload.get("fail").and_then(|v| v.as_bool()) == Some(true) {
            return Err(InvokeError::Function("function raised an error".to_string()));
        }
        Ok(request.payload.clone())
    }

    async fn kill(&self) -> Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.exit(WorkerExit::new(None, "killed"));
        Ok(())
    }
}

struct FakeSpawn {
    language: String,
    worker_id: WorkerId,
    at: Instant,
}

#[derive(Default)]
pub struct FakeWorkerFactory {
    spawns: Mutex<Vec<FakeSpawn>>,
    attempts: Mutex<HashMap<String, usize>>,
    failing: Mutex<HashSet<String>>,
    workers: Mutex<HashMap<WorkerId, Arc<FakeWorker>>>,
}

impl FakeWorkerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_spawns(&self, language: &str, fail: bool) {
        let mut failing = self.failing.lock().unwrap();
        if fail {
            failing.insert(language.to_string());
        } else {
            failing.remove(language);
        }
    }

    /// Successful spawns across all languages.
    pub fn spawn_count(&self) -> usize {
        self.spawns.lock().unwrap().len()
    }

    pub fn spawn_attempts(&self, language: &str) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(language)
            .copied()
            .unwrap_or_default()
    }

    pub fn spawn_times(&self, language: &str) -> Vec<Instant> {
        self.spawns
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.language == language)
            .map(|s| s.at)
            .collect()
    }

    pub fn spawn_time(&self, worker_id: &WorkerId) -> Option<Instant> {
        self.spawns
            .lock()
            .unwrap()
            .iter()
            .find(|s| &s.worker_id == worker_id)
            .map(|s| s.at)
    }

    /// Simulates the worker process dying on its own.
    pub fn crash(&self, worker_id: &WorkerId) {
        let worker = self.workers.lock().unwrap().get(worker_id).cloned();
        if let Some(worker) = worker {
            worker.exit(WorkerExit::new(Some(1), "crashed"));
        }
    }

    pub fn was_killed(&self, worker_id: &WorkerId) -> bool {
        self.workers
            .lock()
            .unwrap()
            .get(worker_id)
            .is_some_and(|w| w.killed.load(Ordering::SeqCst))
    }
}

#[async_trait::async_trait]
impl WorkerProcessFactory for FakeWorkerFactory {
    async fn spawn(&self, launch: WorkerLaunch) -> Result<SpawnedWorker> {
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(launch.language.clone())
            .or_default() += 1;
        if self.failing.lock().unwrap().contains(&launch.language) {
            return Err(anyhow!("unable to start {} worker", launch.language));
        }
        let (exit_tx, exited) = oneshot::channel();
        let worker = Arc::new(FakeWorker {
            exit_tx: Mutex::new(Some(exit_tx)),
            killed: AtomicBool::new(false),
            gone: CancellationToken::new(),
        });
        self.workers
            .lock()
            .unwrap()
            .insert(launch.worker_id.clone(), worker.clone());
        self.spawns.lock().unwrap().push(FakeSpawn {
            language: launch.language,
            worker_id: launch.worker_id,
            at: Instant::now(),
        });
        Ok(SpawnedWorker {
            process: worker,
            exited,
        })
    }
}

/// Host builder that serves the mock functions without touching disk.
#[derive(Default)]
pub struct FakeHostBuilder {
    build_delay: Mutex<Duration>,
    fail_next: AtomicU32,
    attempts: AtomicU32,
    builds: Mutex<HashMap<HostMode, u64>>,
    finished: Mutex<Vec<u64>>,
}

impl FakeHostBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_build_delay(&self, delay: Duration) {
        *self.build_delay.lock().unwrap() = delay;
    }

    /// The next `count` build attempts fail.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn build_count(&self, mode: HostMode) -> u64 {
        self.builds
            .lock()
            .unwrap()
            .get(&mode)
            .copied()
            .unwrap_or_default()
    }

    pub fn finished_before(&self, first: u64, second: u64) -> bool {
        let finished = self.finished.lock().unwrap();
        let a = finished.iter().position(|g| *g == first);
        let b = finished.iter().position(|g| *g == second);
        matches!((a, b), (Some(a), Some(b)) if a < b)
    }
}

#[async_trait::async_trait]
impl HostBuilder for FakeHostBuilder {
    async fn build(&self, request: HostBuildRequest) -> Result<ScriptHost> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = *self.build_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failed = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(anyhow!("injected build failure"));
        }
        *self.builds.lock().unwrap().entry(request.mode).or_default() += 1;
        self.finished.lock().unwrap().push(request.generation);
        let functions = match request.mode {
            HostMode::Standby => Vec::new(),
            HostMode::Specialized => mock_functions(),
        };
        Ok(ScriptHost::new(
            request.generation,
            request.mode,
            request.worker_runtime().map(str::to_string),
            request.script_root,
            functions,
            request.load_context,
        ))
    }
}

pub struct TestService {
    pub service: Service,
    pub factory: Arc<FakeWorkerFactory>,
    pub temp_dir: TempDir,
}

impl Deref for TestService {
    type Target = Service;

    fn deref(&self) -> &Self::Target {
        &self.service
    }
}

impl TestService {
    pub fn test_config(root: &Path, placeholder_mode: bool) -> ServerConfig {
        ServerConfig {
            script_root: root.join("functions"),
            placeholder_mode,
            worker_runtime: (!placeholder_mode).then(|| TEST_LANGUAGE.to_string()),
            workers: HashMap::from([
                (
                    TEST_LANGUAGE.to_string(),
                    fake_worker_config(1, Duration::from_millis(10)),
                ),
                (
                    TEST_OTHER_LANGUAGE.to_string(),
                    fake_worker_config(1, Duration::from_millis(10)),
                ),
            ]),
            capacity_check_interval_ms: 20,
            host: HostConfig {
                max_build_attempts: 3,
                backoff_min_ms: 10,
                backoff_max_ms: 100,
                restart_grace_period_ms: 5_000,
                dispatch_timeout_ms: 5_000,
                file_watch_interval_ms: 0,
            },
            drain: DrainConfig {
                drain_timeout_ms: 2_000,
                ..Default::default()
            },
            metrics_publisher: MetricsPublisherConfig {
                metrics_path: Some(root.join("metrics")),
                publish_interval_ms: 1_000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Wires a service without booting it.
    pub fn new(
        configure: impl FnOnce(&mut ServerConfig),
        placeholder_mode: bool,
        builder: Arc<dyn HostBuilder>,
    ) -> Result<Self> {
        init_test_tracing();
        let temp_dir = tempfile::tempdir()?;
        let functions = temp_dir.path().join("functions");
        write_function(&functions, "http_fn", "httpTrigger")?;
        write_function(&functions, "timer_fn", "timerTrigger")?;

        let mut config = Self::test_config(temp_dir.path(), placeholder_mode);
        configure(&mut config);
        let factory = Arc::new(FakeWorkerFactory::new());
        let service = Service::with_components(config, factory.clone(), builder)?;
        Ok(Self {
            service,
            factory,
            temp_dir,
        })
    }

    pub async fn specialized() -> Result<Self> {
        let service = Self::new(|_| {}, false, Arc::new(ScriptHostBuilder::new()))?;
        service.orchestrator.boot().await?;
        Ok(service)
    }

    pub async fn placeholder() -> Result<Self> {
        let service = Self::new(|_| {}, true, Arc::new(ScriptHostBuilder::new()))?;
        service.orchestrator.boot().await?;
        Ok(service)
    }
}
