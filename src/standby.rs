use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
    },
};

use anyhow::{anyhow, Result};
use data_model::{HostMode, SpecializationContext};
use funchost_utils::{delay_with_backoff, BackoffPolicy};
use futures::future::{BoxFuture, FutureExt, Shared};
use metrics::{host_stats, Timer};
use opentelemetry::KeyValue;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::{
    config::ServerConfig,
    host::{ActiveHost, HostBuildRequest, HostBuilder, LoadContextProvider, ScriptHost},
};

type SharedBuild = Shared<BoxFuture<'static, Result<Arc<ScriptHost>, Arc<anyhow::Error>>>>;

#[derive(Debug, Clone)]
pub struct SpecializationConfig {
    pub script_root: PathBuf,
    pub backoff: BackoffPolicy,
    pub max_attempts: u32,
}

impl SpecializationConfig {
    pub fn from_server_config(config: &ServerConfig) -> Self {
        Self {
            script_root: config.script_root.clone(),
            backoff: BackoffPolicy::new(
                std::time::Duration::from_millis(config.host.backoff_min_ms),
                std::time::Duration::from_millis(config.host.backoff_max_ms),
            ),
            max_attempts: config.host.max_build_attempts.max(1),
        }
    }
}

/// Builds the standby host once, turns it into a customer host exactly once,
/// and rebuilds on restart. All three kinds of build go through the same
/// build lock, so a restart queues behind an in-flight specialization.
pub struct SpecializationManager {
    config: SpecializationConfig,
    builder: Arc<dyn HostBuilder>,
    load_contexts: LoadContextProvider,
    active: Arc<ActiveHost>,
    metrics: Arc<host_stats::Metrics>,
    build_lock: tokio::sync::Mutex<()>,
    standby: OnceCell<Arc<ScriptHost>>,
    specialization: Mutex<Option<SharedBuild>>,
    next_generation: AtomicU64,
}

impl SpecializationManager {
    pub fn new(
        config: SpecializationConfig,
        builder: Arc<dyn HostBuilder>,
        active: Arc<ActiveHost>,
        metrics: Arc<host_stats::Metrics>,
    ) -> Self {
        Self {
            config,
            builder,
            load_contexts: LoadContextProvider::new(),
            active,
            metrics,
            build_lock: tokio::sync::Mutex::new(()),
            standby: OnceCell::new(),
            specialization: Mutex::new(None),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Builds the standby host the first time it is called and makes it the
    /// active host. Later calls return the same host.
    pub async fn warmup(&self) -> Result<Arc<ScriptHost>> {
        let host = self
            .standby
            .get_or_try_init(|| async {
                let _guard = self.build_lock.lock().await;
                let request = HostBuildRequest {
                    generation: self.next_generation.fetch_add(1, Ordering::AcqRel),
                    mode: HostMode::Standby,
                    script_root: self.config.script_root.clone(),
                    context: None,
                    load_context: self.load_contexts.current(),
                };
                let host = self.build_with_retry(request).await?;
                self.active.swap(host.clone());
                info!(generation = host.generation(), "standby host warmed up");
                Ok::<_, anyhow::Error>(host)
            })
            .await?;
        Ok(host.clone())
    }

    /// Turns the instance into a customer host. Every caller awaits the same
    /// build and receives the same host. A failed build may be retried by a
    /// later call.
    pub async fn specialize(
        self: &Arc<Self>,
        context: SpecializationContext,
    ) -> Result<Arc<ScriptHost>> {
        let build = {
            let mut slot = self
                .specialization
                .lock()
                .map_err(|_| anyhow!("specialization slot poisoned"))?;
            let reusable = slot
                .as_ref()
                .filter(|b| !matches!(b.peek(), Some(Err(_))))
                .cloned();
            match reusable {
                Some(build) => build,
                None => {
                    let this = self.clone();
                    let build = async move {
                        this.run_specialization(context).await.map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    // drive the build even if every caller goes away
                    tokio::spawn(build.clone());
                    *slot = Some(build.clone());
                    build
                }
            }
        };
        build
            .await
            .map_err(|err| anyhow!("specialization failed: {:#}", err))
    }

    async fn run_specialization(&self, context: SpecializationContext) -> Result<Arc<ScriptHost>> {
        let _guard = self.build_lock.lock().await;
        info!(worker_runtime = %context.worker_runtime, "specializing host");
        let host = self.build_specialized(context).await?;
        self.active.swap(host.clone());
        Ok(host)
    }

    /// Rebuilds the customer host with a fresh load context and swaps it in.
    pub async fn rebuild(&self, context: SpecializationContext) -> Result<Arc<ScriptHost>> {
        let _guard = self.build_lock.lock().await;
        info!(worker_runtime = %context.worker_runtime, "rebuilding host");
        let host = self.build_specialized(context).await?;
        self.active.swap(host.clone());
        Ok(host)
    }

    async fn build_specialized(&self, context: SpecializationContext) -> Result<Arc<ScriptHost>> {
        let script_root = context
            .script_root
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.script_root.clone());
        let request = HostBuildRequest {
            generation: self.next_generation.fetch_add(1, Ordering::AcqRel),
            mode: HostMode::Specialized,
            script_root,
            context: Some(context),
            load_context: self.load_contexts.reset(HostMode::Specialized),
        };
        self.build_with_retry(request).await
    }

    async fn build_with_retry(&self, request: HostBuildRequest) -> Result<Arc<ScriptHost>> {
        let labels = [KeyValue::new("mode", request.mode.to_string())];
        let mut attempt = 1;
        loop {
            let res = {
                let _timer = Timer::start_with_labels(&self.metrics.host_build_latency, &labels);
                self.builder.build(request.clone()).await
            };
            match res {
                Ok(host) => {
                    self.metrics.host_builds.add(1, &labels);
                    return Ok(Arc::new(host));
                }
                Err(err) => {
                    self.metrics.host_build_failures.add(1, &labels);
                    if attempt >= self.config.max_attempts {
                        error!(
                            generation = request.generation,
                            attempts = attempt,
                            "host build failed, giving up: {:?}",
                            err
                        );
                        return Err(err.context(format!(
                            "host build failed after {} attempt(s)",
                            attempt
                        )));
                    }
                    warn!(
                        generation = request.generation,
                        attempt,
                        "host build failed, retrying: {:?}",
                        err
                    );
                    delay_with_backoff(&self.config.backoff, attempt).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use data_model::test_objects::tests::mock_specialization_context;

    use super::*;
    use crate::testing::FakeHostBuilder;

    fn manager(builder: Arc<FakeHostBuilder>, max_attempts: u32) -> Arc<SpecializationManager> {
        let config = SpecializationConfig {
            script_root: PathBuf::from("/tmp"),
            backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1)),
            max_attempts,
        };
        Arc::new(SpecializationManager::new(
            config,
            builder,
            Arc::new(ActiveHost::new(Duration::from_secs(1))),
            Arc::new(host_stats::Metrics::new()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_specialize_shares_one_build() -> Result<()> {
        let builder = Arc::new(FakeHostBuilder::new());
        builder.set_build_delay(Duration::from_millis(200));
        let manager = manager(builder.clone(), 3);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.specialize(mock_specialization_context()).await })
            })
            .collect();
        let mut hosts = Vec::new();
        for handle in handles {
            hosts.push(handle.await??);
        }
        assert_eq!(builder.build_count(HostMode::Specialized), 1);
        assert!(hosts.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert!(Arc::ptr_eq(&manager.active.load().unwrap(), &hosts[0]));

        let again = manager.specialize(mock_specialization_context()).await?;
        assert!(Arc::ptr_eq(&again, &hosts[0]));
        assert_eq!(builder.build_count(HostMode::Specialized), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_specialized_host_gets_fresh_load_context() -> Result<()> {
        let builder = Arc::new(FakeHostBuilder::new());
        let manager = manager(builder, 3);
        let standby = manager.warmup().await?;
        assert_eq!(standby.mode(), HostMode::Standby);
        assert!(Arc::ptr_eq(&standby, &manager.warmup().await?));

        let specialized = manager.specialize(mock_specialization_context()).await?;
        assert_eq!(specialized.mode(), HostMode::Specialized);
        assert_ne!(
            standby.load_context().generation(),
            specialized.load_context().generation()
        );
        assert_eq!(specialized.load_context().mode(), HostMode::Specialized);

        let rebuilt = manager.rebuild(mock_specialization_context()).await?;
        assert_ne!(
            rebuilt.load_context().generation(),
            specialized.load_context().generation()
        );
        assert!(rebuilt.generation() > specialized.generation());
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_retries_then_gives_up() -> Result<()> {
        let builder = Arc::new(FakeHostBuilder::new());
        builder.fail_next(10);
        let manager = manager(builder.clone(), 3);

        let res = manager.specialize(mock_specialization_context()).await;
        assert!(res.is_err());
        assert_eq!(builder.attempts(), 3);
        assert!(manager.active.lease().is_none());

        // a failed specialization can be tried again
        builder.fail_next(0);
        let host = manager.specialize(mock_specialization_context()).await?;
        assert_eq!(builder.attempts(), 4);
        assert!(manager
            .active
            .lease()
            .is_some_and(|lease| Arc::ptr_eq(lease.host(), &host)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebuild_waits_for_specialization() -> Result<()> {
        let builder = Arc::new(FakeHostBuilder::new());
        builder.set_build_delay(Duration::from_millis(500));
        let manager = manager(builder.clone(), 3);

        let specializing = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.specialize(mock_specialization_context()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let rebuilt = manager.rebuild(mock_specialization_context()).await?;
        let specialized = specializing.await??;

        assert!(rebuilt.generation() > specialized.generation());
        assert!(builder.finished_before(specialized.generation(), rebuilt.generation()));
        assert_eq!(
            manager.active.lease().map(|lease| lease.generation()),
            Some(rebuilt.generation())
        );
        Ok(())
    }
}
