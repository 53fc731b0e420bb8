use std::{sync::Arc, time::Duration};

use data_model::{FunctionMetadata, HostState, InvocationRequest, InvocationResult, WorkerId};
use metrics::{host_stats, Timer};
use opentelemetry::KeyValue;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};

use crate::{
    config::DrainConfig,
    drain::DrainModeController,
    host::HostLease,
    lifecycle::LifecycleOrchestrator,
    metrics_publisher::MetricsPublisher,
    workers::{ChannelError, WorkerChannelManager},
};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("host is not available ({state})")]
    HostUnavailable { state: HostState },
    #[error("function {0} not found")]
    NotFound(String),
    #[error("host is draining, invocation refused")]
    AdmissionRefused,
    #[error("no {language} worker available: {message}")]
    WorkerUnavailable { language: String, message: String },
    #[error("worker {worker_id} faulted: {message}")]
    WorkerFault { worker_id: WorkerId, message: String },
    #[error("function failed on worker {worker_id}: {message}")]
    FunctionFailed { worker_id: WorkerId, message: String },
}

/// Routes one invocation: resolve the active host, pass drain admission,
/// pick a ready worker of the function's language and run it there.
pub struct FunctionDispatcher {
    orchestrator: Arc<LifecycleOrchestrator>,
    workers: Arc<WorkerChannelManager>,
    drain: DrainModeController,
    drain_config: DrainConfig,
    publisher: Arc<MetricsPublisher>,
    metrics: Arc<host_stats::Metrics>,
    dispatch_timeout: Duration,
}

impl FunctionDispatcher {
    pub fn new(
        orchestrator: Arc<LifecycleOrchestrator>,
        workers: Arc<WorkerChannelManager>,
        drain: DrainModeController,
        drain_config: DrainConfig,
        publisher: Arc<MetricsPublisher>,
        metrics: Arc<host_stats::Metrics>,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            orchestrator,
            workers,
            drain,
            drain_config,
            publisher,
            metrics,
            dispatch_timeout,
        }
    }

    pub async fn dispatch(
        &self,
        request: InvocationRequest,
    ) -> Result<InvocationResult, DispatchError> {
        let span = info_span!(
            "dispatch",
            invocation_id = %request.id,
            function = %request.function_name
        );
        self.dispatch_inner(request).instrument(span).await
    }

    async fn dispatch_inner(
        &self,
        request: InvocationRequest,
    ) -> Result<InvocationResult, DispatchError> {
        let started = Instant::now();
        let deadline = started + self.dispatch_timeout;
        // one handle for the whole invocation, even across a host swap
        let lease = self.acquire_host(deadline).await?;
        let function = lease
            .function(&request.function_name)
            .filter(|f| !f.disabled)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound(request.function_name.clone()))?;

        let drain_aware = self.drain_config.is_drain_aware(&function.trigger_type);
        let Some(_admission) = self.drain.admit(&request.id, drain_aware) else {
            self.metrics.admissions_refused.add(
                1,
                &[KeyValue::new("function", function.name.clone())],
            );
            return Err(DispatchError::AdmissionRefused);
        };

        let labels = [
            KeyValue::new("function", function.name.clone()),
            KeyValue::new("language", function.language.clone()),
        ];
        self.publisher.on_function_started();
        let res = {
            let _timer = Timer::start_with_labels(&self.metrics.invocation_latency, &labels);
            self.invoke(&function, &request, deadline).await
        };
        self.publisher.on_function_completed();
        self.metrics.invocations.add(1, &labels);

        let (worker_id, output) = res.inspect_err(|err| {
            self.metrics.invocation_failures.add(1, &labels);
            debug!("invocation failed: {}", err);
        })?;
        Ok(InvocationResult {
            invocation_id: request.id,
            function_name: function.name,
            host_generation: lease.generation(),
            worker_id,
            output,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Waits while the host is coming up or specializing; a restarting host
    /// keeps serving from the previous generation.
    async fn acquire_host(&self, deadline: Instant) -> Result<HostLease, DispatchError> {
        let mut state_rx = self.orchestrator.watch();
        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                HostState::Standby |
                HostState::Running |
                HostState::Draining |
                HostState::Restarting => {
                    if let Some(lease) = self.orchestrator.lease_active_host() {
                        return Ok(lease);
                    }
                }
                HostState::Initializing | HostState::Specializing => {}
                HostState::Offline | HostState::Error => {
                    return Err(DispatchError::HostUnavailable { state });
                }
            }
            match tokio::time::timeout_at(deadline, state_rx.changed()).await {
                Ok(Ok(())) => {}
                _ => return Err(DispatchError::HostUnavailable { state }),
            }
        }
    }

    async fn invoke(
        &self,
        function: &FunctionMetadata,
        request: &InvocationRequest,
        deadline: Instant,
    ) -> Result<(WorkerId, serde_json::Value), DispatchError> {
        let language = function.language.as_str();
        self.workers
            .ensure_language(language)
            .await
            .map_err(|err| DispatchError::WorkerUnavailable {
                language: language.to_string(),
                message: err.to_string(),
            })?;

        let mut retried = false;
        loop {
            let wait = deadline.saturating_duration_since(Instant::now());
            let Some(channel) = self.workers.wait_for_ready_channel(language, wait).await else {
                let message = self
                    .workers
                    .pool_error(language)
                    .await
                    .unwrap_or_else(|| "timed out waiting for a ready worker".to_string());
                return Err(DispatchError::WorkerUnavailable {
                    language: language.to_string(),
                    message,
                });
            };
            match channel.invoke(request).await {
                Ok(output) => return Ok((channel.id().clone(), output)),
                // work cut off by a host-initiated stop is not run a second time
                Err(err)
                    if err.is_retryable() &&
                        !retried &&
                        !(channel.is_stopping() && matches!(err, ChannelError::Faulted { .. })) =>
                {
                    warn!(worker_id = %channel.id(), "retrying invocation on another worker: {}", err);
                    retried = true;
                }
                Err(ChannelError::FunctionFailed { worker_id, message }) => {
                    return Err(DispatchError::FunctionFailed { worker_id, message });
                }
                Err(ChannelError::NotReady(worker_id)) => {
                    return Err(DispatchError::WorkerFault {
                        worker_id,
                        message: "worker is not ready".to_string(),
                    });
                }
                Err(ChannelError::Faulted { worker_id, message }) => {
                    return Err(DispatchError::WorkerFault { worker_id, message });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use data_model::test_objects::tests::{
        mock_invocation,
        TEST_HTTP_FUNCTION,
        TEST_LANGUAGE,
        TEST_TIMER_FUNCTION,
    };
    use serde_json::json;

    use super::*;
    use crate::testing::TestService;

    #[tokio::test]
    async fn test_dispatch_runs_on_worker() -> Result<()> {
        let service = TestService::specialized().await?;
        let result = service
            .dispatcher
            .dispatch(InvocationRequest::new(TEST_HTTP_FUNCTION, json!({"echo": 1})))
            .await?;
        assert_eq!(result.function_name, TEST_HTTP_FUNCTION);
        assert_eq!(result.output, json!({"echo": 1}));
        assert_eq!(
            Some(result.host_generation),
            service.orchestrator.status().await.generation
        );
        assert_eq!(service.publisher.active_function_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_function_not_found() -> Result<()> {
        let service = TestService::specialized().await?;
        let err = service
            .dispatcher
            .dispatch(mock_invocation("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(name) if name == "missing"));
        Ok(())
    }

    #[tokio::test]
    async fn test_standby_host_has_no_functions() -> Result<()> {
        let service = TestService::placeholder().await?;
        let err = service
            .dispatcher
            .dispatch(mock_invocation(TEST_HTTP_FUNCTION))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_function_failure_is_not_retried() -> Result<()> {
        let service = TestService::specialized().await?;
        let err = service
            .dispatcher
            .dispatch(InvocationRequest::new(TEST_HTTP_FUNCTION, json!({"fail": true})))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::FunctionFailed { .. }));
        // the failing worker stays in rotation
        assert_eq!(
            service
                .workers
                .pool_snapshot(TEST_LANGUAGE)
                .await
                .map(|s| s.ready_count()),
            Some(1)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_draining_refuses_only_drain_aware() -> Result<()> {
        let service = TestService::specialized().await?;
        service.drain.drain();

        let err = service
            .dispatcher
            .dispatch(mock_invocation(TEST_HTTP_FUNCTION))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::AdmissionRefused));

        let timer = service
            .dispatcher
            .dispatch(mock_invocation(TEST_TIMER_FUNCTION))
            .await?;
        assert_eq!(timer.function_name, TEST_TIMER_FUNCTION);
        Ok(())
    }

    #[tokio::test]
    async fn test_error_state_is_unavailable() -> Result<()> {
        let service = TestService::specialized().await?;
        service.orchestrator.fail(&anyhow::anyhow!("boom"));
        let err = service
            .dispatcher
            .dispatch(mock_invocation(TEST_HTTP_FUNCTION))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::HostUnavailable {
                state: HostState::Error
            }
        ));
        Ok(())
    }
}
