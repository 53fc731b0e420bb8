use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use anyhow::Result;
use opentelemetry::{metrics::Histogram, KeyValue};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};
use pin_project::pin_project;

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0,
    ]
}

#[must_use = "futures do nothing unless you `.await` or poll them"]
#[pin_project]
pub struct TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    #[pin]
    inner: F,
    start: Instant,
    // Option so a poll after completion does not fire the callback twice
    callback: Option<C>,
}

impl<F, C> Future for TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let poll_result = this.inner.poll(cx);

        if poll_result.is_ready() {
            let elapsed = this.start.elapsed();
            if let Some(callback) = this.callback.take() {
                callback(elapsed);
            }
        }

        poll_result
    }
}

pub fn create_timed_future<F, C>(inner: F, callback: C) -> TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    TimedFuture {
        inner,
        start: Instant::now(),
        callback: Some(callback),
    }
}

pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: &str,
    service_version: &str,
) -> Result<()> {
    if !enable_metrics {
        return Ok(());
    }

    let resource = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "funchost"))
        .with_attribute(KeyValue::new("service.name", "funchost-server"))
        .with_attribute(KeyValue::new(
            "funchost.instance.id",
            instance_id.to_string(),
        ))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ))
        .build();

    let mut exporter = MetricExporter::builder().with_tonic();
    if let Some(endpoint) = endpoint {
        exporter = exporter.with_endpoint(endpoint.to_owned());
    }
    let exporter = exporter.build()?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(interval)
        .build();

    let provider = SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build();

    opentelemetry::global::set_meter_provider(provider);
    Ok(())
}

pub mod host_stats {
    use opentelemetry::metrics::{Counter, Histogram};

    use super::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub invocations: Counter<u64>,
        pub invocation_failures: Counter<u64>,
        pub admissions_refused: Counter<u64>,
        pub worker_launches: Counter<u64>,
        pub worker_failures: Counter<u64>,
        pub host_builds: Counter<u64>,
        pub host_build_failures: Counter<u64>,
        pub invocation_latency: Histogram<f64>,
        pub host_build_latency: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("funchost-host");
            let invocations = meter
                .u64_counter("funchost.invocations")
                .with_description("number of dispatched invocations")
                .build();
            let invocation_failures = meter
                .u64_counter("funchost.invocation_failures")
                .with_description("number of invocations that failed in a worker")
                .build();
            let admissions_refused = meter
                .u64_counter("funchost.admissions_refused")
                .with_description("invocations refused because the host is draining")
                .build();
            let worker_launches = meter
                .u64_counter("funchost.worker_launches")
                .with_description("number of language worker processes launched")
                .build();
            let worker_failures = meter
                .u64_counter("funchost.worker_failures")
                .with_description("language worker start failures and unexpected exits")
                .build();
            let host_builds = meter
                .u64_counter("funchost.host_builds")
                .with_description("number of script host builds")
                .build();
            let host_build_failures = meter
                .u64_counter("funchost.host_build_failures")
                .with_description("number of failed script host build attempts")
                .build();
            let invocation_latency = meter
                .f64_histogram("funchost.invocation_latency")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("invocation latency in seconds")
                .build();
            let host_build_latency = meter
                .f64_histogram("funchost.host_build_latency")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("script host build latency in seconds")
                .build();
            Metrics {
                invocations,
                invocation_failures,
                admissions_refused,
                worker_launches,
                worker_failures,
                host_builds,
                host_build_failures,
                invocation_latency,
                host_build_latency,
            }
        }
    }
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    #[must_use]
    pub fn start(metric: &'a T) -> Self {
        Self::start_with_labels(metric, &[])
    }

    #[must_use]
    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<T: TimerUpdate + Sync> Drop for Timer<'_, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}
