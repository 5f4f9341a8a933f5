use std::time::{Duration, Instant};

use anyhow::Result;
use opentelemetry::{
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_otlp::{MetricExporter, WithExportConfig};
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};

pub fn low_latency_boundaries() -> Vec<f64> {
    vec![
        0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0,
        500.0, 750.0, 1000.0,
    ]
}

pub fn init_provider(
    enable_metrics: bool,
    endpoint: Option<&String>,
    interval: Duration,
    instance_id: Option<&String>,
    service_version: &str,
) -> Result<()> {
    if !enable_metrics {
        return Ok(());
    }

    let mut resource_builder = Resource::builder()
        .with_attribute(KeyValue::new("service.namespace", "safety-net"))
        .with_attribute(KeyValue::new("service.name", "safety-net-server"))
        .with_attribute(KeyValue::new(
            "service.version",
            service_version.to_string(),
        ));

    if let Some(instance_id) = instance_id {
        resource_builder = resource_builder.with_attribute(KeyValue::new(
            "service.instance.id",
            instance_id.to_owned(),
        ));
    }

    let resource = resource_builder.build();

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
    tracing::info!(?interval, "otlp metrics exporter initialized");
    Ok(())
}

pub trait TimerUpdate {
    fn add(&self, duration: Duration, labels: &[KeyValue]);
}

impl TimerUpdate for Histogram<f64> {
    fn add(&self, duration: Duration, labels: &[KeyValue]) {
        self.record(duration.as_secs_f64(), labels);
    }
}

/// Records the elapsed time into `metric` when dropped.
pub struct Timer<'a, T: TimerUpdate + Sync> {
    start: Instant,
    metric: &'a T,
    labels: &'a [KeyValue],
}

impl<'a, T: TimerUpdate + Sync> Timer<'a, T> {
    pub fn start_with_labels(metric: &'a T, labels: &'a [KeyValue]) -> Self {
        Self {
            start: Instant::now(),
            metric,
            labels,
        }
    }
}

impl<'a, T: TimerUpdate + Sync> Drop for Timer<'a, T> {
    fn drop(&mut self) {
        self.metric.add(self.start.elapsed(), self.labels);
    }
}

pub trait AutoIncrement {
    fn increment(&self, labels: &[KeyValue]);
}

impl AutoIncrement for Counter<u64> {
    fn increment(&self, labels: &[KeyValue]) {
        self.add(1, labels);
    }
}

pub mod state_store {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub state_write: Histogram<f64>,
        pub write_conflicts: Counter<u64>,
        pub write_retries: Counter<u64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("state-store");
            let state_write = meter
                .f64_histogram("safety_net.state_machine_write_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("state machine write latencies in seconds")
                .build();
            let write_conflicts = meter
                .u64_counter("safety_net.state_machine_write_conflicts")
                .with_description("conditional writes refused because the row changed")
                .build();
            let write_retries = meter
                .u64_counter("safety_net.state_machine_write_retries")
                .with_description("writes retried after a busy or timed out row lock")
                .build();
            Metrics {
                state_write,
                write_conflicts,
                write_retries,
            }
        }
    }
}

pub mod safety_net {
    use opentelemetry::metrics::{Counter, Histogram};

    use crate::low_latency_boundaries;

    #[derive(Debug)]
    pub struct Metrics {
        pub notices: Counter<u64>,
        pub notice_duration: Histogram<f64>,
        pub notice_queue_duration: Histogram<f64>,
        pub pool_risk_events: Counter<u64>,
        pub replicas_provisioned: Counter<u64>,
        pub provisioning_failures: Counter<u64>,
        pub promotions: Counter<u64>,
        pub emergency_fallbacks: Counter<u64>,
        pub emergency_failures: Counter<u64>,
        pub degraded_placements: Counter<u64>,
        pub provider_calls: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("safety-net");
            let notices = meter
                .u64_counter("safety_net.notices")
                .with_description("interruption notices handled, by kind and outcome")
                .build();
            let notice_duration = meter
                .f64_histogram("safety_net.notice_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("time from dequeue to decision for a notice")
                .build();
            let notice_queue_duration = meter
                .f64_histogram("safety_net.notice_queue_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("time a notice waited in the worker queue")
                .build();
            let pool_risk_events = meter
                .u64_counter("safety_net.pool_risk_events")
                .with_description("pool instability events recorded")
                .build();
            let replicas_provisioned = meter
                .u64_counter("safety_net.replicas_provisioned")
                .with_description("standby instances brought to active")
                .build();
            let provisioning_failures = meter
                .u64_counter("safety_net.provisioning_failures")
                .with_description("standby launches that failed after retries")
                .build();
            let promotions = meter
                .u64_counter("safety_net.promotions")
                .with_description("zero downtime standby promotions")
                .build();
            let emergency_fallbacks = meter
                .u64_counter("safety_net.emergency_fallbacks")
                .with_description("termination notices that found no standby")
                .build();
            let emergency_failures = meter
                .u64_counter("safety_net.emergency_failures")
                .with_description("emergency replacements that could not be launched")
                .build();
            let degraded_placements = meter
                .u64_counter("safety_net.degraded_placements")
                .with_description("placements made into a poisoned pool for lack of a safe one")
                .build();
            let provider_calls = meter
                .f64_histogram("safety_net.provider_call_duration")
                .with_unit("s")
                .with_boundaries(low_latency_boundaries())
                .with_description("cloud provider call latencies in seconds")
                .build();
            Metrics {
                notices,
                notice_duration,
                notice_queue_duration,
                pool_risk_events,
                replicas_provisioned,
                provisioning_failures,
                promotions,
                emergency_fallbacks,
                emergency_failures,
                degraded_placements,
                provider_calls,
            }
        }
    }
}

pub mod sweeper {
    use opentelemetry::metrics::{Counter, Histogram};

    #[derive(Debug)]
    pub struct Metrics {
        pub runs: Counter<u64>,
        pub reclaimed: Counter<u64>,
        pub cost_avoided_usd: Counter<f64>,
        pub anomalies: Counter<u64>,
        pub failures: Counter<u64>,
        pub duration: Histogram<f64>,
    }

    impl Default for Metrics {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Metrics {
        pub fn new() -> Metrics {
            let meter = opentelemetry::global::meter("reconciliation-sweeper");
            let runs = meter
                .u64_counter("safety_net.sweeps")
                .with_description("reconciliation sweeps completed")
                .build();
            let reclaimed = meter
                .u64_counter("safety_net.sweep_reclaimed")
                .with_description("standbys reclaimed by the sweeper, by cause")
                .build();
            let cost_avoided_usd = meter
                .f64_counter("safety_net.cost_avoided_usd")
                .with_description("estimated spend avoided by reclaiming false alarm standbys")
                .build();
            let anomalies = meter
                .u64_counter("safety_net.anomalies")
                .with_description("anomalies flagged for review, by kind")
                .build();
            let failures = meter
                .u64_counter("safety_net.sweep_failures")
                .with_description("per instance failures isolated during a sweep")
                .build();
            let duration = meter
                .f64_histogram("safety_net.sweep_duration")
                .with_unit("s")
                .with_description("reconciliation sweep duration in seconds")
                .build();
            Metrics {
                runs,
                reclaimed,
                cost_avoided_usd,
                anomalies,
                failures,
                duration,
            }
        }
    }
}
