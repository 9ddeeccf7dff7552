// SPDX-License-Identifier: Apache-2.0

//! Internal metrics of the agent.
//!
//! Instruments are created from an explicit [`Telemetry`] handle that the agent builds
//! once at startup, before any receiver or exporter, and shuts down last. Nothing is
//! registered globally, so several agents can run side by side in one process.
//!
//! A periodic reader collects the counters into an in-memory OTLP snapshot. The totals
//! are logged when the handle shuts down and can be read at any time with
//! [`Telemetry::counter_total`].

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Meter, MeterProvider};
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::common::v1::KeyValue as ProtoKeyValue;
use opentelemetry_proto::tonic::common::v1::any_value::Value as AnyValueKind;
use opentelemetry_proto::tonic::metrics::v1::metric::Data;
use opentelemetry_proto::tonic::metrics::v1::number_data_point::Value as NumberValue;
use opentelemetry_proto::tonic::metrics::v1::{Metric, ResourceMetrics};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use opentelemetry_sdk::metrics::data::ResourceMetrics as SdkResourceMetrics;
use opentelemetry_sdk::metrics::exporter::PushMetricExporter;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider, Temporality};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

const COLLECT_INTERVAL: Duration = Duration::from_secs(10);

pub trait Counter<T> {
    fn add(&self, value: T, attributes: &[KeyValue]);
}

#[derive(Clone)]
pub enum AgentCounter<T> {
    OTELCounter(opentelemetry::metrics::Counter<T>),
    NoOpCounter,
}

impl<T> Counter<T> for AgentCounter<T> {
    fn add(&self, value: T, attributes: &[KeyValue]) {
        match self {
            AgentCounter::OTELCounter(c) => c.add(value, attributes),
            AgentCounter::NoOpCounter => {}
        }
    }
}

/// Keeps the latest cumulative collection, converted to OTLP.
#[derive(Clone, Default)]
struct SnapshotExporter {
    latest: Arc<Mutex<Vec<ResourceMetrics>>>,
}

impl SnapshotExporter {
    fn metrics(&self) -> Vec<Metric> {
        let latest = match self.latest.lock() {
            Ok(latest) => latest,
            Err(_) => return Vec::new(),
        };
        latest
            .iter()
            .flat_map(|rm| rm.scope_metrics.iter())
            .flat_map(|sm| sm.metrics.iter().cloned())
            .collect()
    }
}

impl PushMetricExporter for SnapshotExporter {
    fn export(
        &self,
        metrics: &mut SdkResourceMetrics,
    ) -> impl Future<Output = OTelSdkResult> + Send {
        let req = ExportMetricsServiceRequest::from(&*metrics);
        let res = match self.latest.lock() {
            Ok(mut latest) => {
                *latest = req.resource_metrics;
                Ok(())
            }
            Err(_) => Err(OTelSdkError::InternalFailure(
                "metrics snapshot lock poisoned".to_string(),
            )),
        };
        futures::future::ready(res)
    }

    fn force_flush(&self) -> OTelSdkResult {
        Ok(())
    }

    fn shutdown(&self) -> OTelSdkResult {
        Ok(())
    }

    fn temporality(&self) -> Temporality {
        Temporality::Cumulative
    }
}

pub struct Telemetry {
    provider: SdkMeterProvider,
    snapshot: SnapshotExporter,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        let snapshot = SnapshotExporter::default();
        let reader = PeriodicReader::builder(snapshot.clone())
            .with_interval(COLLECT_INTERVAL)
            .build();

        let provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(Resource::builder().with_service_name("ocagent").build())
            .build();
        Self { provider, snapshot }
    }

    pub fn meter(&self) -> Meter {
        self.provider.meter("ocagent")
    }

    pub fn u64_counter(
        &self,
        name: &'static str,
        description: &'static str,
        unit: &'static str,
    ) -> AgentCounter<u64> {
        AgentCounter::OTELCounter(
            self.meter()
                .u64_counter(name)
                .with_description(description)
                .with_unit(unit)
                .build(),
        )
    }

    /// Collects now and returns the cumulative total of the named counter, summed over
    /// the data points whose attributes contain every `(key, value)` of `filter`.
    pub fn counter_total(&self, name: &str, filter: &[(&str, &str)]) -> u64 {
        self.collect()
            .iter()
            .filter(|m| m.name == name)
            .map(|m| sum_points(m, filter))
            .sum()
    }

    /// Collects now and returns the cumulative total of every counter.
    pub fn counter_totals(&self) -> BTreeMap<String, u64> {
        let mut totals = BTreeMap::new();
        for metric in self.collect() {
            *totals.entry(metric.name.clone()).or_default() += sum_points(&metric, &[]);
        }
        totals
    }

    /// Logs the final counter totals and stops the reader.
    pub fn shutdown(&self) {
        let totals = self.counter_totals();
        if !totals.is_empty() {
            info!(?totals, "Internal metric totals.");
        }
        if let Err(e) = self.provider.shutdown() {
            warn!(error = %e, "Failed to shut down internal metrics provider.");
        }
    }

    fn collect(&self) -> Vec<Metric> {
        if let Err(e) = self.provider.force_flush() {
            warn!(error = %e, "Failed to collect internal metrics.");
        }
        self.snapshot.metrics()
    }
}

fn sum_points(metric: &Metric, filter: &[(&str, &str)]) -> u64 {
    let Some(Data::Sum(sum)) = &metric.data else {
        return 0;
    };
    sum.data_points
        .iter()
        .filter(|p| filter.iter().all(|(k, v)| has_attribute(&p.attributes, k, v)))
        .map(|p| match p.value {
            Some(NumberValue::AsInt(v)) => u64::try_from(v).unwrap_or_default(),
            Some(NumberValue::AsDouble(v)) => v as u64,
            None => 0,
        })
        .sum()
}

fn has_attribute(attributes: &[ProtoKeyValue], key: &str, value: &str) -> bool {
    attributes.iter().any(|kv| {
        kv.key == key
            && matches!(
                kv.value.as_ref().and_then(|v| v.value.as_ref()),
                Some(AnyValueKind::StringValue(s)) if s == value
            )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_are_collected() {
        let telemetry = Telemetry::new();
        let counter = telemetry.u64_counter("ocagent_test_total", "Test counter", "records");
        counter.add(3, &[KeyValue::new("exporter", "debug")]);
        counter.add(4, &[KeyValue::new("exporter", "otlp")]);

        assert_eq!(7, telemetry.counter_total("ocagent_test_total", &[]));
        assert_eq!(
            4,
            telemetry.counter_total("ocagent_test_total", &[("exporter", "otlp")])
        );
        assert_eq!(
            0,
            telemetry.counter_total("ocagent_test_total", &[("exporter", "blackhole")])
        );

        // cumulative across collections
        counter.add(1, &[KeyValue::new("exporter", "debug")]);
        assert_eq!(Some(&8), telemetry.counter_totals().get("ocagent_test_total"));

        telemetry.shutdown();
    }

    #[test]
    fn noop_counter_records_nothing() {
        let telemetry = Telemetry::new();
        AgentCounter::<u64>::NoOpCounter.add(1, &[]);
        assert!(telemetry.counter_totals().is_empty());
        assert_eq!(0, telemetry.counter_total("ocagent_test_total", &[]));
    }
}
