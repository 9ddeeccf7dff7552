// SPDX-License-Identifier: Apache-2.0

use crate::exporters::Sink;
use crate::exporters::blackhole::BlackholeExporter;
use crate::exporters::debug::{DebugExporter, Verbosity};
use crate::exporters::otlp::{DEFAULT_OTLP_TIMEOUT, OtlpExporter};
use crate::init::config::ConfigError;
use crate::init::parse::deser_duration;
use serde::Deserialize;
use std::time::Duration;
use tracing::info;

/// The `exporters` section. Each present key enables one exporter.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExportersConfig {
    pub debug: Option<DebugExporterConfig>,
    pub blackhole: Option<BlackholeExporterConfig>,
    pub otlp: Option<OtlpExporterConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugExporterConfig {
    pub verbosity: Verbosity,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct BlackholeExporterConfig {}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct OtlpExporterConfig {
    pub endpoint: String,
    #[serde(deserialize_with = "deser_duration")]
    pub timeout: Duration,
    pub gzip: bool,
}

impl Default for OtlpExporterConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:4317".to_string(),
            timeout: DEFAULT_OTLP_TIMEOUT,
            gzip: true,
        }
    }
}

impl ExportersConfig {
    pub fn is_empty(&self) -> bool {
        self.debug.is_none() && self.blackhole.is_none() && self.otlp.is_none()
    }
}

/// Constructs one sink per configured exporter, in a fixed order: debug, blackhole, otlp.
pub fn build_exporters(config: &ExportersConfig) -> Result<Vec<Box<dyn Sink>>, ConfigError> {
    let mut exporters: Vec<Box<dyn Sink>> = Vec::new();

    if let Some(debug) = &config.debug {
        exporters.push(Box::new(DebugExporter::new(debug.verbosity)));
    }
    if config.blackhole.is_some() {
        exporters.push(Box::new(BlackholeExporter::new()));
    }
    if let Some(otlp) = &config.otlp {
        let exp = OtlpExporter::new(&otlp.endpoint, otlp.timeout, otlp.gzip).map_err(|e| {
            ConfigError::Exporter {
                exporter: "otlp",
                reason: e.to_string(),
            }
        })?;
        info!(endpoint = %otlp.endpoint, "Configured OTLP exporter.");
        exporters.push(Box::new(exp));
    }

    Ok(exporters)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn builds_configured_exporters_in_order() {
        let config = ExportersConfig {
            debug: Some(DebugExporterConfig::default()),
            blackhole: Some(BlackholeExporterConfig {}),
            otlp: Some(OtlpExporterConfig::default()),
        };
        let exporters = build_exporters(&config).unwrap();
        let names: Vec<&str> = exporters.iter().map(|e| e.name()).collect();
        assert_eq!(vec!["debug", "blackhole", "otlp"], names);
    }

    #[test]
    fn no_exporters() {
        let config = ExportersConfig::default();
        assert!(config.is_empty());
        assert!(build_exporters(&config).unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_otlp_endpoint_is_a_config_error() {
        let config = ExportersConfig {
            otlp: Some(OtlpExporterConfig {
                endpoint: "not a uri".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };
        match build_exporters(&config) {
            Err(ConfigError::Exporter { exporter, .. }) => assert_eq!("otlp", exporter),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("should have failed"),
        }
    }
}
