// SPDX-License-Identifier: Apache-2.0

pub mod exporter;
pub mod transform;

pub use exporter::{DEFAULT_OTLP_TIMEOUT, OtlpExporter};
