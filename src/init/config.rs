// SPDX-License-Identifier: Apache-2.0

use crate::init::exporters::ExportersConfig;
use crate::init::parse::{deser_duration, parse_endpoint};
use crate::receivers::interaction_http::DEFAULT_INTERACTION_PATH;
use crate::topology::batch::{
    BufferPolicy, BufferPolicyError, DEFAULT_BUFFER_CAPACITY, DEFAULT_BUFFER_PERIOD,
};
use crate::topology::fanout::DEFAULT_EXPORT_TIMEOUT;
use figment::Figment;
use figment::providers::{Env, Format, Yaml};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_TRACE_ADDRESS: &str = "localhost:55678";
pub const DEFAULT_INTERACTION_GRPC_ADDRESS: &str = "localhost:55679";
pub const DEFAULT_INTERACTION_HTTP_ADDRESS: &str = "localhost:55680";
pub const DEFAULT_MAX_RECV_MSG_SIZE_MIB: usize = 4;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Prefix of environment overrides. Nested keys are separated by `__`, for example
/// `OCAGENT_TRACE_ENDPOINT__ADDRESS`.
pub const ENV_PREFIX: &str = "OCAGENT_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] Box<figment::Error>),

    #[error("invalid {field} `{address}`: {reason}")]
    Address {
        field: &'static str,
        address: String,
        reason: String,
    },

    #[error("invalid buffer settings for the {endpoint} endpoint: {source}")]
    Buffer {
        endpoint: &'static str,
        #[source]
        source: BufferPolicyError,
    },

    #[error("interaction http_path must start with '/', got `{0}`")]
    HttpPath(String),

    #[error("invalid {exporter} exporter settings: {reason}")]
    Exporter {
        exporter: &'static str,
        reason: String,
    },
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        ConfigError::Parse(Box::new(e))
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    #[serde(deserialize_with = "deser_duration")]
    pub period: Duration,
    pub count: usize,
    pub capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_BUFFER_PERIOD,
            count: 0,
            capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }
}

impl BufferConfig {
    fn policy(&self, endpoint: &'static str) -> Result<BufferPolicy, ConfigError> {
        let policy = BufferPolicy {
            period: self.period,
            count: self.count,
            capacity: self.capacity,
        };
        policy
            .validate()
            .map_err(|source| ConfigError::Buffer { endpoint, source })?;
        Ok(policy)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TraceEndpointSection {
    /// Empty means the default address.
    pub address: String,
    pub max_recv_msg_size_mib: usize,
    pub buffer: BufferConfig,
}

impl Default for TraceEndpointSection {
    fn default() -> Self {
        Self {
            address: String::new(),
            max_recv_msg_size_mib: DEFAULT_MAX_RECV_MSG_SIZE_MIB,
            buffer: BufferConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct InteractionEndpointSection {
    pub enable: bool,
    pub grpc_address: String,
    pub http_address: String,
    pub http_path: String,
    pub max_recv_msg_size_mib: usize,
    pub buffer: BufferConfig,
}

impl Default for InteractionEndpointSection {
    fn default() -> Self {
        Self {
            enable: false,
            grpc_address: String::new(),
            http_address: String::new(),
            http_path: DEFAULT_INTERACTION_PATH.to_string(),
            max_recv_msg_size_mib: DEFAULT_MAX_RECV_MSG_SIZE_MIB,
            buffer: BufferConfig::default(),
        }
    }
}

/// The configuration document, as written by the operator.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    #[serde(alias = "opencensus_interceptor")]
    pub trace_endpoint: TraceEndpointSection,

    #[serde(alias = "interaction_interceptor")]
    pub interaction_endpoint: InteractionEndpointSection,

    #[serde(deserialize_with = "deser_duration")]
    pub export_timeout: Duration,

    #[serde(deserialize_with = "deser_duration")]
    pub shutdown_timeout: Duration,

    pub exporters: ExportersConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            trace_endpoint: TraceEndpointSection::default(),
            interaction_endpoint: InteractionEndpointSection::default(),
            export_timeout: DEFAULT_EXPORT_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            exporters: ExportersConfig::default(),
        }
    }
}

/// Settings of one receiver endpoint after defaults and validation were applied.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    pub address: SocketAddr,
    pub enabled: bool,
    pub policy: BufferPolicy,
    pub max_recv_msg_size_mib: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InteractionConfig {
    /// Address and buffer of the gRPC binding. The buffer is shared with HTTP.
    pub grpc: EndpointConfig,
    pub http_address: SocketAddr,
    pub http_path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub trace: EndpointConfig,
    /// `None` when the interaction endpoint is disabled.
    pub interaction: Option<InteractionConfig>,
    pub export_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub exporters: ExportersConfig,
}

impl AgentConfig {
    /// Reads the YAML file at `path` and applies `OCAGENT_*` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let mut figment = Figment::new();
        // An empty document is null in YAML, which does not extract into a struct
        if !contents.trim().is_empty() {
            figment = figment.merge(Yaml::string(contents));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        Ok(figment.extract()?)
    }

    /// Applies defaults and validates addresses and buffer policies.
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        let trace = EndpointConfig {
            address: resolve_address(
                "trace_endpoint.address",
                &self.trace_endpoint.address,
                DEFAULT_TRACE_ADDRESS,
            )?,
            enabled: true,
            policy: self.trace_endpoint.buffer.policy("trace")?,
            max_recv_msg_size_mib: self.trace_endpoint.max_recv_msg_size_mib,
        };

        let section = &self.interaction_endpoint;
        let interaction = if section.enable {
            if !section.http_path.starts_with('/') {
                return Err(ConfigError::HttpPath(section.http_path.clone()));
            }
            Some(InteractionConfig {
                grpc: EndpointConfig {
                    address: resolve_address(
                        "interaction_endpoint.grpc_address",
                        &section.grpc_address,
                        DEFAULT_INTERACTION_GRPC_ADDRESS,
                    )?,
                    enabled: true,
                    policy: section.buffer.policy("interaction")?,
                    max_recv_msg_size_mib: section.max_recv_msg_size_mib,
                },
                http_address: resolve_address(
                    "interaction_endpoint.http_address",
                    &section.http_address,
                    DEFAULT_INTERACTION_HTTP_ADDRESS,
                )?,
                http_path: section.http_path.clone(),
            })
        } else {
            None
        };

        Ok(ResolvedConfig {
            trace,
            interaction,
            export_timeout: self.export_timeout,
            shutdown_timeout: self.shutdown_timeout,
            exporters: self.exporters.clone(),
        })
    }
}

fn resolve_address(
    field: &'static str,
    configured: &str,
    default: &str,
) -> Result<SocketAddr, ConfigError> {
    let address = match configured.trim() {
        "" => default,
        explicit => explicit,
    };
    parse_endpoint(address).map_err(|e| ConfigError::Address {
        field,
        address: address.to_string(),
        reason: e.to_string(),
    })
}
