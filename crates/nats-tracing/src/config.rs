// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use tracing::info;

pub const DEFAULT_ENV_NAME: &str = "development";
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid trace sink port {0:?}")]
    InvalidPort(String),
}

/// Command line flags; each falls back to an environment variable.
#[derive(Debug, Clone, Parser)]
#[command(disable_version_flag = true)]
pub struct Args {
    /// Service version
    #[arg(long = "version", env = "SERVICE_VERSION")]
    pub service_version: Option<String>,
    /// Service name
    #[arg(long = "service", env = "SERVICE_NAME")]
    pub service_name: Option<String>,
    /// Service instance id
    #[arg(long = "id", env = "SERVICE_ID")]
    pub service_id: Option<String>,
    /// Deployment environment
    #[arg(long = "env", env = "ENV_NAME", default_value = DEFAULT_ENV_NAME)]
    pub env_name: String,
    #[arg(long, env = "NATS_SERVER")]
    pub nats_server: Option<String>,
    #[arg(long, env = "JAEGER_AGENT_HOST")]
    pub jaeger_agent_host: Option<String>,
    #[arg(long, env = "JAEGER_AGENT_PORT")]
    pub jaeger_agent_port: Option<String>,
    #[arg(long, env = "LOG_LEVEL", default_value = DEFAULT_LOG_LEVEL)]
    pub log_level: String,
}

/// Validated process configuration. Every field is mandatory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub service_id: String,
    pub service_name: String,
    pub service_version: String,
    pub env_name: String,
    pub nats_server: String,
    pub jaeger_agent_host: String,
    pub jaeger_agent_port: String,
    pub log_level: String,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let config = Self {
            service_id: args.service_id.unwrap_or_default(),
            service_name: args.service_name.unwrap_or_default(),
            service_version: args.service_version.unwrap_or_default(),
            env_name: args.env_name,
            nats_server: args.nats_server.unwrap_or_default(),
            jaeger_agent_host: args.jaeger_agent_host.unwrap_or_default(),
            jaeger_agent_port: args.jaeger_agent_port.unwrap_or_default(),
            log_level: args.log_level.to_lowercase(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("SERVICE_ID", &self.service_id),
            ("SERVICE_NAME", &self.service_name),
            ("SERVICE_VERSION", &self.service_version),
            ("ENV_NAME", &self.env_name),
            ("NATS_SERVER", &self.nats_server),
            ("JAEGER_AGENT_HOST", &self.jaeger_agent_host),
            ("JAEGER_AGENT_PORT", &self.jaeger_agent_port),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Missing(name));
            }
        }

        match self.jaeger_agent_port.parse::<u16>() {
            Ok(port) if port > 0 => Ok(()),
            _ => Err(ConfigError::InvalidPort(self.jaeger_agent_port.clone())),
        }
    }

    /// Logs every setting at startup.
    pub fn print(&self) {
        info!("service_id: {}", self.service_id);
        info!("service_name: {}", self.service_name);
        info!("service_version: {}", self.service_version);
        info!("env_name: {}", self.env_name);
        info!("nats_server: {}", self.nats_server);
        info!("jaeger_agent_host: {}", self.jaeger_agent_host);
        info!("jaeger_agent_port: {}", self.jaeger_agent_port);
        info!("log_level: {}", self.log_level);
    }
}
