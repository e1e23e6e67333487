// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-process handles passed to every loop instead of global singletons.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry_otlp::{ExporterBuildError, SpanExporter, WithExportConfig};
use opentelemetry_sdk::trace::{SdkTracer, SdkTracerProvider};
use opentelemetry_sdk::Resource;

use crate::config::Config;
use crate::propagation::{default_propagator, SharedPropagator};

/// Timeout of a single export request to the trace sink.
pub const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

const OTLP_TRACES_PATH: &str = "/v1/traces";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub id: String,
    pub name: String,
    pub version: String,
    pub env: String,
}

impl ServiceIdentity {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            id: config.service_id.clone(),
            name: config.service_name.clone(),
            version: config.service_version.clone(),
            env: config.env_name.clone(),
        }
    }

    /// Attributes attached to every exported batch.
    #[must_use]
    pub fn resource(&self) -> Resource {
        Resource::builder_empty()
            .with_attributes([
                KeyValue::new("service.name", self.name.clone()),
                KeyValue::new("deployment.environment", self.env.clone()),
                KeyValue::new("service.version", self.version.clone()),
                KeyValue::new("service.instance.id", self.id.clone()),
            ])
            .build()
    }
}

/// OTLP/HTTP collector endpoint, `http://{host}:{port}/v1/traces`.
#[must_use]
pub fn trace_endpoint(host: &str, port: &str) -> String {
    format!("http://{host}:{port}{OTLP_TRACES_PATH}")
}

/// Starts the batching span pipeline exporting to the configured trace sink.
pub fn init_tracer_provider(
    config: &Config,
    identity: &ServiceIdentity,
) -> Result<SdkTracerProvider, ExporterBuildError> {
    build_tracer_provider(
        trace_endpoint(&config.jaeger_agent_host, &config.jaeger_agent_port),
        identity,
    )
}

fn build_tracer_provider(
    endpoint: String,
    identity: &ServiceIdentity,
) -> Result<SdkTracerProvider, ExporterBuildError> {
    let exporter = SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .with_timeout(EXPORT_TIMEOUT)
        .build()?;

    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(identity.resource())
        .build())
}

#[derive(Clone)]
pub struct ServiceContext {
    tracer: SdkTracer,
    propagator: SharedPropagator,
    logger: tracing::Span,
    identity: Arc<ServiceIdentity>,
}

impl ServiceContext {
    /// Uses the W3C TraceContext and Baggage propagators.
    #[must_use]
    pub fn new(identity: ServiceIdentity, tracer: SdkTracer) -> Self {
        Self::with_propagator(identity, tracer, Arc::new(default_propagator()))
    }

    #[must_use]
    pub fn with_propagator(
        identity: ServiceIdentity,
        tracer: SdkTracer,
        propagator: SharedPropagator,
    ) -> Self {
        let logger = tracing::info_span!(
            "service",
            name = %identity.name,
            version = %identity.version,
            id = %identity.id,
        );
        Self {
            tracer,
            propagator,
            logger,
            identity: Arc::new(identity),
        }
    }

    #[must_use]
    pub fn tracer(&self) -> &SdkTracer {
        &self.tracer
    }

    #[must_use]
    pub fn propagator(&self) -> &SharedPropagator {
        &self.propagator
    }

    /// Span every log line of this service is emitted under.
    #[must_use]
    pub fn logger(&self) -> &tracing::Span {
        &self.logger
    }

    #[must_use]
    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::identity;
    use mockito::Server;
    use opentelemetry::trace::{Span, Tracer, TracerProvider as _};
    use opentelemetry::{Key, Value};

    #[test]
    fn test_resource_attributes() {
        let resource = identity().resource();

        let get = |key: &'static str| resource.get(&Key::from_static_str(key));
        assert_eq!(get("service.name"), Some(Value::from("orders")));
        assert_eq!(get("deployment.environment"), Some(Value::from("test")));
        assert_eq!(get("service.version"), Some(Value::from("1.0.0")));
        assert_eq!(get("service.instance.id"), Some(Value::from("1")));
    }

    #[test]
    fn test_endpoint_from_host_and_port() {
        assert_eq!(trace_endpoint("jaeger", "4318"), "http://jaeger:4318/v1/traces");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_shutdown_flushes_batch_to_collector() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", OTLP_TRACES_PATH)
            .match_header("content-type", "application/x-protobuf")
            .with_status(200)
            .expect_at_least(1)
            .create_async()
            .await;

        let endpoint = format!("{}{OTLP_TRACES_PATH}", server.url());
        let provider = build_tracer_provider(endpoint, &identity()).unwrap();
        provider.tracer("test").start("publish").end();

        tokio::task::spawn_blocking(move || provider.shutdown())
            .await
            .unwrap()
            .unwrap();

        mock.assert_async().await;
    }
}
