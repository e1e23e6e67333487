// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for unit tests.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};

use crate::service::{ServiceContext, ServiceIdentity};

pub(crate) struct Fixture {
    pub service: ServiceContext,
    pub exporter: InMemorySpanExporter,
}

impl Fixture {
    /// Spans ended so far, in end order.
    #[allow(clippy::unwrap_used)]
    pub fn spans(&self) -> Vec<SpanData> {
        self.exporter.get_finished_spans().unwrap()
    }

    #[allow(clippy::unwrap_used)]
    pub fn span(&self, name: &str) -> SpanData {
        self.spans().into_iter().find(|s| s.name == name).unwrap()
    }
}

pub(crate) fn identity() -> ServiceIdentity {
    ServiceIdentity {
        id: "1".to_string(),
        name: "orders".to_string(),
        version: "1.0.0".to_string(),
        env: "test".to_string(),
    }
}

/// A provider exporting synchronously into `exporter`.
pub(crate) fn provider(identity: &ServiceIdentity, exporter: &InMemorySpanExporter) -> SdkTracerProvider {
    SdkTracerProvider::builder()
        .with_simple_exporter(exporter.clone())
        .with_resource(identity.resource())
        .build()
}

/// A service whose spans land in an [`InMemorySpanExporter`].
pub(crate) fn fixture() -> Fixture {
    let exporter = InMemorySpanExporter::default();
    let identity = identity();
    let provider = provider(&identity, &exporter);
    let service = ServiceContext::new(identity, provider.tracer("test"));
    Fixture { service, exporter }
}
