// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process wiring shared by the publisher and subscriber binaries.
//!
//! ```text
//! Process::start ── tracer provider, `main` span, connection event observer
//!      │
//!      ├─ run_publisher / run_subscriber ── connect, then LifecycleCoordinator
//!      │
//! Process::finish ─ end `main`, stop observer, shut down the provider
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::trace::{TraceContextExt, Tracer, TracerProvider as _};
use opentelemetry::Context;
use opentelemetry_otlp::ExporterBuildError;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::bus::{BoxError, BusError, Connector, Message, SubscribeOptions};
use crate::config::Config;
use crate::events::{observe_connection_events, ConnectionEvent, EventBus};
use crate::lifecycle::{LifecycleCoordinator, RunError};
use crate::publisher::{Publisher, DEFAULT_PUBLISH_PERIOD};
use crate::service::{init_tracer_provider, ServiceContext, ServiceIdentity};
use crate::subscriber::{MessageHandler, SubscribeError, Subscriber};
use crate::util::record_failure;

pub const PUBLISH_SUBJECT: &str = "ORDERS.test";
pub const SUBSCRIBE_PATTERN: &str = "ORDERS.*";
pub const CONSUMER_ID: &str = "test-id";
pub const TRACE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("cannot start tracing")]
    Trace(#[source] ExporterBuildError),
    #[error("cannot connect to bus")]
    Connect(#[source] BusError),
    #[error("publisher stopped")]
    Publisher(#[source] RunError<Infallible>),
    #[error("subscriber stopped")]
    Subscriber(#[source] RunError<SubscribeError>),
    #[error("cannot shut down tracing")]
    TraceShutdown(#[source] BoxError),
}

/// Tracing state of one process run.
pub struct Process {
    service: ServiceContext,
    provider: SdkTracerProvider,
    main: Context,
    events: Sender<ConnectionEvent>,
    observer: JoinHandle<()>,
    observer_cancel: CancellationToken,
}

impl Process {
    /// Starts tracing towards the configured trace sink.
    pub fn start(config: &Config, scope: &'static str) -> Result<Self, AppError> {
        let identity = ServiceIdentity::from_config(config);
        let provider = init_tracer_provider(config, &identity).map_err(AppError::Trace)?;
        Ok(Self::with_provider(identity, provider, scope))
    }

    /// Needs a runtime: the connection event observer is spawned here.
    pub fn with_provider(
        identity: ServiceIdentity,
        provider: SdkTracerProvider,
        scope: &'static str,
    ) -> Self {
        let tracer = provider.tracer(scope);
        let main = Context::new().with_span(tracer.start("main"));

        let (event_bus, events) = EventBus::new();
        let observer_cancel = CancellationToken::new();
        let observer = tokio::spawn(observe_connection_events(
            event_bus,
            tracer.clone(),
            main.clone(),
            observer_cancel.clone(),
        ));

        Self {
            service: ServiceContext::new(identity, tracer),
            provider,
            main,
            events,
            observer,
            observer_cancel,
        }
    }

    #[must_use]
    pub fn service(&self) -> &ServiceContext {
        &self.service
    }

    /// Context with the process-level `main` span active.
    #[must_use]
    pub fn context(&self) -> Context {
        self.main.clone()
    }

    #[must_use]
    pub fn events(&self) -> Sender<ConnectionEvent> {
        self.events.clone()
    }

    /// Ends the `main` span, recording `outcome` on it, and flushes every span
    /// within [`TRACE_SHUTDOWN_TIMEOUT`].
    pub async fn finish(self, outcome: &Result<(), AppError>) -> Result<(), AppError> {
        let provider = self.close(outcome).await;
        shutdown_provider(provider).await
    }

    async fn close(self, outcome: &Result<(), AppError>) -> SdkTracerProvider {
        let Self {
            service: _,
            provider,
            main,
            events,
            observer,
            observer_cancel,
        } = self;

        if let Err(e) = outcome {
            record_failure(&main, e);
        }
        main.span().end();

        drop(events);
        observer_cancel.cancel();
        if let Err(e) = observer.await {
            error!("Connection event observer failed: {e}");
        }
        provider
    }
}

/// The SDK shutdown blocks on the exporter, so it runs off the async workers.
async fn shutdown_provider(provider: SdkTracerProvider) -> Result<(), AppError> {
    let shutdown = tokio::task::spawn_blocking(move || provider.shutdown());
    match tokio::time::timeout(TRACE_SHUTDOWN_TIMEOUT, shutdown).await {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(e))) => Err(AppError::TraceShutdown(Box::new(e))),
        Ok(Err(e)) => Err(AppError::TraceShutdown(Box::new(e))),
        Err(e) => Err(AppError::TraceShutdown(Box::new(e))),
    }
}

/// Connects, then publishes an event every 500 ms until `shutdown` resolves.
pub async fn run_publisher<S>(
    server: &str,
    connector: &dyn Connector,
    process: &Process,
    shutdown: S,
) -> Result<(), AppError>
where
    S: Future<Output = io::Result<()>> + Send + 'static,
{
    let bus = connector
        .connect(server, process.events())
        .await
        .map_err(AppError::Connect)?;

    let publisher = Publisher::new(bus, process.service().clone());
    let cx = process.context();
    LifecycleCoordinator::new()
        .run(shutdown, move |cancel| async move {
            publisher
                .run_publish_loop(cancel, cx, PUBLISH_SUBJECT, DEFAULT_PUBLISH_PERIOD)
                .await;
            Ok(())
        })
        .await
        .map_err(AppError::Publisher)
}

/// Connects, then consumes `ORDERS.*` as consumer `test-id` until `shutdown`
/// resolves or the subscription fails.
pub async fn run_subscriber<S>(
    server: &str,
    connector: &dyn Connector,
    process: &Process,
    handler: impl MessageHandler + 'static,
    shutdown: S,
) -> Result<(), AppError>
where
    S: Future<Output = io::Result<()>> + Send + 'static,
{
    let bus = connector
        .connect(server, process.events())
        .await
        .map_err(AppError::Connect)?;

    let subscriber = Subscriber::new(bus, process.service().clone());
    let cx = process.context();
    LifecycleCoordinator::new()
        .run(shutdown, move |cancel| async move {
            let options = SubscribeOptions::default();
            subscriber
                .subscribe(cancel, cx, SUBSCRIBE_PATTERN, CONSUMER_ID, &handler, &options)
                .await
        })
        .await
        .map_err(AppError::Subscriber)
}

/// Logs every received payload.
pub struct LogPayload;

#[async_trait]
impl MessageHandler for LogPayload {
    async fn handle(&self, _cx: &Context, message: &Message) -> Result<(), BoxError> {
        debug!(
            subject = %message.subject,
            payload = %String::from_utf8_lossy(&message.payload),
            "Received message"
        );
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::bus::memory::{MemoryBus, MemoryConnector};
    use crate::testing::{identity, provider};
    use opentelemetry::trace::{SpanKind, Status};
    use opentelemetry_sdk::trace::InMemorySpanExporter;

    fn traced_process(scope: &'static str) -> (Process, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::default();
        let identity = identity();
        let provider = provider(&identity, &exporter);
        (Process::with_provider(identity, provider, scope), exporter)
    }

    #[tokio::test]
    async fn test_connect_failure_opens_no_subscription() {
        let bus = MemoryBus::new();
        let connector = MemoryConnector::refusing(bus.clone());
        let (process, _exporter) = traced_process("sub");

        let result = run_subscriber(
            "nats://localhost:4222",
            &connector,
            &process,
            LogPayload,
            std::future::pending(),
        )
        .await;

        assert!(matches!(result, Err(AppError::Connect(_))));
        assert_eq!(result.as_ref().unwrap_err().to_string(), "cannot connect to bus");
        assert_eq!(bus.subscribe_calls(), 0);
        process.finish(&result).await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_publishes_nothing() {
        let bus = MemoryBus::new();
        let connector = MemoryConnector::refusing(bus.clone());
        let (process, _exporter) = traced_process("pub");

        let result = run_publisher(
            "nats://localhost:4222",
            &connector,
            &process,
            std::future::pending(),
        )
        .await;

        assert!(matches!(result, Err(AppError::Connect(_))));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_close_records_failure_on_main_span() {
        let (process, exporter) = traced_process("pub");
        let main_id = process.context().span().span_context().span_id();
        let outcome = Err(AppError::Connect(BusError::Closed));

        let _provider = process.close(&outcome).await;

        let spans = exporter.get_finished_spans().unwrap();
        let main = spans.iter().find(|s| s.name == "main").unwrap();
        assert_eq!(main.span_context.span_id(), main_id);
        assert_eq!(
            main.status,
            Status::error("cannot connect to bus: subscription closed")
        );
    }

    #[tokio::test]
    async fn test_finish_shuts_down_provider() {
        let (process, _exporter) = traced_process("pub");

        process.finish(&Ok(())).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_stops_on_shutdown() {
        let bus = MemoryBus::new();
        let connector = MemoryConnector::new(bus.clone());
        let (process, exporter) = traced_process("pub");
        let shutdown = async {
            tokio::time::sleep(Duration::from_millis(1200)).await;
            Ok::<(), io::Error>(())
        };

        let result = run_publisher("nats://localhost:4222", &connector, &process, shutdown).await;

        assert!(result.is_ok());
        assert_eq!(bus.published().len(), 3);
        let _provider = process.close(&result).await;
        let producers = exporter
            .get_finished_spans()
            .unwrap()
            .into_iter()
            .filter(|s| s.span_kind == SpanKind::Producer)
            .count();
        assert_eq!(producers, 3);
    }
}
