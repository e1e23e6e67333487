// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Connection lifecycle events.
//!
//! The bus adapter reports connection changes on a bounded channel; one
//! observer turns each of them into a span:
//!
//! ```text
//! Connector (transport callbacks)     EventBus          observer
//!     ├─ Connected ──────────────────>│                    │
//!     ├─ Disconnected ───────────────>│ ──> MPSC ───────> span per event
//!     ├─ Reconnected ────────────────>│                    │
//!     └─ Closed ─────────────────────>│                    │
//! ```

use opentelemetry::trace::{Span as _, SpanKind, Status, Tracer as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::SdkTracer;
use tokio::sync::mpsc::{self, Sender};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::events::constants::MAX_EVENTS;

pub use constants::CONNECTED_URL_ATTRIBUTE;

mod constants;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected {
        url: String,
    },
    /// Connection lost; `error` is set when the client reported a cause.
    Disconnected {
        url: String,
        error: Option<String>,
    },
    Reconnected {
        url: String,
    },
    /// The client will not reconnect any more.
    Closed {
        url: String,
    },
}

impl ConnectionEvent {
    /// Name of the span emitted for this event.
    #[must_use]
    pub fn span_name(&self) -> &'static str {
        match self {
            ConnectionEvent::Connected { .. } => "Connect Handler",
            ConnectionEvent::Disconnected { .. } => "Disconnect Error Handler",
            ConnectionEvent::Reconnected { .. } => "Reconnect Handler",
            ConnectionEvent::Closed { .. } => "Closed Handler",
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        match self {
            ConnectionEvent::Connected { url }
            | ConnectionEvent::Disconnected { url, .. }
            | ConnectionEvent::Reconnected { url }
            | ConnectionEvent::Closed { url } => url,
        }
    }
}

#[allow(clippy::module_name_repetitions)]
pub struct EventBus {
    pub rx: mpsc::Receiver<ConnectionEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> (EventBus, Sender<ConnectionEvent>) {
        let (tx, rx) = mpsc::channel(MAX_EVENTS);
        (EventBus { rx }, tx)
    }
}

/// Emits one span per connection event, as children of `cx`, until every
/// sender is gone or `cancel` fires.
pub async fn observe_connection_events(
    mut event_bus: EventBus,
    tracer: SdkTracer,
    cx: Context,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = event_bus.rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        record_event(&tracer, &cx, &event);
    }

    // events already queued still get their span
    while let Ok(event) = event_bus.rx.try_recv() {
        record_event(&tracer, &cx, &event);
    }
    debug!("Connection event observer stopped");
}

fn record_event(tracer: &SdkTracer, cx: &Context, event: &ConnectionEvent) {
    debug!("Connection event: {event:?}");

    let mut span = tracer
        .span_builder(event.span_name())
        .with_kind(SpanKind::Internal)
        .with_attributes([KeyValue::new(CONNECTED_URL_ATTRIBUTE, event.url().to_string())])
        .start_with_context(tracer, cx);
    if let ConnectionEvent::Disconnected {
        error: Some(error), ..
    } = event
    {
        span.add_event(
            "exception",
            vec![KeyValue::new("exception.message", error.clone())],
        );
        span.set_status(Status::error(error.clone()));
    }
    span.end();
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::{identity, provider};
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::trace::InMemorySpanExporter;

    #[tokio::test]
    async fn test_observer_emits_span_per_event() {
        let exporter = InMemorySpanExporter::default();
        let provider = provider(&identity(), &exporter);
        let (event_bus, tx) = EventBus::new();
        let url = "nats://localhost:4222".to_string();

        tx.send(ConnectionEvent::Connected { url: url.clone() })
            .await
            .unwrap();
        tx.send(ConnectionEvent::Disconnected {
            url: url.clone(),
            error: Some("broken pipe".to_string()),
        })
        .await
        .unwrap();
        tx.send(ConnectionEvent::Reconnected { url: url.clone() })
            .await
            .unwrap();
        tx.send(ConnectionEvent::Closed { url: url.clone() })
            .await
            .unwrap();
        drop(tx);

        observe_connection_events(
            event_bus,
            provider.tracer("events"),
            Context::new(),
            CancellationToken::new(),
        )
        .await;

        let spans = exporter.get_finished_spans().unwrap();
        let names: Vec<&str> = spans.iter().map(|s| s.name.as_ref()).collect();
        assert_eq!(
            names,
            vec![
                "Connect Handler",
                "Disconnect Error Handler",
                "Reconnect Handler",
                "Closed Handler"
            ]
        );
        assert!(spans
            .iter()
            .all(|s| s.attributes == vec![KeyValue::new(CONNECTED_URL_ATTRIBUTE, url.clone())]));
        assert_eq!(spans[1].status, Status::error("broken pipe"));
        assert_eq!(spans[1].events.events[0].name, "exception");
    }

    #[tokio::test]
    async fn test_observer_stops_on_cancel() {
        let exporter = InMemorySpanExporter::default();
        let provider = provider(&identity(), &exporter);
        let (event_bus, _tx) = EventBus::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        observe_connection_events(event_bus, provider.tracer("events"), Context::new(), cancel)
            .await;

        assert!(exporter.get_finished_spans().unwrap().is_empty());
    }
}
