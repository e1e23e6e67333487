// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Traced publishing.
//!
//! Every message is sent inside a producer span whose context travels in the
//! message headers, so the consumer can continue the same trace.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::bus::{Bus, BusError, Message};
use crate::header::HeaderCarrier;
use crate::service::ServiceContext;
use crate::util::{error_chain, record_failure};

pub const DEFAULT_PUBLISH_PERIOD: Duration = Duration::from_millis(500);

/// Correlation id of a published message; also the producer span's name.
pub type MessageId = String;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("bus publish failed")]
    Bus(#[source] BusError),
}

#[derive(Clone)]
pub struct Publisher {
    bus: Arc<dyn Bus>,
    service: ServiceContext,
}

impl Publisher {
    pub fn new(bus: Arc<dyn Bus>, service: ServiceContext) -> Self {
        Self { bus, service }
    }

    /// Publishes `payload` on `subject` inside a producer span that is a child
    /// of `cx`. Returns the generated message id.
    pub async fn publish(
        &self,
        cx: &Context,
        subject: &str,
        payload: Bytes,
    ) -> Result<MessageId, PublishError> {
        self.send(cx, subject, new_message_id(), payload).await
    }

    /// Publishes a message whose payload is its own id.
    pub async fn publish_event(&self, cx: &Context, subject: &str) -> Result<MessageId, PublishError> {
        let id = new_message_id();
        let payload = Bytes::from(id.clone());
        self.send(cx, subject, id, payload).await
    }

    async fn send(
        &self,
        cx: &Context,
        subject: &str,
        id: MessageId,
        payload: Bytes,
    ) -> Result<MessageId, PublishError> {
        let tracer = self.service.tracer();
        let span = tracer
            .span_builder(id.clone())
            .with_kind(SpanKind::Producer)
            .with_attributes([
                KeyValue::new("messaging.system", "nats"),
                KeyValue::new("messaging.destination.name", subject.to_string()),
                KeyValue::new("messaging.message.id", id.clone()),
            ])
            .start_with_context(tracer, cx);
        let cx = cx.with_span(span);

        let mut carrier = HeaderCarrier::new();
        self.service.propagator().inject_context(&cx, &mut carrier);

        let message = Message {
            subject: subject.to_string(),
            payload,
            headers: Some(carrier.to_native()),
        };

        let result = match self.bus.publish(message).await {
            Ok(ack) => {
                debug!(id = %id, stream = %ack.stream, sequence = ack.sequence, "publishEvent");
                Ok(id)
            }
            Err(e) => {
                let error = PublishError::Bus(e);
                record_failure(&cx, &error);
                Err(error)
            }
        };
        cx.span().end();
        result
    }

    /// Publishes an event on `subject` every `period` until `cancel` fires.
    /// A failed publish is logged and the loop carries on.
    pub async fn run_publish_loop(
        &self,
        cancel: CancellationToken,
        cx: Context,
        subject: &str,
        period: Duration,
    ) {
        async {
            info!("Publishing to {subject} every {period:?}");
            while !cancel.is_cancelled() {
                if let Err(e) = self.publish_event(&cx, subject).await {
                    warn!(error = %error_chain(&e), "publishEvent failed");
                }

                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(period) => {}
                }
            }
            info!("Publish loop stopped");
        }
        .instrument(self.service.logger().clone())
        .await;
    }
}

fn new_message_id() -> MessageId {
    Uuid::new_v4().simple().to_string()
}
