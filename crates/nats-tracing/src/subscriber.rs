// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Traced consumption.
//!
//! Deliveries are handled strictly one after the other. For each one the
//! trace context is read back from the headers and the handler runs inside a
//! consumer span continuing the producer's trace; the message is then
//! acknowledged according to the [`AckMode`].

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::trace::{SpanKind, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::bus::{AckMode, BoxError, Bus, BusError, Delivery, Message, SubscribeOptions};
use crate::header::to_carrier;
use crate::service::ServiceContext;
use crate::util::{error_chain, record_failure};

pub const RECEIVE_SPAN_NAME: &str = "subject receive";

#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// `cx` has the consumer span active.
    async fn handle(&self, cx: &Context, message: &Message) -> Result<(), BoxError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("cannot open queue subscription")]
    Open(#[source] BusError),
    #[error("cannot pull next message")]
    Pull(#[source] BusError),
    #[error("cannot handle message")]
    Handler(#[source] BoxError),
}

#[derive(Clone)]
pub struct Subscriber {
    bus: Arc<dyn Bus>,
    service: ServiceContext,
}

impl Subscriber {
    pub fn new(bus: Arc<dyn Bus>, service: ServiceContext) -> Self {
        Self { bus, service }
    }

    /// Consumes `subject_pattern` as a member of the durable queue group
    /// `consumer_id` until `cancel` fires or a delivery cannot be pulled or
    /// handled. The subscription is released on every exit after it opened.
    pub async fn subscribe(
        &self,
        cancel: CancellationToken,
        cx: Context,
        subject_pattern: &str,
        consumer_id: &str,
        handler: &dyn MessageHandler,
        options: &SubscribeOptions,
    ) -> Result<(), SubscribeError> {
        async {
            let mut subscription = match self
                .bus
                .queue_subscribe(subject_pattern, consumer_id, options)
                .await
            {
                Ok(subscription) => subscription,
                Err(e) => return Err(SubscribeError::Open(e)),
            };
            info!("Subscribed to {subject_pattern} as {consumer_id}");

            let result = loop {
                if cancel.is_cancelled() {
                    break Ok(());
                }

                let delivery = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break Ok(()),
                    next = subscription.next_message() => match next {
                        Ok(delivery) => delivery,
                        Err(e) => break Err(SubscribeError::Pull(e)),
                    },
                };

                if let Err(e) = self
                    .process(&cx, consumer_id, delivery, options.ack_mode, handler)
                    .await
                {
                    break Err(e);
                }
            };

            if let Err(e) = subscription.unsubscribe().await {
                warn!(error = %error_chain(&e), "unsubscribe failed");
            }
            info!("Unsubscribed from {subject_pattern}");
            result
        }
        .instrument(self.service.logger().clone())
        .await
    }

    async fn process(
        &self,
        cx: &Context,
        consumer_id: &str,
        delivery: Delivery,
        ack_mode: AckMode,
        handler: &dyn MessageHandler,
    ) -> Result<(), SubscribeError> {
        let (message, acker) = delivery.into_parts();

        let parent = match to_carrier(message.headers.as_ref()) {
            Some(carrier) => self.service.propagator().extract_with_context(cx, &carrier),
            None => cx.clone(),
        };

        let tracer = self.service.tracer();
        let span = tracer
            .span_builder(RECEIVE_SPAN_NAME)
            .with_kind(SpanKind::Consumer)
            .with_attributes([
                KeyValue::new("messaging.system", "nats"),
                KeyValue::new("messaging.destination.name", message.subject.clone()),
                KeyValue::new("messaging.consumer.group.name", consumer_id.to_string()),
                KeyValue::new(
                    "messaging.message.body.size",
                    i64::try_from(message.payload.len()).unwrap_or(i64::MAX),
                ),
            ])
            .start_with_context(tracer, &parent);
        let span_cx = parent.with_span(span);

        let outcome = handler.handle(&span_cx, &message).await;
        if let Err(e) = &outcome {
            record_failure(&span_cx, &**e);
        }
        span_cx.span().end();

        let ack = match ack_mode {
            AckMode::AfterAttempt => true,
            AckMode::AfterSuccess => outcome.is_ok(),
        };
        if ack {
            if let Err(e) = acker.ack().await {
                error!(subject = %message.subject, error = %error_chain(&e), "ack failed");
            }
        } else {
            debug!(subject = %message.subject, "Leaving failed message for redelivery");
        }

        outcome.map_err(SubscribeError::Handler)
    }
}
