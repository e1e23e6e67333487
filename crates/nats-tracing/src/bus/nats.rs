// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! NATS JetStream adapter.
//!
//! Subscriptions are durable push consumers bound to a deliver group, so every
//! process started with the same consumer id shares one stream position.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_nats::jetstream::{self, consumer};
use async_nats::HeaderMap;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::bus::{
    AckPolicy, Acknowledger, Bus, BusError, Connector, DeliverPolicy, Delivery, Message,
    PublishAck, SubscribeOptions, Subscription,
};
use crate::events::ConnectionEvent;
use crate::header::{HeaderValues, Headers};

/// Connects with the given client name.
pub struct NatsConnector {
    name: String,
}

impl NatsConnector {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Connector for NatsConnector {
    async fn connect(
        &self,
        server: &str,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Arc<dyn Bus>, BusError> {
        let url = server.to_string();
        let connected_once = Arc::new(AtomicBool::new(false));

        let client = async_nats::ConnectOptions::new()
            .name(&self.name)
            .event_callback(move |event| {
                let events = events.clone();
                let url = url.clone();
                let connected_once = connected_once.clone();
                async move {
                    let event = match event {
                        async_nats::Event::Connected => {
                            if connected_once.swap(true, Ordering::SeqCst) {
                                ConnectionEvent::Reconnected { url }
                            } else {
                                ConnectionEvent::Connected { url }
                            }
                        }
                        async_nats::Event::Disconnected => {
                            ConnectionEvent::Disconnected { url, error: None }
                        }
                        async_nats::Event::ClientError(e) => ConnectionEvent::Disconnected {
                            url,
                            error: Some(e.to_string()),
                        },
                        async_nats::Event::Closed => ConnectionEvent::Closed { url },
                        other => {
                            debug!("NATS event: {other}");
                            return;
                        }
                    };
                    if events.send(event).await.is_err() {
                        debug!("Connection event dropped, no observer");
                    }
                }
            })
            .connect(server)
            .await
            .map_err(|e| BusError::Connect {
                server: server.to_string(),
                source: Box::new(e),
            })?;

        info!("Connected to NATS at {server}");
        Ok(Arc::new(JetStreamBus::new(client)))
    }
}

pub struct JetStreamBus {
    client: async_nats::Client,
    context: jetstream::Context,
}

impl JetStreamBus {
    #[must_use]
    pub fn new(client: async_nats::Client) -> Self {
        let context = jetstream::new(client.clone());
        Self { client, context }
    }
}

#[async_trait]
impl Bus for JetStreamBus {
    async fn publish(&self, message: Message) -> Result<PublishAck, BusError> {
        let headers = message
            .headers
            .as_ref()
            .map(to_header_map)
            .unwrap_or_default();

        let ack = self
            .context
            .publish_with_headers(message.subject, headers, message.payload)
            .await
            .map_err(BusError::transport)?
            .await
            .map_err(BusError::transport)?;

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
        })
    }

    async fn queue_subscribe(
        &self,
        subject_pattern: &str,
        consumer_id: &str,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let stream_name = self
            .context
            .stream_by_subject(subject_pattern)
            .await
            .map_err(|_| BusError::NoStream(subject_pattern.to_string()))?;
        let stream = self
            .context
            .get_stream(&stream_name)
            .await
            .map_err(BusError::transport)?;

        let consumer: consumer::PushConsumer = stream
            .get_or_create_consumer(
                consumer_id,
                consumer_config(subject_pattern, consumer_id, self.client.new_inbox(), options),
            )
            .await
            .map_err(BusError::transport)?;

        let messages = consumer.messages().await.map_err(BusError::transport)?;
        debug!("Consumer {consumer_id} bound to stream {stream_name}");

        Ok(Box::new(JetStreamSubscription { messages }))
    }
}

/// Durable push consumer named `consumer_id`, delivering to the queue group of
/// the same name.
fn consumer_config(
    subject_pattern: &str,
    consumer_id: &str,
    deliver_subject: String,
    options: &SubscribeOptions,
) -> consumer::push::Config {
    consumer::push::Config {
        durable_name: Some(consumer_id.to_string()),
        deliver_subject,
        deliver_group: Some(consumer_id.to_string()),
        filter_subject: subject_pattern.to_string(),
        deliver_policy: match options.deliver_policy {
            DeliverPolicy::All => consumer::DeliverPolicy::All,
            DeliverPolicy::New => consumer::DeliverPolicy::New,
            DeliverPolicy::LastPerSubject => consumer::DeliverPolicy::LastPerSubject,
        },
        ack_policy: match options.ack_policy {
            AckPolicy::All => consumer::AckPolicy::All,
            AckPolicy::Explicit => consumer::AckPolicy::Explicit,
            AckPolicy::None => consumer::AckPolicy::None,
        },
        max_ack_pending: options.max_ack_pending,
        ..Default::default()
    }
}

struct JetStreamSubscription {
    messages: consumer::push::Messages,
}

#[async_trait]
impl Subscription for JetStreamSubscription {
    async fn next_message(&mut self) -> Result<Delivery, BusError> {
        let message = self
            .messages
            .next()
            .await
            .ok_or(BusError::Closed)?
            .map_err(BusError::transport)?;

        let (message, acker) = message.split();
        let message = Message {
            subject: message.subject.to_string(),
            payload: message.payload,
            headers: message.headers.as_ref().map(from_header_map),
        };
        Ok(Delivery::new(message, Box::new(JetStreamAcker(acker))))
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError> {
        // dropping the push stream unsubscribes from the deliver subject;
        // the durable consumer and its ack floor stay on the server
        drop(self.messages);
        Ok(())
    }
}

struct JetStreamAcker(jetstream::message::Acker);

#[async_trait]
impl Acknowledger for JetStreamAcker {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        self.0.ack().await.map_err(BusError::transport)
    }
}

/// NATS cannot carry a key without values, so `None` and empty lists are
/// left out.
fn to_header_map(headers: &Headers) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (key, values) in headers.iter() {
        for value in values.into_iter().flat_map(|values| values.iter()) {
            map.append(key, value.as_str());
        }
    }
    map
}

fn from_header_map(map: &HeaderMap) -> Headers {
    let mut headers = Headers::new();
    for (name, values) in map.iter() {
        let values: Vec<String> = values.iter().map(ToString::to_string).collect();
        headers.insert_values(name.to_string(), Some(HeaderValues::from(values)));
    }
    headers
}
