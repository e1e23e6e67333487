// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transport boundary.
//!
//! Publisher and subscriber only see the traits in this module; the concrete
//! transport is picked by the binary through a [`Connector`]:
//!
//! - [`nats::NatsConnector`]: NATS JetStream
//! - [`memory::MemoryConnector`]: in-process loopback

use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::events::ConnectionEvent;
use crate::header::Headers;

pub mod memory;
pub mod nats;

pub type BoxError = Box<dyn StdError + Send + Sync>;

pub const DEFAULT_MAX_ACK_PENDING: i64 = 256;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("cannot reach bus server {server}")]
    Connect {
        server: String,
        #[source]
        source: BoxError,
    },
    #[error("no stream captures subject {0}")]
    NoStream(String),
    #[error("subscription closed")]
    Closed,
    #[error("bus transport error")]
    Transport(#[source] BoxError),
}

impl BusError {
    pub fn transport(error: impl Into<BoxError>) -> Self {
        BusError::Transport(error.into())
    }
}

/// Immutable once built; moved into the bus on publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub payload: Bytes,
    /// `None` when the message carries no header map at all.
    pub headers: Option<Headers>,
}

impl Message {
    pub fn new(subject: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: None,
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Stream position assigned by the bus to a published message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliverPolicy {
    All,
    New,
    /// Start with the latest retained message of every matching subject.
    #[default]
    LastPerSubject,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AckPolicy {
    /// Acknowledging a message also acknowledges every earlier one.
    #[default]
    All,
    Explicit,
    None,
}

/// When the subscriber acknowledges a delivery.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AckMode {
    /// Once the handler returned, whatever its outcome.
    #[default]
    AfterAttempt,
    /// Only when the handler succeeded; failures are left for redelivery.
    AfterSuccess,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub max_ack_pending: i64,
    pub deliver_policy: DeliverPolicy,
    pub ack_policy: AckPolicy,
    pub ack_mode: AckMode,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            max_ack_pending: DEFAULT_MAX_ACK_PENDING,
            deliver_policy: DeliverPolicy::default(),
            ack_policy: AckPolicy::default(),
            ack_mode: AckMode::default(),
        }
    }
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// Publishes and waits for the bus to persist the message.
    async fn publish(&self, message: Message) -> Result<PublishAck, BusError>;

    /// Joins the durable queue group `consumer_id` on `subject_pattern`.
    /// Members of one group share the deliveries.
    async fn queue_subscribe(
        &self,
        subject_pattern: &str,
        consumer_id: &str,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, BusError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Waits for the next delivery. Cancel-safe: dropping the future loses no
    /// message.
    async fn next_message(&mut self) -> Result<Delivery, BusError>;

    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError>;
}

#[async_trait]
pub trait Acknowledger: Send {
    async fn ack(self: Box<Self>) -> Result<(), BusError>;
}

/// A received message together with the means to acknowledge it.
pub struct Delivery {
    pub message: Message,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: Message, acker: Box<dyn Acknowledger>) -> Self {
        Self { message, acker }
    }

    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.ack().await
    }

    #[must_use]
    pub fn into_parts(self) -> (Message, Box<dyn Acknowledger>) {
        (self.message, self.acker)
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects to `server`; connection lifecycle changes are reported on
    /// `events` for as long as the connection lives.
    async fn connect(
        &self,
        server: &str,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Arc<dyn Bus>, BusError>;
}

/// NATS subject matching: `*` matches one token, a trailing `>` one or more.
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    let mut pattern_tokens = pattern.split('.').peekable();

    while let Some(pattern_token) = pattern_tokens.next() {
        match (pattern_token, subject_tokens.next()) {
            (">", Some(_)) if pattern_tokens.peek().is_none() => return true,
            (_, None) => return false,
            ("*", Some(token)) if !token.is_empty() => {}
            (expected, Some(token)) if expected == token && !token.is_empty() => {}
            _ => return false,
        }
    }

    subject_tokens.next().is_none()
}
