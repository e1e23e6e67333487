// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process loopback bus.
//!
//! Keeps every published message in one stream and fans them out to durable
//! queue groups by subject pattern. Members of one group pull from a shared
//! queue, so each message is delivered to only one of them. A delivery that is
//! still unacknowledged when its subscription is released goes back to the
//! group queue. Failures can be switched on per operation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::{
    subject_matches, AckPolicy, Acknowledger, Bus, BusError, Connector, DeliverPolicy, Delivery, Message,
    PublishAck, SubscribeOptions, Subscription,
};
use crate::events::ConnectionEvent;

pub const STREAM_NAME: &str = "MEMORY";

type Queue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<(u64, Message)>>>;
type Pending = Arc<Mutex<BTreeMap<u64, Message>>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AckRecord {
    pub consumer_id: String,
    pub sequence: u64,
    pub subject: String,
}

#[derive(Default)]
struct Failures {
    publish: bool,
    subscribe: bool,
    next_message: bool,
    ack: bool,
}

struct Group {
    pattern: String,
    tx: mpsc::UnboundedSender<(u64, Message)>,
    rx: Queue,
}

#[derive(Default)]
struct State {
    stream: Vec<(u64, Message)>,
    groups: HashMap<String, Group>,
    acks: Vec<AckRecord>,
    failures: Failures,
    open_subscriptions: usize,
    subscribe_calls: usize,
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<State>>,
}

impl MemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn fail_publish(&self, fail: bool) {
        self.state().failures.publish = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.state().failures.subscribe = fail;
    }

    pub fn fail_next_message(&self, fail: bool) {
        self.state().failures.next_message = fail;
    }

    pub fn fail_ack(&self, fail: bool) {
        self.state().failures.ack = fail;
    }

    /// Every message persisted so far, in stream order.
    #[must_use]
    pub fn published(&self) -> Vec<Message> {
        self.state().stream.iter().map(|(_, m)| m.clone()).collect()
    }

    #[must_use]
    pub fn acks(&self) -> Vec<AckRecord> {
        self.state().acks.clone()
    }

    #[must_use]
    pub fn open_subscriptions(&self) -> usize {
        self.state().open_subscriptions
    }

    #[must_use]
    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }
}

fn initial_backlog(
    stream: &[(u64, Message)],
    pattern: &str,
    policy: DeliverPolicy,
) -> Vec<(u64, Message)> {
    let matching = stream
        .iter()
        .filter(|(_, m)| subject_matches(pattern, &m.subject));

    match policy {
        DeliverPolicy::All => matching.cloned().collect(),
        DeliverPolicy::New => Vec::new(),
        DeliverPolicy::LastPerSubject => {
            let mut seen = HashSet::new();
            let mut last: Vec<(u64, Message)> = matching
                .rev()
                .filter(|(_, m)| seen.insert(m.subject.clone()))
                .cloned()
                .collect();
            last.reverse();
            last
        }
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, message: Message) -> Result<PublishAck, BusError> {
        let mut state = self.state();
        if state.failures.publish {
            return Err(BusError::transport("publish rejected"));
        }

        let sequence = state.stream.len() as u64 + 1;
        for group in state.groups.values() {
            if subject_matches(&group.pattern, &message.subject) {
                // a closed queue only means every member is gone
                let _ = group.tx.send((sequence, message.clone()));
            }
        }
        state.stream.push((sequence, message));

        Ok(PublishAck {
            stream: STREAM_NAME.to_string(),
            sequence,
        })
    }

    async fn queue_subscribe(
        &self,
        subject_pattern: &str,
        consumer_id: &str,
        options: &SubscribeOptions,
    ) -> Result<Box<dyn Subscription>, BusError> {
        let mut state = self.state();
        state.subscribe_calls += 1;
        if state.failures.subscribe {
            return Err(BusError::NoStream(subject_pattern.to_string()));
        }

        let queue = match state.groups.get(consumer_id) {
            Some(group) => group.rx.clone(),
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                for delivery in initial_backlog(&state.stream, subject_pattern, options.deliver_policy)
                {
                    let _ = tx.send(delivery);
                }
                let rx = Arc::new(tokio::sync::Mutex::new(rx));
                state.groups.insert(
                    consumer_id.to_string(),
                    Group {
                        pattern: subject_pattern.to_string(),
                        tx,
                        rx: rx.clone(),
                    },
                );
                rx
            }
        };
        state.open_subscriptions += 1;
        debug!("Joined queue group {consumer_id} on {subject_pattern}");

        Ok(Box::new(MemorySubscription {
            bus: self.clone(),
            consumer_id: consumer_id.to_string(),
            ack_policy: options.ack_policy,
            queue,
            pending: Pending::default(),
        }))
    }
}

struct MemorySubscription {
    bus: MemoryBus,
    consumer_id: String,
    ack_policy: AckPolicy,
    queue: Queue,
    /// Delivered but not yet acknowledged, by sequence.
    pending: Pending,
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next_message(&mut self) -> Result<Delivery, BusError> {
        if self.bus.state().failures.next_message {
            return Err(BusError::transport("pull rejected"));
        }

        let (sequence, message) = self
            .queue
            .lock()
            .await
            .recv()
            .await
            .ok_or(BusError::Closed)?;

        if self.ack_policy != AckPolicy::None {
            lock(&self.pending).insert(sequence, message.clone());
        }

        let acker = MemoryAcker {
            bus: self.bus.clone(),
            ack_policy: self.ack_policy,
            pending: self.pending.clone(),
            record: AckRecord {
                consumer_id: self.consumer_id.clone(),
                sequence,
                subject: message.subject.clone(),
            },
        };
        Ok(Delivery::new(message, Box::new(acker)))
    }

    async fn unsubscribe(self: Box<Self>) -> Result<(), BusError> {
        let unacked = std::mem::take(&mut *lock(&self.pending));
        let mut state = self.bus.state();
        state.open_subscriptions = state.open_subscriptions.saturating_sub(1);
        if let Some(group) = state.groups.get(&self.consumer_id) {
            for (sequence, message) in unacked {
                debug!("Redelivering unacknowledged message {sequence}");
                let _ = group.tx.send((sequence, message));
            }
        }
        debug!("Left queue group {}", self.consumer_id);
        Ok(())
    }
}

struct MemoryAcker {
    bus: MemoryBus,
    ack_policy: AckPolicy,
    pending: Pending,
    record: AckRecord,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(self: Box<Self>) -> Result<(), BusError> {
        let mut state = self.bus.state();
        if state.failures.ack {
            return Err(BusError::transport("ack rejected"));
        }

        let sequence = self.record.sequence;
        {
            let mut pending = lock(&self.pending);
            match self.ack_policy {
                AckPolicy::All => pending.retain(|s, _| *s > sequence),
                AckPolicy::Explicit | AckPolicy::None => {
                    pending.remove(&sequence);
                }
            }
        }
        state.acks.push(self.record);
        Ok(())
    }
}

fn lock(pending: &Pending) -> MutexGuard<'_, BTreeMap<u64, Message>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hands out one shared [`MemoryBus`].
#[derive(Clone, Default)]
pub struct MemoryConnector {
    bus: MemoryBus,
    refuse: bool,
}

impl MemoryConnector {
    #[must_use]
    pub fn new(bus: MemoryBus) -> Self {
        Self { bus, refuse: false }
    }

    /// A connector whose every connection attempt fails.
    #[must_use]
    pub fn refusing(bus: MemoryBus) -> Self {
        Self { bus, refuse: true }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        server: &str,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Result<Arc<dyn Bus>, BusError> {
        if self.refuse {
            return Err(BusError::Connect {
                server: server.to_string(),
                source: "connection refused".into(),
            });
        }

        if events
            .try_send(ConnectionEvent::Connected {
                url: server.to_string(),
            })
            .is_err()
        {
            debug!("Connection event dropped");
        }
        Ok(Arc::new(self.bus.clone()))
    }
}
