// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Distributed trace propagation across a durable message bus.
//!
//! A publisher wraps every message it sends in a producer span and writes the
//! span's context into the message headers; a subscriber reads the headers back,
//! continues the trace with a consumer span and acknowledges the message.
//!
//! ```text
//! Publisher                      Bus                        Subscriber
//!   │ start producer span         │                             │
//!   │ inject → HeaderCarrier      │                             │
//!   │ HeaderCarrier → Headers     │                             │
//!   ├──── Message{headers} ──────>│──── Delivery ──────────────>│
//!   │                             │          Headers → HeaderCarrier
//!   │                             │          extract → Context  │
//!   │                             │          consumer span, handler, ack
//! ```
//!
//! The bus is reached only through the traits in [`bus`]; spans go through the
//! OpenTelemetry SDK and leave the process over OTLP/HTTP.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod app;
pub mod bus;
pub mod config;
pub mod events;
pub mod header;
pub mod lifecycle;
pub mod logger;
pub mod propagation;
pub mod publisher;
pub mod service;
pub mod subscriber;
pub mod util;

#[cfg(test)]
mod testing;
