// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Constants for the connection event bus.

/// Capacity of the connection event channel. Connection changes are rare;
/// when the observer lags this far behind, the transport waits.
pub(crate) const MAX_EVENTS: usize = 100;

/// Span attribute naming the server a connection event refers to.
pub const CONNECTED_URL_ATTRIBUTE: &str = "nats.connected.url";
