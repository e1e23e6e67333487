// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace context propagation across the bus boundary.
//!
//! A [`TextMapPropagator`] writes the active [`Context`] into a carrier before
//! a message is sent and reads it back on receipt:
//!
//! ```text
//! Context ──inject──> HeaderCarrier ──to_native──> message headers
//!                                                       │ bus
//! Context <──extract── HeaderCarrier <──to_carrier──────┘
//! ```
//!
//! # Formats
//!
//! - **W3C TraceContext**: `traceparent` and `tracestate`
//!   ([`TraceContextPropagator`])
//! - **W3C Baggage**: `baggage` (the SDK's `BaggagePropagator`)
//!
//! [`default_propagator`] runs both, in that order.
//!
//! # Best effort
//!
//! Extraction never fails: a missing or malformed field leaves the incoming
//! context as it was, so a consumer without a parent simply starts a new trace.

use std::sync::Arc;

use opentelemetry::propagation::{TextMapCompositePropagator, TextMapPropagator};
use opentelemetry_sdk::propagation::BaggagePropagator;

#[cfg(doc)]
use opentelemetry::Context;

pub use text_map_propagator::{TraceContextPropagator, TRACEPARENT_KEY, TRACESTATE_KEY};

pub mod error;
pub mod text_map_propagator;

/// Carrier key for W3C baggage.
pub const BAGGAGE_KEY: &str = "baggage";

/// Propagator shared by every loop of the process through the service context.
pub type SharedPropagator = Arc<dyn TextMapPropagator + Send + Sync>;

/// W3C TraceContext followed by W3C Baggage.
#[must_use]
pub fn default_propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator),
        Box::new(BaggagePropagator::new()),
    ])
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::header::HeaderCarrier;
    use opentelemetry::baggage::BaggageExt;
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };
    use opentelemetry::{Context, KeyValue};
    use std::str::FromStr;

    fn sample_context() -> Context {
        Context::new()
            .with_remote_span_context(SpanContext::new(
                TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
                SpanId::from_hex("00f067aa0ba902b7").unwrap(),
                TraceFlags::SAMPLED,
                false,
                TraceState::from_str("congo=t61rcWkgMzE").unwrap(),
            ))
            .with_baggage([KeyValue::new("tenant", "acme")])
    }

    #[test]
    fn test_composite_carries_trace_and_baggage() {
        let propagator = default_propagator();
        let cx = sample_context();
        let mut carrier = HeaderCarrier::new();

        propagator.inject_context(&cx, &mut carrier);
        let extracted = propagator.extract_with_context(&Context::new(), &carrier);

        let span = extracted.span();
        let sc = span.span_context();
        assert_eq!(sc.trace_id(), cx.span().span_context().trace_id());
        assert_eq!(sc.span_id(), cx.span().span_context().span_id());
        assert!(sc.is_remote());
        assert_eq!(sc.trace_state().header(), "congo=t61rcWkgMzE");
        assert_eq!(
            extracted.baggage().get("tenant").map(ToString::to_string),
            Some("acme".to_string())
        );
    }

    #[test]
    fn test_composite_survives_native_headers() {
        let propagator = default_propagator();
        let cx = sample_context();
        let mut carrier = HeaderCarrier::new();
        propagator.inject_context(&cx, &mut carrier);

        let received = carrier.to_native().to_carrier();
        let extracted = propagator.extract_with_context(&Context::new(), &received);

        assert_eq!(
            extracted.span().span_context().trace_id(),
            cx.span().span_context().trace_id()
        );
    }

    #[test]
    fn test_composite_empty_carrier_keeps_parent() {
        let propagator = default_propagator();
        let cx = sample_context();

        let extracted = propagator.extract_with_context(&cx, &HeaderCarrier::new());

        assert_eq!(extracted.span().span_context(), cx.span().span_context());
        assert_eq!(extracted.baggage().len(), 1);
    }

    #[test]
    fn test_composite_fields() {
        let propagator = default_propagator();
        let mut fields: Vec<&str> = propagator.fields().collect();
        fields.sort_unstable();
        assert_eq!(fields, vec![BAGGAGE_KEY, TRACEPARENT_KEY, TRACESTATE_KEY]);
    }
}
