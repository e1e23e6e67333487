// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! W3C TraceContext propagator.
//!
//! ```text
//! traceparent: 00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01
//! tracestate: congo=t61rcWkgMzE,rojo=00f067aa0ba902b7
//! ```
//!
//! `traceparent` is `version-traceId-spanId-flags`: two hex digits of version,
//! 32 of trace id, 16 of span id, two of flags (bit 0 = sampled). `tracestate`
//! is vendor data, carried through verbatim.

#![allow(clippy::expect_used)]

use std::str::FromStr;

use lazy_static::lazy_static;
use opentelemetry::propagation::{text_map_propagator::FieldIter, Extractor, Injector};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::{SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState};
use opentelemetry::Context;
use regex::Regex;
use tracing::{debug, warn};

use crate::propagation::error::Error;

/// Carrier key for the W3C traceparent field.
///
/// Format: `00-{32-char-trace-id}-{16-char-span-id}-{2-char-flags}`
pub const TRACEPARENT_KEY: &str = "traceparent";

/// Carrier key for the W3C tracestate field.
pub const TRACESTATE_KEY: &str = "tracestate";

/// Only version emitted on inject.
const SUPPORTED_VERSION: u8 = 0;

lazy_static! {
    /// `version-traceId-spanId-flags[-optional]`
    static ref TRACEPARENT_REGEX: Regex =
        Regex::new(r"(?i)^([a-f0-9]{2})-([a-f0-9]{32})-([a-f0-9]{16})-([a-f0-9]{2})(-.*)?$")
            .expect("failed creating regex");

    /// Detects all-zero segments (e.g., "00000000").
    static ref INVALID_SEGMENT_REGEX: Regex = Regex::new(r"^0+$").expect("failed creating regex");

    /// Detects non printable ASCII characters in tracestate.
    static ref INVALID_ASCII_CHARACTERS_REGEX: Regex =
        Regex::new(r"[^\x20-\x7E]+").expect("failed creating regex");

    static ref TRACE_CONTEXT_FIELDS: [String; 2] =
        [TRACEPARENT_KEY.to_string(), TRACESTATE_KEY.to_string()];
}

/// Propagator for the W3C TraceContext format.
///
/// Injects the active span's context as `traceparent` (plus `tracestate` when
/// present). Extraction yields a remote parent; anything malformed is logged
/// and ignored, leaving the incoming context as it was.
#[derive(Clone, Copy, Debug, Default)]
pub struct TraceContextPropagator;

impl TextMapPropagator for TraceContextPropagator {
    fn inject_context(&self, cx: &Context, injector: &mut dyn Injector) {
        let span = cx.span();
        let span_context = span.span_context();
        if !span_context.is_valid() {
            debug!("{}", Error::inject("context without a valid span", "traceparent"));
            return;
        }

        injector.set(TRACEPARENT_KEY, format_traceparent(span_context));

        let trace_state = span_context.trace_state().header();
        if !trace_state.is_empty() {
            injector.set(TRACESTATE_KEY, trace_state);
        }
    }

    fn extract_with_context(&self, cx: &Context, extractor: &dyn Extractor) -> Context {
        match extract_span_context(extractor) {
            Some(span_context) => cx.with_remote_span_context(span_context),
            None => cx.clone(),
        }
    }

    fn fields(&self) -> FieldIter<'_> {
        FieldIter::new(TRACE_CONTEXT_FIELDS.as_ref())
    }
}

fn format_traceparent(span_context: &SpanContext) -> String {
    format!(
        "{:02x}-{}-{}-{:02x}",
        SUPPORTED_VERSION,
        span_context.trace_id(),
        span_context.span_id(),
        span_context.trace_flags().to_u8()
    )
}

fn extract_span_context(extractor: &dyn Extractor) -> Option<SpanContext> {
    let tp = extractor.get(TRACEPARENT_KEY)?.trim();

    match extract_traceparent(tp) {
        Ok((trace_id, span_id, trace_flags)) => {
            let trace_state = extractor
                .get(TRACESTATE_KEY)
                .and_then(extract_tracestate)
                .unwrap_or_default();
            Some(SpanContext::new(
                trace_id,
                span_id,
                trace_flags,
                true,
                trace_state,
            ))
        }
        Err(e) => {
            debug!("Failed to extract traceparent: {e}");
            None
        }
    }
}

fn extract_tracestate(tracestate: &str) -> Option<TraceState> {
    let ts = tracestate
        .split(',')
        .map(str::trim)
        .filter(|member| !member.is_empty())
        .collect::<Vec<&str>>()
        .join(",");

    if ts.is_empty() || INVALID_ASCII_CHARACTERS_REGEX.is_match(&ts) {
        debug!("Received invalid tracestate header {tracestate}");
        return None;
    }

    TraceState::from_str(&ts)
        .map_err(|e| debug!("Received invalid tracestate header {tracestate}: {e}"))
        .ok()
}

fn extract_traceparent(traceparent: &str) -> Result<(TraceId, SpanId, TraceFlags), Error> {
    let captures = TRACEPARENT_REGEX
        .captures(traceparent)
        .ok_or_else(|| Error::extract("invalid traceparent", "traceparent"))?;

    let tail = captures.get(5).map_or("", |m| m.as_str());
    extract_version(&captures[1], tail)?;

    Ok((
        extract_trace_id(&captures[2])?,
        extract_span_id(&captures[3])?,
        extract_trace_flags(&captures[4])?,
    ))
}

fn extract_version(version: &str, tail: &str) -> Result<(), Error> {
    match version.to_ascii_lowercase().as_str() {
        "ff" => {
            return Err(Error::extract(
                "`ff` is an invalid traceparent version",
                "traceparent",
            ));
        }
        "00" => {
            if !tail.is_empty() {
                return Err(Error::extract(
                    "Traceparent with version `00` should contain only 4 values delimited by `-`",
                    "traceparent",
                ));
            }
        }
        _ => {
            warn!("Unsupported traceparent version {version}, still attempting to parse");
        }
    }

    Ok(())
}

fn extract_trace_id(trace_id: &str) -> Result<TraceId, Error> {
    if INVALID_SEGMENT_REGEX.is_match(trace_id) {
        return Err(Error::extract(
            "`0` value for trace_id is invalid",
            "traceparent",
        ));
    }

    TraceId::from_hex(trace_id)
        .map_err(|_| Error::extract("Failed to decode trace_id", "traceparent"))
}

fn extract_span_id(span_id: &str) -> Result<SpanId, Error> {
    if INVALID_SEGMENT_REGEX.is_match(span_id) {
        return Err(Error::extract(
            "`0` value for span_id is invalid",
            "traceparent",
        ));
    }

    SpanId::from_hex(span_id)
        .map_err(|_| Error::extract("Failed to decode span_id", "traceparent"))
}

fn extract_trace_flags(flags: &str) -> Result<TraceFlags, Error> {
    u8::from_str_radix(flags, 16)
        .map(TraceFlags::new)
        .map_err(|_| Error::extract("Failed to decode trace_flags", "traceparent"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn carrier(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    fn extract(headers: &HashMap<String, String>) -> SpanContext {
        TraceContextPropagator
            .extract_with_context(&Context::new(), headers)
            .span()
            .span_context()
            .clone()
    }

    #[test]
    fn test_extract_traceparent_propagator() {
        let headers = carrier(&[
            (
                "traceparent",
                "00-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-01",
            ),
            ("tracestate", "rojo=00f067aa0ba902b7, congo=t61rcWkgMzE"),
        ]);

        let sc = extract(&headers);

        assert_eq!(
            sc.trace_id(),
            TraceId::from_hex("80f198ee56343ba864fe8b2a57d3eff7").unwrap()
        );
        assert_eq!(sc.span_id(), SpanId::from_hex("00f067aa0ba902b7").unwrap());
        assert!(sc.is_sampled());
        assert!(sc.is_remote());
        assert_eq!(
            sc.trace_state().header(),
            "rojo=00f067aa0ba902b7,congo=t61rcWkgMzE"
        );
    }

    #[test]
    fn test_inject_writes_version_00() {
        let cx = Context::new().with_remote_span_context(SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            false,
            TraceState::default(),
        ));
        let mut headers: HashMap<String, String> = HashMap::new();

        TraceContextPropagator.inject_context(&cx, &mut headers);

        assert_eq!(
            headers.get("traceparent").unwrap(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        );
        assert!(!headers.contains_key("tracestate"));
    }

    #[test]
    fn test_inject_without_span_leaves_carrier_untouched() {
        let mut headers: HashMap<String, String> = HashMap::new();

        TraceContextPropagator.inject_context(&Context::new(), &mut headers);

        assert!(headers.is_empty());
    }

    #[test]
    fn test_extract_unsampled_flags() {
        let headers = carrier(&[(
            "traceparent",
            "00-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-00",
        )]);

        assert!(!extract(&headers).is_sampled());
    }

    #[test]
    fn test_extract_missing_traceparent_returns_input() {
        let parent = SpanContext::new(
            TraceId::from_hex("4bf92f3577b34da6a3ce929d0e0e4736").unwrap(),
            SpanId::from_hex("00f067aa0ba902b7").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        );
        let input = Context::new().with_remote_span_context(parent.clone());

        let empty: HashMap<String, String> = HashMap::new();

        let cx = TraceContextPropagator.extract_with_context(&input, &empty);

        assert_eq!(cx.span().span_context(), &parent);
    }

    #[test]
    fn test_extract_rejects_malformed_traceparent() {
        let malformed = [
            "garbage",
            "ff-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-01",
            "00-00000000000000000000000000000000-00f067aa0ba902b7-01",
            "00-80f198ee56343ba864fe8b2a57d3eff7-0000000000000000-01",
            "00-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-01-extra",
            "00-80f198ee56343ba864fe8b2a57d3eff-00f067aa0ba902b7-01",
        ];

        for traceparent in malformed {
            let headers = carrier(&[("traceparent", traceparent)]);
            assert!(!extract(&headers).is_valid(), "accepted {traceparent}");
        }
    }

    #[test]
    fn test_extract_future_version_with_tail() {
        let headers = carrier(&[(
            "traceparent",
            "01-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-01-future",
        )]);

        assert!(extract(&headers).is_valid());
    }

    #[test]
    fn test_extract_drops_non_ascii_tracestate() {
        let headers = carrier(&[
            (
                "traceparent",
                "00-80f198ee56343ba864fe8b2a57d3eff7-00f067aa0ba902b7-01",
            ),
            ("tracestate", "congo=caf\u{e9}"),
        ]);

        let sc = extract(&headers);

        assert!(sc.is_valid());
        assert_eq!(sc.trace_state().header(), "");
    }

    #[test]
    fn test_fields() {
        let fields: Vec<&str> = TraceContextPropagator.fields().collect();
        assert_eq!(fields, vec![TRACEPARENT_KEY, TRACESTATE_KEY]);
    }
}
