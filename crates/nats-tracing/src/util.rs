// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::error::Error as StdError;

use opentelemetry::trace::{Status, TraceContextExt};
use opentelemetry::Context;

/// `outer: inner: root cause`
#[must_use]
pub fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Adds an `exception` event to the active span of `cx` and marks it failed
/// with the whole error chain as description.
pub fn record_failure(cx: &Context, error: &(dyn StdError + 'static)) {
    let span = cx.span();
    span.record_error(error);
    span.set_status(Status::error(error_chain(error)));
}
