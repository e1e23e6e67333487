// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error type for trace context extraction and injection.
//!
//! Propagation errors are never surfaced to callers: a failed extraction
//! leaves the incoming context untouched, a failed injection leaves the carrier
//! untouched. They exist so the reason can be logged.

use thiserror::Error;

/// Error during trace context extraction or injection.
///
/// Display format: `"Cannot {operation} from {message}, {propagator_name}"`
#[derive(Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("Cannot {} from {}, {}", operation, message, propagator_name)]
pub struct Error {
    message: &'static str,
    propagator_name: &'static str,
    operation: &'static str,
}

impl Error {
    #[must_use]
    pub fn extract(message: &'static str, propagator_name: &'static str) -> Self {
        Self {
            message,
            propagator_name,
            operation: "extract",
        }
    }

    #[must_use]
    pub fn inject(message: &'static str, propagator_name: &'static str) -> Self {
        Self {
            message,
            propagator_name,
            operation: "inject",
        }
    }
}
