// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line format and subscriber setup.
//!
//! Every line is prefixed so the publisher and subscriber output can be told
//! apart from the bus client and anything else sharing the terminal:
//!
//! ```text
//! NATS_TRACING | LEVEL | [span_name{span_fields}:] message {event_fields}
//! ```
//!
//! ```text
//! NATS_TRACING | INFO | service{name=orders version=1.0.0}: Publishing to ORDERS.test
//! NATS_TRACING | WARN | service{name=orders version=1.0.0}: publishEvent failed error=bus publish failed
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub const LOG_PREFIX: &str = "NATS_TRACING";

/// Transport internals that would drown our own lines.
const QUIET_TARGETS: &str = "async_nats=warn,hyper=off,reqwest=off,rustls=off";

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("could not parse log level {0}")]
    Filter(String, #[source] tracing_subscriber::filter::ParseError),
    #[error("a global logger is already installed")]
    AlreadyInstalled(#[from] tracing::subscriber::SetGlobalDefaultError),
}

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(&mut writer, "{LOG_PREFIX} | {} | ", metadata.level())?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, "{}", span.name())?;

                let ext = span.extensions();
                if let Some(fields) = ext.get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Installs the process-wide subscriber at `log_level` (an `EnvFilter`
/// directive such as `debug` or `nats_tracing=trace`).
pub fn init(log_level: &str) -> Result<(), LoggerError> {
    let directives = format!("{QUIET_TARGETS},{}", log_level.to_lowercase());
    let filter = EnvFilter::try_new(&directives)
        .map_err(|e| LoggerError::Filter(log_level.to_string(), e))?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .event_format(Formatter)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture(f: impl FnOnce()) -> String {
        let buffer = Buffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt::Subscriber::builder()
            // `tracing-test` (dev-only) enables tracing-subscriber's `ansi`
            // feature; the non-test build has it off.
            .with_ansi(false)
            .event_format(Formatter)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, f);

        let bytes = buffer.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_format_plain_event() {
        let output = capture(|| tracing::info!("hello"));
        assert_eq!(output, "NATS_TRACING | INFO | hello\n");
    }

    #[test]
    fn test_format_includes_span_fields() {
        let output = capture(|| {
            let span = tracing::info_span!("service", name = "orders");
            let _guard = span.enter();
            tracing::warn!(attempt = 2, "publishEvent failed");
        });
        assert_eq!(
            output,
            "NATS_TRACING | WARN | service{name=\"orders\"}: publishEvent failed attempt=2\n"
        );
    }

    #[test]
    fn test_init_rejects_bad_level() {
        assert!(matches!(
            init("nats_tracing=loud"),
            Err(LoggerError::Filter(_, _))
        ));
    }
}
