//! Log line layout for the bridge.
//!
//! Default tracing format: `TIMESTAMP LEVEL span1:span2: target: message`
//! This format:            `TIMESTAMP LEVEL target: span1{fields}: message`
//!
//! The crate prefix is dropped from our own targets, so `adsb_bridge::sbs::client`
//! shows as `sbs::client`.

use std::fmt;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::{FmtContext, FormattedFields};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const CRATE_TARGET_PREFIX: &str = "adsb_bridge::";

/// Event formatter that puts the target before the span context
#[derive(Debug, Clone, Copy)]
pub struct TargetFirstFormat {
    ansi: bool,
    timestamps: bool,
}

impl Default for TargetFirstFormat {
    fn default() -> Self {
        Self {
            ansi: true,
            timestamps: true,
        }
    }
}

impl TargetFirstFormat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Colorize the level; turn off when output isn't a terminal
    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Prefix each line with a UTC timestamp; journald adds its own
    pub fn with_timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }
}

fn level_color(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "\x1b[31m",
        Level::WARN => "\x1b[33m",
        Level::INFO => "\x1b[32m",
        Level::DEBUG => "\x1b[34m",
        Level::TRACE => "\x1b[35m",
    }
}

fn short_target(target: &str) -> &str {
    target.strip_prefix(CRATE_TARGET_PREFIX).unwrap_or(target)
}

impl<S, N> FormatEvent<S, N> for TargetFirstFormat
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

        if self.timestamps {
            write!(
                writer,
                "{} ",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ")
            )?;
        }

        let level = metadata.level();
        if self.ansi {
            write!(writer, "{}{:>5}\x1b[0m ", level_color(level), level)?;
        } else {
            write!(writer, "{:>5} ", level)?;
        }

        write!(writer, "{}: ", short_target(metadata.target()))?;

        // Spans with their recorded fields, e.g. `run{endpoint=host:30003}`
        if let Some(scope) = ctx.event_scope() {
            let mut first = true;
            for span in scope.from_root() {
                if !first {
                    write!(writer, ":")?;
                }
                write!(writer, "{}", span.name())?;
                let extensions = span.extensions();
                if let Some(fields) = extensions.get::<FormattedFields<N>>()
                    && !fields.is_empty()
                {
                    write!(writer, "{{{}}}", fields)?;
                }
                first = false;
            }
            if !first {
                write!(writer, ": ")?;
            }
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn capture(format: TargetFirstFormat, emit: impl FnOnce()) -> String {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .event_format(format)
            .with_writer(move || writer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, emit);
        let bytes = captured.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_target_comes_before_spans() {
        let out = capture(
            TargetFirstFormat::new().with_ansi(false).with_timestamps(false),
            || {
                let span = tracing::info_span!("run", endpoint = %"feeder:30003");
                let _guard = span.enter();
                tracing::warn!(target: "adsb_bridge::sbs::client", "connection lost");
            },
        );
        assert_eq!(
            out,
            " WARN sbs::client: run{endpoint=feeder:30003}: connection lost\n"
        );
    }

    #[test]
    fn test_foreign_target_kept_whole() {
        let out = capture(
            TargetFirstFormat::new().with_ansi(false).with_timestamps(false),
            || tracing::info!(target: "hyper::client", "pooled"),
        );
        assert_eq!(out, " INFO hyper::client: pooled\n");
    }

    #[test]
    fn test_ansi_level_and_timestamp() {
        let out = capture(TargetFirstFormat::new(), || {
            tracing::error!(target: "adsb_bridge::dispatcher", "boom")
        });
        assert!(out.contains("\x1b[31mERROR\x1b[0m dispatcher: boom"));
        assert!(out.ends_with("Z \x1b[31mERROR\x1b[0m dispatcher: boom\n"));
    }
}
