//! Tracing layer for optimizer runs.
//!
//! [`OptimizerLogLayer`] formats each event as
//! `YYYY/MM/DD HH:MM:SS LEVEL target: message` and writes it to stderr, or
//! into a [`LogBuffer`] when one is attached. Events below the layer's
//! minimum level are dropped, and [`disable_logging`] silences every layer
//! in the process until [`enable_logging`] is called.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Local;
use tracing::{Level, Subscriber};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

static LOGGING_ENABLED: AtomicBool = AtomicBool::new(true);

/// Silence all optimizer log output.
pub fn disable_logging() {
    LOGGING_ENABLED.store(false, Ordering::Relaxed);
}

pub fn enable_logging() {
    LOGGING_ENABLED.store(true, Ordering::Relaxed);
}

pub fn is_logging_enabled() -> bool {
    LOGGING_ENABLED.load(Ordering::Relaxed)
}

/// Captured, already formatted log lines.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<String>>>);

impl LogBuffer {
    pub fn drain(&self) -> Vec<String> {
        let mut buf = self.0.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *buf)
    }
}

pub struct OptimizerLogLayer {
    min_level: Level,
    buffer: Option<LogBuffer>,
}

impl OptimizerLogLayer {
    /// A layer writing to stderr.
    pub fn new(min_level: Level) -> Self {
        Self {
            min_level,
            buffer: None,
        }
    }

    /// A layer capturing into a buffer instead of stderr.
    pub fn buffered(min_level: Level) -> (Self, LogBuffer) {
        let buffer = LogBuffer::default();
        (
            Self {
                min_level,
                buffer: Some(buffer.clone()),
            },
            buffer,
        )
    }
}

/// Render one log line (no trailing newline).
pub fn format_line(level: &Level, target: &str, message: &str) -> String {
    format!(
        "{} {:<5} {target}: {message}",
        Local::now().format("%Y/%m/%d %H:%M:%S"),
        level.as_str()
    )
}

impl<S: Subscriber + for<'a> LookupSpan<'a>> Layer<S> for OptimizerLogLayer {
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let metadata = event.metadata();
        // Level ordering is by verbosity: TRACE > DEBUG > ... > ERROR.
        if !is_logging_enabled() || *metadata.level() > self.min_level {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let mut message = visitor.message;
        if !visitor.fields.is_empty() {
            let extras: Vec<String> = visitor
                .fields
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            if message.is_empty() {
                message = extras.join(" ");
            } else {
                message = format!("{message} {{{}}}", extras.join(", "));
            }
        }

        let line = format_line(metadata.level(), metadata.target(), &message);
        match &self.buffer {
            Some(buffer) => buffer
                .0
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(line),
            None => {
                let _ = writeln!(std::io::stderr().lock(), "{line}");
            }
        }
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .push((field.name().to_string(), format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields
                .push((field.name().to_string(), value.to_string()));
        }
    }
}

/// Install an [`OptimizerLogLayer`] as the global subscriber.
pub fn init(min_level: Level) -> Result<(), String> {
    tracing_subscriber::registry()
        .with(OptimizerLogLayer::new(min_level))
        .try_init()
        .map_err(|e| format!("failed to install log subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // The enable switch is process-wide.
    static SWITCH: Mutex<()> = Mutex::new(());

    fn capture(min_level: Level, emit: impl FnOnce()) -> Vec<String> {
        let _guard = SWITCH.lock().unwrap_or_else(|e| e.into_inner());
        capture_unlocked(min_level, emit)
    }

    fn capture_unlocked(min_level: Level, emit: impl FnOnce()) -> Vec<String> {
        let (layer, buffer) = OptimizerLogLayer::buffered(min_level);
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, emit);
        buffer.drain()
    }

    #[test]
    fn lines_carry_timestamp_level_and_target() {
        let lines = capture(Level::INFO, || {
            tracing::info!(target: "promptopt::search", "trial {} done", 3);
        });
        assert_eq!(lines.len(), 1);
        let line = &lines[0];
        assert!(line.ends_with("INFO  promptopt::search: trial 3 done"), "{line}");
        // "YYYY/MM/DD HH:MM:SS " prefix.
        assert_eq!(line.chars().nth(4), Some('/'));
        assert_eq!(line.chars().nth(13), Some(':'));
    }

    #[test]
    fn below_min_level_is_dropped() {
        let lines = capture(Level::WARN, || {
            tracing::info!("quiet");
            tracing::warn!("loud");
        });
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("loud"));
    }

    #[test]
    fn extra_fields_are_appended() {
        let lines = capture(Level::DEBUG, || {
            tracing::debug!(attempt = 2, "retrying");
        });
        assert!(lines[0].ends_with("retrying {attempt=2}"), "{}", lines[0]);
    }

    #[test]
    fn switch_silences_everything() {
        let _guard = SWITCH.lock().unwrap_or_else(|e| e.into_inner());
        disable_logging();
        let lines = capture_unlocked(Level::TRACE, || tracing::error!("hidden"));
        enable_logging();
        assert!(lines.is_empty());
        assert!(is_logging_enabled());
    }
}
