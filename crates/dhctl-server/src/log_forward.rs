//! Forwarding of log lines into the active stream
//!
//! A worker serves one stream at a time. The [`ForwardLayer`] installed in
//! its subscriber formats every event as a line and hands it to whichever
//! session is attached to the shared [`LogSink`].

use std::fmt::{self, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Where forwarded lines go; empty while no session is attached
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    sender: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route lines to `sender` until the guard is dropped
    pub fn attach(&self, sender: mpsc::UnboundedSender<String>) -> LogSinkGuard {
        *self.sender.lock() = Some(sender);
        LogSinkGuard { sink: self.clone() }
    }

    fn send(&self, line: String) {
        let sender = self.sender.lock();
        if let Some(sender) = sender.as_ref() {
            // receiver gone means the session is finishing
            let _ = sender.send(line);
        }
    }

    pub fn layer(&self) -> ForwardLayer {
        ForwardLayer { sink: self.clone() }
    }
}

/// Detaches the sink on drop
#[derive(Debug)]
pub struct LogSinkGuard {
    sink: LogSink,
}

impl Drop for LogSinkGuard {
    fn drop(&mut self) {
        *self.sink.sender.lock() = None;
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Layer sending every event to the attached session
#[derive(Debug, Clone)]
pub struct ForwardLayer {
    sink: LogSink,
}

impl<S: Subscriber> Layer<S> for ForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if self.sink.sender.lock().is_none() {
            return;
        }
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        let level = event.metadata().level().to_string();
        let line = format!("{level:>5} {}{}", visitor.message, visitor.fields);
        self.sink.send(line);
    }
}
