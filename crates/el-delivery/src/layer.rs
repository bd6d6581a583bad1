//! Tracing layer that forwards warnings and errors to the system log
//!
//! The layer is installed with the subscriber before the client exists, so
//! it holds a [`SystemLogSink`] that the client is attached to once built.
//! Events from this workspace's own crates are never forwarded; a failing
//! delivery would otherwise feed itself.

use std::fmt::{self, Write as _};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::log_queue::SystemLog;

const OWN_TARGET_PREFIX: &str = "el_";

/// Late-bound handle to the system log queue
#[derive(Clone, Default)]
pub struct SystemLogSink {
    inner: Arc<RwLock<Option<Arc<SystemLog>>>>,
}

impl SystemLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, log: Arc<SystemLog>) {
        *self.inner.write() = Some(log);
    }

    pub fn detach(&self) {
        self.inner.write().take();
    }

    fn forward(&self, text: &str) {
        if let Some(log) = self.inner.read().as_ref() {
            log.log(text);
        }
    }
}

pub struct SystemLogLayer {
    sink: SystemLogSink,
    max_level: Level,
}

impl SystemLogLayer {
    pub fn new(sink: SystemLogSink) -> Self {
        Self {
            sink,
            max_level: Level::WARN,
        }
    }

    fn wants(&self, event: &Event<'_>) -> bool {
        let metadata = event.metadata();
        *metadata.level() <= self.max_level && !metadata.target().starts_with(OWN_TARGET_PREFIX)
    }
}

#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn into_text(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else {
            format!("{} ({})", self.message, self.fields.trim_end())
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, "{}={} ", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, "{}={:?} ", field.name(), value);
        }
    }
}

impl<S> Layer<S> for SystemLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !self.wants(event) {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let metadata = event.metadata();
        let text = format!("{} {}: {}", metadata.level(), metadata.target(), visitor.into_text());
        self.sink.forward(&text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::Registry;

    fn pending_lines(log: &SystemLog) -> usize {
        log.stats().pending
    }

    #[test]
    fn test_forwards_foreign_warnings_only() {
        let log = Arc::new(SystemLog::new("HOST=test;", 10, true));
        let sink = SystemLogSink::new();
        sink.attach(log.clone());

        let subscriber = Registry::default().with(SystemLogLayer::new(sink.clone()));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "driver", port = 3, "link lost");
            tracing::error!(target: "driver", "link dead");
            tracing::info!(target: "driver", "link ok");
            tracing::warn!(target: "el_delivery::delivery", "send failed");
        });

        assert_eq!(pending_lines(&log), 2);

        sink.detach();
        let subscriber = Registry::default().with(SystemLogLayer::new(sink));
        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: "driver", "after detach");
        });
        assert_eq!(pending_lines(&log), 2);
    }

    #[test]
    fn test_visitor_collects_message_and_fields() {
        let mut visitor = MessageVisitor::default();
        visitor.message.push_str("link lost");
        visitor.fields.push_str("port=3 ");
        assert_eq!(visitor.into_text(), "link lost (port=3)");
    }
}
