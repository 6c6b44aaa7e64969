//! Status transition log and reporting sinks
//!
//! Every lifecycle or health change of a service is recorded once, in the
//! order it happened, and forwarded to a [`StatusSink`].

use crate::service::ServiceStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// A single status change of a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    /// Service name
    pub service: String,
    /// Status before the change
    pub from: ServiceStatus,
    /// Status after the change
    pub to: ServiceStatus,
    /// When the change was applied
    pub timestamp: DateTime<Utc>,
}

impl Transition {
    pub fn new(service: &str, from: ServiceStatus, to: ServiceStatus) -> Self {
        Self {
            service: service.to_string(),
            from,
            to,
            timestamp: Utc::now(),
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}: {} -> {}",
            self.timestamp.format("%H:%M:%S%.3f"),
            self.service,
            self.from,
            self.to
        )
    }
}

/// Consumer of status transitions
pub trait StatusSink: Send + Sync {
    /// Called once per transition, in order
    fn record(&self, transition: &Transition);
}

/// Sink that writes transitions to the tracing subscriber
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn record(&self, transition: &Transition) {
        tracing::info!(
            service = %transition.service,
            from = %transition.from,
            to = %transition.to,
            "{} is {}",
            transition.service,
            transition.to
        );
    }
}

/// Sink that writes one JSON object per line
pub struct JsonLinesSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the writer
    pub fn into_inner(self) -> W {
        match self.writer.into_inner() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl JsonLinesSink<std::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send> StatusSink for JsonLinesSink<W> {
    fn record(&self, transition: &Transition) {
        let mut writer = match self.writer.lock() {
            Ok(writer) => writer,
            Err(_) => {
                tracing::warn!("JSON event writer lock poisoned, dropping event");
                return;
            }
        };

        if let Err(e) = write_line(&mut *writer, transition) {
            tracing::warn!("Failed to write status event: {}", e);
        }
    }
}

fn write_line<W: Write>(writer: &mut W, transition: &Transition) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, transition)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Sink forwarding transitions to a channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Transition>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Transition>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StatusSink for ChannelSink {
    fn record(&self, transition: &Transition) {
        // Receiver gone means nobody is watching anymore
        let _ = self.tx.send(transition.clone());
    }
}

/// Ordered, shared record of every transition in a session
pub struct TransitionLog {
    entries: Mutex<Vec<Transition>>,
    sink: Arc<dyn StatusSink>,
}

impl TransitionLog {
    pub fn new(sink: Arc<dyn StatusSink>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            sink,
        }
    }

    /// Append a transition and forward it to the sink
    pub fn push(&self, transition: Transition) {
        self.sink.record(&transition);
        match self.entries.lock() {
            Ok(mut entries) => entries.push(transition),
            Err(poisoned) => poisoned.into_inner().push(transition),
        }
    }

    /// Copy of the log so far
    pub fn entries(&self) -> Vec<Transition> {
        match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl std::fmt::Debug for TransitionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransitionLog")
            .field("entries", &self.entries().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_lines_sink_writes_one_object_per_line() {
        let sink = JsonLinesSink::new(Vec::new());
        sink.record(&Transition::new("db", ServiceStatus::Pending, ServiceStatus::Launching));
        sink.record(&Transition::new("db", ServiceStatus::Launching, ServiceStatus::Running));

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["service"], "db");
        assert_eq!(first["from"], "pending");
        assert_eq!(first["to"], "launching");
    }

    #[test]
    fn test_log_keeps_order_and_feeds_sink() {
        let (sink, mut rx) = ChannelSink::new();
        let log = TransitionLog::new(Arc::new(sink));

        log.push(Transition::new("a", ServiceStatus::Pending, ServiceStatus::Launching));
        log.push(Transition::new("b", ServiceStatus::Pending, ServiceStatus::Launching));

        let entries = log.entries();
        assert_eq!(entries[0].service, "a");
        assert_eq!(entries[1].service, "b");
        assert_eq!(rx.try_recv().unwrap().service, "a");
        assert_eq!(rx.try_recv().unwrap().service, "b");
    }
}
