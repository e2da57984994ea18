//! Service context: the explicit composition root shared by every component.
//!
//! Carries the logging capability and the channel the worker uses to talk
//! back to the supervisor.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Messages delivered to the supervisor's event loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisorEvent {
    /// Sent once per worker start, from the worker's own thread.
    WorkerReady { worker_id: Uuid, thread_id: i32 },
    /// The worker thread is gone, for whatever reason.
    WorkerExited { worker_id: Uuid },
}

/// Destination for tagged log lines.
pub trait LogSink: Send + Sync + fmt::Debug {
    fn write(&self, tag: &str, message: &str);
}

/// Forwards every line to `tracing` at info level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write(&self, tag: &str, message: &str) {
        tracing::info!(tag, "{message}");
    }
}

/// Keeps every line in memory. Used by tests to assert what was logged.
#[derive(Debug, Default)]
pub struct RecordingSink {
    lines: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `(tag, message)` written so far, oldest first.
    pub fn lines(&self) -> Vec<(String, String)> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }
}

impl LogSink for RecordingSink {
    fn write(&self, tag: &str, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((tag.to_string(), message.to_string()));
        }
    }
}

/// Cloneable handle to the process-wide services.
#[derive(Debug, Clone)]
pub struct ServiceContext {
    events: mpsc::UnboundedSender<SupervisorEvent>,
    sink: Arc<dyn LogSink>,
}

impl ServiceContext {
    /// Create a context plus the receiving end the supervisor drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        Self::with_sink(Arc::new(TracingSink))
    }

    /// Same as [`ServiceContext::new`], logging into `sink`.
    pub fn with_sink(sink: Arc<dyn LogSink>) -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events, sink }, rx)
    }

    /// Post an event; a closed receiver means the supervisor is gone and the
    /// event is dropped.
    pub fn notify(&self, event: SupervisorEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("supervisor event channel closed, dropping event");
        }
    }

    /// Log a tagged line. Sink failures never reach the caller.
    pub fn log(&self, tag: &str, message: &str) {
        self.sink.write(tag, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_receiver() {
        let (ctx, mut rx) = ServiceContext::new();
        let worker_id = Uuid::new_v4();
        ctx.notify(SupervisorEvent::WorkerReady {
            worker_id,
            thread_id: 42,
        });
        assert_eq!(
            rx.recv().await,
            Some(SupervisorEvent::WorkerReady {
                worker_id,
                thread_id: 42
            })
        );
    }

    #[test]
    fn notify_after_receiver_dropped_is_silent() {
        let (ctx, rx) = ServiceContext::new();
        drop(rx);
        ctx.notify(SupervisorEvent::WorkerExited {
            worker_id: Uuid::new_v4(),
        });
        ctx.log("test", "still fine");
    }

    #[test]
    fn log_lines_go_to_the_sink() {
        let sink = Arc::new(RecordingSink::new());
        let (ctx, _rx) = ServiceContext::with_sink(sink.clone());
        ctx.clone().log("WorkerThread", "Worker thread finished");
        assert_eq!(
            sink.lines(),
            vec![("WorkerThread".to_string(), "Worker thread finished".to_string())]
        );
    }

    #[test]
    fn ready_event_wire_shape() {
        let json = serde_json::to_value(SupervisorEvent::WorkerReady {
            worker_id: Uuid::nil(),
            thread_id: 7,
        })
        .unwrap();
        assert_eq!(json["kind"], "WORKER_READY");
        assert_eq!(json["thread_id"], 7);
    }
}
