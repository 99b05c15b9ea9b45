//! Streaming run events.
//!
//! Every run owns one FIFO channel. Progress messages flow through it as
//! `log`/`info`/`warn`/`error` events and the run ends with exactly one
//! `done` event, after which the channel is closed.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Failure payload carried by a terminal `done` event.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RunFailure {
    pub message: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RunEvent {
    Log { message: Vec<Value> },
    Info { message: Vec<Value> },
    Warn { message: Vec<Value> },
    Error { message: Vec<Value> },
    Done {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<RunFailure>,
    },
}

impl RunEvent {
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventLevel {
    Log,
    Info,
    Warn,
    Error,
}

/// Sending half of a run's event stream.
///
/// `finish` takes the sender out under the same lock `emit` uses, so nothing
/// can follow the terminal event.
pub struct RunChannel {
    sender: Mutex<Option<mpsc::UnboundedSender<RunEvent>>>,
}

impl RunChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                sender: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Queue `event`. Silently dropped once the channel is finished.
    pub fn emit(&self, event: RunEvent) {
        let Ok(guard) = self.sender.lock() else {
            return;
        };
        if let Some(tx) = guard.as_ref() {
            // A dropped receiver only means nobody is listening anymore.
            let _ = tx.send(event);
        }
    }

    /// Send the terminal event and close the channel. Returns false if the
    /// channel had already been finished.
    pub fn finish(&self, data: Option<Value>, error: Option<RunFailure>) -> bool {
        let Ok(mut guard) = self.sender.lock() else {
            return false;
        };
        match guard.take() {
            Some(tx) => {
                let _ = tx.send(RunEvent::Done { data, error });
                true
            }
            None => false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.sender.lock().map(|g| g.is_none()).unwrap_or(true)
    }
}

/// Per-run logger. Mirrors every message to the `log` crate (prefixed with
/// the run id) and, when attached to a channel, to the run's event stream.
#[derive(Clone)]
pub struct RunLogger {
    run_id: String,
    channel: Option<Arc<RunChannel>>,
}

impl RunLogger {
    /// A logger that only writes to the `log` crate.
    pub fn detached(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            channel: None,
        }
    }

    /// A logger attached to a fresh channel, plus the receiving end.
    pub fn channel(run_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (channel, rx) = RunChannel::new();
        (
            Self {
                run_id: run_id.into(),
                channel: Some(Arc::new(channel)),
            },
            rx,
        )
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn emit(&self, level: EventLevel, message: Vec<Value>) {
        let text = render(&message);
        match level {
            EventLevel::Log => log::debug!("[{}] {text}", self.run_id),
            EventLevel::Info => log::info!("[{}] {text}", self.run_id),
            EventLevel::Warn => log::warn!("[{}] {text}", self.run_id),
            EventLevel::Error => log::error!("[{}] {text}", self.run_id),
        }

        if let Some(channel) = &self.channel {
            channel.emit(match level {
                EventLevel::Log => RunEvent::Log { message },
                EventLevel::Info => RunEvent::Info { message },
                EventLevel::Warn => RunEvent::Warn { message },
                EventLevel::Error => RunEvent::Error { message },
            });
        }
    }

    pub fn log(&self, text: impl Into<String>) {
        self.emit(EventLevel::Log, vec![Value::String(text.into())]);
    }

    pub fn info(&self, text: impl Into<String>) {
        self.emit(EventLevel::Info, vec![Value::String(text.into())]);
    }

    /// An info event with a structured payload after the text.
    pub fn info_with(&self, text: impl Into<String>, payload: Value) {
        self.emit(EventLevel::Info, vec![Value::String(text.into()), payload]);
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.emit(EventLevel::Warn, vec![Value::String(text.into())]);
    }

    pub fn error(&self, text: impl Into<String>) {
        self.emit(EventLevel::Error, vec![Value::String(text.into())]);
    }

    /// Emit the terminal `done` event. Only the first call has any effect.
    pub fn finish(&self, outcome: Result<Value, String>) -> bool {
        match &outcome {
            Ok(_) => log::info!("[{}] run finished", self.run_id),
            Err(message) => log::error!("[{}] run failed: {message}", self.run_id),
        }
        let Some(channel) = &self.channel else {
            return true;
        };
        match outcome {
            Ok(data) => channel.finish(Some(data), None),
            Err(message) => channel.finish(None, Some(RunFailure { message })),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_finished())
    }
}

fn render(message: &[Value]) -> String {
    message
        .iter()
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
