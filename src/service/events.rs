//! In-memory publish/subscribe for live run events.
//!
//! One broadcast channel per run, capacity 256 per subscriber. Publishing
//! never blocks: with no subscribers the event is dropped, and a slow
//! subscriber observes `Lagged` and skips the oldest events. The channel
//! entry is removed once the terminal status event has been published, so
//! late subscribers fall back to a replayed snapshot from the repository.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::models::{RunStatus, StepRole};

/// Per-subscriber buffer size. Beyond this, the oldest events are dropped.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Events published on a run's channel, serialized onto the SSE stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    Status {
        run_id: String,
        status: RunStatus,
    },
    Progress {
        run_id: String,
        stage: String,
        percent: i64,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        elapsed: Option<f64>,
    },
    Step {
        run_id: String,
        step_id: String,
        role: StepRole,
        content: String,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        files: Vec<String>,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        notes: Vec<String>,
    },
    Artifact {
        run_id: String,
        artifact_id: String,
        kind: String,
        path: String,
        bytes: i64,
    },
    Diff {
        run_id: String,
        summary: serde_json::Value,
    },
    Workspace {
        run_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        source_run_id: Option<String>,
        action: String,
        #[serde(skip_serializing_if = "Vec::is_empty", default)]
        entries: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_files: Option<usize>,
    },
    Error {
        run_id: String,
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        recovery: Option<String>,
    },
    CancellationRequested {
        run_id: String,
    },
}

impl RunEvent {
    /// True for the final `status` event of a run.
    pub fn is_terminal_status(&self) -> bool {
        matches!(self, RunEvent::Status { status, .. } if status.is_terminal())
    }
}

/// Process-wide broker keyed by run id.
pub struct EventBroker {
    channels: Mutex<HashMap<String, broadcast::Sender<RunEvent>>>,
}

impl Default for EventBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroker {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Best-effort, non-blocking delivery to current subscribers.
    pub fn publish(&self, run_id: &str, event: RunEvent) {
        let terminal = event.is_terminal_status();
        let mut channels = match self.channels.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if let Some(tx) = channels.get(run_id) {
            let _ = tx.send(event);
        }
        if terminal {
            channels.remove(run_id);
        }
    }

    /// Subscribe to a run's live events. The receiver only sees events
    /// published after this call; the caller is responsible for replaying
    /// the current status snapshot first.
    pub fn subscribe(&self, run_id: &str) -> broadcast::Receiver<RunEvent> {
        let mut channels = self
            .channels
            .lock()
            .expect("event broker lock poisoned");
        channels
            .entry(run_id.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_BUFFER).0)
            .subscribe()
    }

    /// Number of live channels (for tests and diagnostics).
    pub fn channel_count(&self) -> usize {
        self.channels.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(run_id: &str, status: RunStatus) -> RunEvent {
        RunEvent::Status {
            run_id: run_id.to_string(),
            status,
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers_in_order() {
        let broker = EventBroker::new();
        let mut rx1 = broker.subscribe("run-1");
        let mut rx2 = broker.subscribe("run-1");

        broker.publish("run-1", status("run-1", RunStatus::Queued));
        broker.publish("run-1", status("run-1", RunStatus::Running));

        for rx in [&mut rx1, &mut rx2] {
            match rx.recv().await.unwrap() {
                RunEvent::Status { status, .. } => assert_eq!(status, RunStatus::Queued),
                other => panic!("unexpected event: {:?}", other),
            }
            match rx.recv().await.unwrap() {
                RunEvent::Status { status, .. } => assert_eq!(status, RunStatus::Running),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_does_not_block_or_panic() {
        let broker = EventBroker::new();
        broker.publish("run-1", status("run-1", RunStatus::Running));
        assert_eq!(broker.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_events_are_isolated_per_run() {
        let broker = EventBroker::new();
        let mut rx_a = broker.subscribe("run-a");
        let _rx_b = broker.subscribe("run-b");

        broker.publish("run-b", status("run-b", RunStatus::Running));
        broker.publish("run-a", status("run-a", RunStatus::Queued));

        match rx_a.recv().await.unwrap() {
            RunEvent::Status { run_id, .. } => assert_eq!(run_id, "run-a"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminal_status_removes_channel() {
        let broker = EventBroker::new();
        let mut rx = broker.subscribe("run-1");
        assert_eq!(broker.channel_count(), 1);

        broker.publish("run-1", status("run-1", RunStatus::Succeeded));
        assert_eq!(broker.channel_count(), 0);

        let event = rx.recv().await.unwrap();
        assert!(event.is_terminal_status());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let broker = EventBroker::new();
        let mut rx = broker.subscribe("run-1");

        for _ in 0..(SUBSCRIBER_BUFFER + 10) {
            broker.publish("run-1", status("run-1", RunStatus::Running));
        }

        // The first recv reports the lag, then events resume.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n >= 10),
            other => panic!("expected Lagged, got {:?}", other),
        }
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = RunEvent::Progress {
            run_id: "run-1".into(),
            stage: "executing".into(),
            percent: 30,
            message: "Running the agent".into(),
            elapsed: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["percent"], 30);
        assert!(json.get("elapsed").is_none());

        let event = RunEvent::CancellationRequested {
            run_id: "run-1".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "cancellation_requested");
    }

    #[test]
    fn test_step_event_omits_empty_lists() {
        let event = RunEvent::Step {
            run_id: "run-1".into(),
            step_id: "step-1".into(),
            role: StepRole::Assistant,
            content: "done".into(),
            files: vec![],
            notes: vec![],
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(!json.contains("files"));
        assert!(!json.contains("notes"));
    }
}
