use serde_json::json;
use tokio::sync::broadcast;

use concierge_types::{ActiveTask, EngineEvent};

const CAPACITY: usize = 2048;

/// Broadcasts engine events to the HTTP shell and tests. Every event carries
/// a `sessionID` property so subscribers can filter per session.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Dropped silently when nobody is listening.
    pub fn publish(&self, event: EngineEvent) {
        if self.tx.send(event).is_err() {
            tracing::trace!("engine event dropped without subscribers");
        }
    }

    pub fn turn_completed(
        &self,
        session_id: &str,
        status: &str,
        tool: Option<&str>,
        task_id: Option<&str>,
        error_code: Option<&str>,
    ) {
        self.publish(EngineEvent::new(
            "turn.completed",
            json!({
                "sessionID": session_id,
                "status": status,
                "tool": tool,
                "taskID": task_id,
                "errorCode": error_code,
            }),
        ));
    }

    pub fn task_superseded(&self, session_id: &str, task: &ActiveTask) {
        self.publish(EngineEvent::new(
            "task.abandoned",
            json!({
                "sessionID": session_id,
                "taskID": task.id,
                "tool": task.tool,
                "reason": "superseded",
            }),
        ));
    }

    pub fn session_reset(&self, session_id: &str, removed: bool) {
        self.publish(EngineEvent::new(
            "session.reset",
            json!({ "sessionID": session_id, "removed": removed }),
        ));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use concierge_types::FieldMap;

    #[tokio::test]
    async fn turn_events_carry_session_and_outcome() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.turn_completed("s-1", "failed", Some("email_send"), None, Some("EXECUTION_TIMEOUT"));
        let event = rx.recv().await.expect("event");
        assert_eq!(event.event_type, "turn.completed");
        assert_eq!(event.properties["sessionID"], "s-1");
        assert_eq!(event.properties["tool"], "email_send");
        assert!(event.properties["taskID"].is_null());
        assert_eq!(event.properties["errorCode"], "EXECUTION_TIMEOUT");
    }

    #[tokio::test]
    async fn superseded_task_event_names_the_old_task() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let task = ActiveTask::new("calendar_create", FieldMap::new());
        bus.task_superseded("s-2", &task);
        let event = rx.recv().await.expect("event");
        assert_eq!(event.event_type, "task.abandoned");
        assert_eq!(event.properties["taskID"], task.id.as_str());
        assert_eq!(event.properties["reason"], "superseded");
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.session_reset("s-3", false);
    }
}
