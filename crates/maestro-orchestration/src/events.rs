//! Typed workflow events emitted on the bus.
//!
//! The orchestrator narrates execution as broadcast messages; the service
//! layer forwards them from the bus's monitor tap to subscribed clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use maestro_bus::{Message, MessageBus, MessageType};
use maestro_types::{AgentId, WorkflowId};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEventKind {
    /// A phase began executing.
    PhaseStarted,
    /// A phase finished (all member steps terminal).
    PhaseCompleted,
    /// A step began executing.
    StepStarted,
    /// A step finished successfully.
    StepCompleted,
    /// A step failed.
    StepFailed,
    /// The workflow completed successfully.
    WorkflowCompleted,
    /// The workflow failed.
    WorkflowFailed,
    /// The workflow was cancelled.
    WorkflowCancelled,
}

/// One streamed workflow update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    /// Unique update id.
    pub update_id: Uuid,
    /// Workflow this update belongs to.
    pub workflow_id: WorkflowId,
    /// What happened.
    pub kind: WorkflowEventKind,
    /// Human-readable summary.
    pub message: String,
    /// Structured details (phase/step/agent ids, errors).
    pub data: serde_json::Value,
    /// Emission time.
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    /// Build an event.
    pub fn new(
        workflow_id: WorkflowId,
        kind: WorkflowEventKind,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            update_id: Uuid::new_v4(),
            workflow_id,
            kind,
            message: message.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Try to decode a bus message back into a workflow event.
    pub fn from_message(message: &Message) -> Option<Self> {
        if message.message_type != MessageType::Event {
            return None;
        }
        serde_json::from_value(message.payload.clone()).ok()
    }
}

/// Broadcast an event on the bus; delivery is best-effort.
pub fn publish(bus: &MessageBus, sender: AgentId, event: WorkflowEvent) {
    let payload = match serde_json::to_value(&event) {
        Ok(payload) => payload,
        Err(_) => return,
    };
    let _ = bus.broadcast(Message::broadcast(sender, MessageType::Event, payload));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_roundtrip_through_messages() {
        let event = WorkflowEvent::new(
            WorkflowId::generate(),
            WorkflowEventKind::StepCompleted,
            "step done",
            serde_json::json!({"step_id": "x"}),
        );
        let message = Message::broadcast(
            AgentId::generate(),
            MessageType::Event,
            serde_json::to_value(&event).unwrap(),
        );
        let decoded = WorkflowEvent::from_message(&message).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn non_event_messages_decode_to_none() {
        let message = Message::broadcast(
            AgentId::generate(),
            MessageType::Sync,
            serde_json::json!({}),
        );
        assert!(WorkflowEvent::from_message(&message).is_none());
    }
}
