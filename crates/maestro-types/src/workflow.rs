//! Workflow, phase, and step records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::requirements::ProjectType;
use crate::{AgentId, WorkflowId};

/// Overall workflow execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created but not yet executed.
    Pending,
    /// Currently executing.
    InProgress,
    /// Paused by the caller.
    Paused,
    /// All phases completed.
    Completed,
    /// A phase failed.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl WorkflowStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Execution discipline within a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseKind {
    /// Steps run concurrently; no step may depend on another member.
    Parallel,
    /// Steps run in order; outputs flow to later members.
    Sequential,
}

/// Status of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Not yet started.
    Pending,
    /// Currently executing.
    InProgress,
    /// All steps completed.
    Completed,
    /// At least one step failed.
    Failed,
    /// Skipped because an earlier phase failed.
    Skipped,
    /// Cancelled by the caller.
    Cancelled,
}

/// Status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Never started because an earlier step or phase failed.
    Skipped,
    /// Interrupted by a workflow cancel.
    Cancelled,
}

impl StepStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// One `execute` invocation on one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step identifier.
    pub step_id: Uuid,
    /// Worker this step runs on.
    pub agent_id: AgentId,
    /// Phase this step belongs to.
    pub phase_id: Uuid,
    /// Input snapshot; opaque to the core.
    pub inputs: serde_json::Value,
    /// Output snapshot; opaque to the core.
    pub outputs: serde_json::Value,
    /// Current status.
    pub status: StepStatus,
    /// Execution start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Execution end time.
    pub finished_at: Option<DateTime<Utc>>,
    /// Error string when failed.
    pub error: Option<String>,
}

impl Step {
    /// Build a pending step for the given worker and phase.
    pub fn pending(step_id: Uuid, agent_id: AgentId, phase_id: Uuid) -> Self {
        Self {
            step_id,
            agent_id,
            phase_id,
            inputs: serde_json::Value::Null,
            outputs: serde_json::Value::Null,
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// A named group of steps executed as parallel or sequential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    /// Phase identifier.
    pub phase_id: Uuid,
    /// Display name, e.g. "Backend Development".
    pub name: String,
    /// Execution discipline.
    pub kind: PhaseKind,
    /// Member steps in execution order.
    pub steps: Vec<Step>,
    /// Current status.
    pub status: PhaseStatus,
}

/// Complete workflow record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow identifier.
    pub workflow_id: WorkflowId,
    /// Display name.
    pub name: String,
    /// Original user description.
    pub description: String,
    /// Project classification from requirements analysis.
    pub project_type: ProjectType,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Owning user.
    pub owner_user_id: String,
    /// Chat session this workflow belongs to.
    pub session_id: String,
    /// Ordered execution phases.
    pub phases: Vec<Phase>,
    /// Current status.
    pub status: WorkflowStatus,
    /// Keep executing later steps/phases after a failure.
    #[serde(default)]
    pub continue_on_failure: bool,
    /// Apply evolution-proposed mutations at phase boundaries.
    #[serde(default)]
    pub auto_apply_evolution: bool,
}

impl Workflow {
    /// Total number of steps across all phases.
    pub fn total_steps(&self) -> usize {
        self.phases.iter().map(|p| p.steps.len()).sum()
    }

    /// Number of steps in a terminal-success state.
    pub fn completed_steps(&self) -> usize {
        self.phases
            .iter()
            .flat_map(|p| &p.steps)
            .filter(|s| s.status == StepStatus::Completed)
            .count()
    }

    /// Name of the phase currently in progress, if any.
    pub fn current_phase(&self) -> Option<&str> {
        self.phases
            .iter()
            .find(|p| p.status == PhaseStatus::InProgress)
            .map(|p| p.name.as_str())
    }

    /// All agent ids participating in this workflow.
    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.phases
            .iter()
            .flat_map(|p| p.steps.iter().map(|s| s.agent_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_phase_workflow() -> Workflow {
        let phase = |name: &str, statuses: &[StepStatus]| Phase {
            phase_id: Uuid::new_v4(),
            name: name.into(),
            kind: PhaseKind::Sequential,
            steps: statuses
                .iter()
                .map(|s| {
                    let mut step =
                        Step::pending(Uuid::new_v4(), AgentId::generate(), Uuid::new_v4());
                    step.status = *s;
                    step
                })
                .collect(),
            status: PhaseStatus::Pending,
        };
        Workflow {
            workflow_id: WorkflowId::generate(),
            name: "wf".into(),
            description: "desc".into(),
            project_type: ProjectType::WebApp,
            created_at: Utc::now(),
            owner_user_id: "user".into(),
            session_id: "session".into(),
            phases: vec![
                phase("a", &[StepStatus::Completed, StepStatus::Failed]),
                phase("b", &[StepStatus::Pending]),
            ],
            status: WorkflowStatus::InProgress,
            continue_on_failure: false,
            auto_apply_evolution: false,
        }
    }

    #[test]
    fn step_accounting_covers_every_step() {
        let wf = two_phase_workflow();
        assert_eq!(wf.total_steps(), 3);
        assert_eq!(wf.completed_steps(), 1);
        assert_eq!(wf.agent_ids().len(), 3);
    }

    #[test]
    fn terminal_statuses() {
        assert!(StepStatus::Completed.is_terminal());
        assert!(StepStatus::Skipped.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Paused.is_terminal());
    }
}
