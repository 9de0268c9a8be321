//! Phased execution plan construction.
//!
//! Plans come out of a fixed pipeline: infrastructure roles first in
//! parallel, then backend and frontend development sequentially, then
//! testing and documentation in parallel. Phases with no members are
//! omitted, and intra-phase ordering is tied off deterministically so the
//! same pool always yields the same plan.

use maestro_types::{
    AgentSpecification, IdGen, Phase, PhaseKind, PhaseStatus, Step, TemplateRole,
};

/// Phase names in pipeline order.
pub const PHASE_SETUP: &str = "Setup & Infrastructure";
/// Backend development phase name.
pub const PHASE_BACKEND: &str = "Backend Development";
/// Frontend development phase name.
pub const PHASE_FRONTEND: &str = "Frontend Development";
/// Testing and documentation phase name.
pub const PHASE_TESTING: &str = "Testing & Documentation";

/// A specification annotated with its template's role.
#[derive(Debug, Clone)]
pub struct RoledSpec {
    /// The concrete specification.
    pub spec: AgentSpecification,
    /// Role of the template it realizes.
    pub role: TemplateRole,
}

/// Build the fixed four-phase plan over `entries`.
///
/// Members are sorted by `(template_id, agent_id)` within each phase; empty
/// phases are dropped.
pub fn build_phases(entries: &[RoledSpec], idgen: &dyn IdGen) -> Vec<Phase> {
    let select = |roles: &[TemplateRole]| -> Vec<&RoledSpec> {
        let mut members: Vec<&RoledSpec> = entries
            .iter()
            .filter(|e| roles.contains(&e.role))
            .collect();
        members.sort_by(|a, b| {
            (&a.spec.template_id, a.spec.agent_id).cmp(&(&b.spec.template_id, b.spec.agent_id))
        });
        members
    };

    let blueprint: [(&str, PhaseKind, Vec<&RoledSpec>); 4] = [
        (
            PHASE_SETUP,
            PhaseKind::Parallel,
            select(&[TemplateRole::Database, TemplateRole::Devops]),
        ),
        (
            PHASE_BACKEND,
            PhaseKind::Sequential,
            select(&[TemplateRole::Backend]),
        ),
        (
            PHASE_FRONTEND,
            PhaseKind::Sequential,
            select(&[TemplateRole::Frontend]),
        ),
        (
            PHASE_TESTING,
            PhaseKind::Parallel,
            select(&[TemplateRole::Qa, TemplateRole::Writer]),
        ),
    ];

    blueprint
        .into_iter()
        .filter(|(_, _, members)| !members.is_empty())
        .map(|(name, kind, members)| {
            let phase_id = idgen.next_uuid();
            Phase {
                phase_id,
                name: name.to_string(),
                kind,
                steps: members
                    .iter()
                    .map(|entry| Step::pending(idgen.next_uuid(), entry.spec.agent_id, phase_id))
                    .collect(),
                status: PhaseStatus::Pending,
            }
        })
        .collect()
}
