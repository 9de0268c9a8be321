#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **maestro-evolution** – Performance tracking and prompt evolution.
//!
//! The engine consumes per-step execution outcomes, maintains a bounded
//! rolling window and EMA aggregates per agent, and proposes configuration
//! mutations when an agent's overall score falls below threshold. It only
//! *proposes*; applying a mutation is the orchestrator's call, at which
//! point a new prompt version starts accumulating its own statistics.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use maestro_types::{AgentId, ExecutionResult};

pub mod rewriter;

pub use rewriter::{PromptRewriter, TemplateRewriter};

/// Rolling window capacity per agent.
pub const SAMPLE_WINDOW: usize = 100;

/// EMA smoothing factor for response time and error rate.
pub const EMA_ALPHA: f64 = 0.1;

/// Score at or above which (with a clean error rate) no mutation is proposed.
pub const EVOLUTION_THRESHOLD: f64 = 0.70;

/// Error rate above which reinforcement is proposed even for good scores.
pub const ERROR_RATE_CEILING: f64 = 0.20;

/// Minimum usage before a prompt version competes on its score.
pub const MIN_VERSION_USAGE: u64 = 5;

//─────────────────────────────
//  Strategies and proposals
//─────────────────────────────

/// Evolution strategies for agent optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionStrategy {
    /// Small targeted changes.
    Mutation,
    /// Combine successful patterns.
    Crossover,
    /// Reinforce patterns that succeeded.
    Reinforcement,
    /// Remove ineffective parts.
    Pruning,
    /// Add new capabilities.
    Expansion,
}

impl EvolutionStrategy {
    /// Risk class of applying this strategy.
    pub fn risk(self) -> RiskLevel {
        match self {
            Self::Expansion | Self::Crossover => RiskLevel::High,
            Self::Mutation => RiskLevel::Medium,
            Self::Pruning | Self::Reinforcement => RiskLevel::Low,
        }
    }
}

/// Risk class of a proposed mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Safe to auto-apply.
    Low,
    /// Review advisable.
    Medium,
    /// Needs explicit approval.
    High,
}

/// A proposed configuration change for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// Agent the proposal targets.
    pub agent_id: AgentId,
    /// Prompt in effect when the proposal was made.
    pub current_prompt: String,
    /// Proposed replacement prompt.
    pub proposed_prompt: String,
    /// Strategy that produced the proposal.
    pub strategy: EvolutionStrategy,
    /// Estimated score gain, 0–1.
    pub expected_improvement: f64,
    /// Risk class.
    pub risk: RiskLevel,
}

//─────────────────────────────
//  Metrics
//─────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Sample {
    ok: bool,
    #[allow(dead_code)]
    elapsed_seconds: f64,
    had_error: bool,
}

/// Point-in-time performance snapshot for one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Mean of the last-window success bits.
    pub completion_rate: f64,
    /// EMA error rate.
    pub error_rate: f64,
    /// EMA response time in seconds.
    pub avg_response_time: f64,
    /// Quality score; derived from completion rate unless supplied.
    pub quality_score: f64,
    /// User satisfaction; zero unless supplied externally.
    pub user_satisfaction: f64,
    /// Resource usage, 0–1; derived from response time unless supplied.
    pub resource_usage: f64,
    /// Samples currently in the window.
    pub sample_count: usize,
}

impl PerformanceMetrics {
    /// Weighted overall score in [0, 1].
    pub fn overall_score(&self) -> f64 {
        let speed = (1.0 - self.avg_response_time / 60.0).max(0.0);
        let score = 0.30 * self.completion_rate
            + 0.25 * self.quality_score
            + 0.15 * speed
            + 0.20 * self.user_satisfaction
            + 0.10 * (1.0 - self.resource_usage);
        score.clamp(0.0, 1.0)
    }
}

/// Version of an agent's prompt with its accumulated statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptVersion {
    /// Version identifier.
    pub version_id: Uuid,
    /// Prompt text of this version.
    pub template_text: String,
    /// Executions attributed to this version.
    pub usage_count: u64,
    /// Running success rate, 0–1.
    pub success_rate: f64,
    /// Running mean execution time in seconds.
    pub avg_time: f64,
    /// Composite score used for best-version selection.
    pub performance_score: f64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

struct Tracker {
    samples: VecDeque<Sample>,
    avg_response_time: f64,
    error_rate: f64,
    quality_score: Option<f64>,
    user_satisfaction: Option<f64>,
    resource_usage: Option<f64>,
    current_prompt: String,
}

impl Tracker {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(SAMPLE_WINDOW),
            avg_response_time: 0.0,
            error_rate: 0.0,
            quality_score: None,
            user_satisfaction: None,
            resource_usage: None,
            current_prompt: String::new(),
        }
    }

    fn push(&mut self, sample: Sample) {
        if self.samples.len() == SAMPLE_WINDOW {
            self.samples.pop_front();
        }
        self.avg_response_time =
            self.avg_response_time * (1.0 - EMA_ALPHA) + sample.elapsed_seconds * EMA_ALPHA;
        let err = if sample.had_error { 1.0 } else { 0.0 };
        self.error_rate = self.error_rate * (1.0 - EMA_ALPHA) + err * EMA_ALPHA;
        self.samples.push_back(sample);
    }

    fn metrics(&self) -> PerformanceMetrics {
        let completion_rate = if self.samples.is_empty() {
            0.0
        } else {
            self.samples.iter().filter(|s| s.ok).count() as f64 / self.samples.len() as f64
        };
        PerformanceMetrics {
            completion_rate,
            error_rate: self.error_rate,
            avg_response_time: self.avg_response_time,
            quality_score: self.quality_score.unwrap_or(completion_rate),
            user_satisfaction: self.user_satisfaction.unwrap_or(0.0),
            resource_usage: self
                .resource_usage
                .unwrap_or_else(|| (self.avg_response_time / 60.0).min(1.0)),
            sample_count: self.samples.len(),
        }
    }
}

//─────────────────────────────
//  Engine
//─────────────────────────────

/// Per-agent performance tracking and mutation proposals.
pub struct EvolutionEngine {
    trackers: DashMap<AgentId, Tracker>,
    prompt_versions: DashMap<AgentId, Vec<PromptVersion>>,
    rewriter: Box<dyn PromptRewriter>,
}

impl EvolutionEngine {
    /// Create an engine with the deterministic template rewriter.
    pub fn new() -> Self {
        Self::with_rewriter(Box::new(TemplateRewriter))
    }

    /// Create an engine with a custom prompt rewriter.
    pub fn with_rewriter(rewriter: Box<dyn PromptRewriter>) -> Self {
        Self {
            trackers: DashMap::new(),
            prompt_versions: DashMap::new(),
            rewriter,
        }
    }

    /// Set the prompt currently in effect for an agent; carried into
    /// proposals as `current_prompt`.
    pub fn set_current_prompt(&self, agent_id: AgentId, prompt: impl Into<String>) {
        self.trackers
            .entry(agent_id)
            .or_insert_with(Tracker::new)
            .current_prompt = prompt.into();
    }

    /// Supply externally-measured quality/satisfaction/usage figures.
    pub fn set_external_scores(
        &self,
        agent_id: AgentId,
        quality_score: Option<f64>,
        user_satisfaction: Option<f64>,
        resource_usage: Option<f64>,
    ) {
        let mut tracker = self.trackers.entry(agent_id).or_insert_with(Tracker::new);
        tracker.quality_score = quality_score;
        tracker.user_satisfaction = user_satisfaction;
        tracker.resource_usage = resource_usage;
    }

    /// Record one execution outcome.
    ///
    /// Returns a [`Mutation`] when the agent's score falls below
    /// [`EVOLUTION_THRESHOLD`], or when a good score hides an error rate
    /// above [`ERROR_RATE_CEILING`]; otherwise `None`.
    pub fn record(&self, agent_id: AgentId, result: &ExecutionResult) -> Option<Mutation> {
        let (metrics, current_prompt) = {
            let mut tracker = self.trackers.entry(agent_id).or_insert_with(Tracker::new);
            tracker.push(Sample {
                ok: result.ok,
                elapsed_seconds: result.elapsed.as_secs_f64(),
                had_error: result.error.is_some() || !result.ok,
            });
            (tracker.metrics(), tracker.current_prompt.clone())
        };

        let score = metrics.overall_score();
        debug!(%agent_id, score, completion = metrics.completion_rate, "recorded execution sample");

        if score >= EVOLUTION_THRESHOLD && metrics.error_rate <= ERROR_RATE_CEILING {
            return None;
        }

        let strategy = Self::select_strategy(&metrics);
        let proposed_prompt = self.rewriter.rewrite(strategy, &current_prompt);
        let mutation = Mutation {
            agent_id,
            current_prompt,
            proposed_prompt,
            strategy,
            expected_improvement: 0.15 * (1.0 - score),
            risk: strategy.risk(),
        };
        info!(%agent_id, ?strategy, score, "proposing evolution mutation");
        Some(mutation)
    }

    /// Deterministic strategy selection by score bucket.
    pub fn select_strategy(metrics: &PerformanceMetrics) -> EvolutionStrategy {
        let score = metrics.overall_score();
        if score < 0.30 {
            EvolutionStrategy::Expansion
        } else if score < 0.50 {
            EvolutionStrategy::Mutation
        } else if score < 0.70 {
            EvolutionStrategy::Pruning
        } else if metrics.error_rate > ERROR_RATE_CEILING {
            EvolutionStrategy::Reinforcement
        } else {
            EvolutionStrategy::Mutation
        }
    }

    /// Current metrics snapshot for an agent.
    pub fn metrics(&self, agent_id: AgentId) -> Option<PerformanceMetrics> {
        self.trackers.get(&agent_id).map(|t| t.metrics())
    }

    /// Drop all tracked state for an agent (worker cleared).
    pub fn clear_agent(&self, agent_id: AgentId) {
        self.trackers.remove(&agent_id);
        self.prompt_versions.remove(&agent_id);
    }

    //─────────────────────────────
    //  Prompt version bookkeeping
    //─────────────────────────────

    /// Record a newly-applied prompt as a version and make it current.
    pub fn create_prompt_version(
        &self,
        agent_id: AgentId,
        template_text: impl Into<String>,
    ) -> PromptVersion {
        let version = PromptVersion {
            version_id: Uuid::new_v4(),
            template_text: template_text.into(),
            usage_count: 0,
            success_rate: 0.0,
            avg_time: 0.0,
            performance_score: 0.0,
            created_at: Utc::now(),
        };
        self.set_current_prompt(agent_id, version.template_text.clone());
        self.prompt_versions
            .entry(agent_id)
            .or_default()
            .push(version.clone());
        info!(%agent_id, version_id = %version.version_id, "created prompt version");
        version
    }

    /// Update a version's running statistics after an execution.
    pub fn update_prompt_performance(
        &self,
        agent_id: AgentId,
        version_id: Uuid,
        ok: bool,
        execution_time_secs: f64,
    ) {
        let Some(mut versions) = self.prompt_versions.get_mut(&agent_id) else {
            return;
        };
        let Some(version) = versions.iter_mut().find(|v| v.version_id == version_id) else {
            return;
        };
        version.usage_count += 1;
        let n = version.usage_count as f64;
        let ok_bit = if ok { 1.0 } else { 0.0 };
        version.success_rate = (version.success_rate * (n - 1.0) + ok_bit) / n;
        version.avg_time = (version.avg_time * (n - 1.0) + execution_time_secs) / n;
        version.performance_score =
            0.7 * version.success_rate + 0.3 * (1.0 - (version.avg_time / 60.0).min(1.0));
    }

    /// Best-scoring version with enough usage, else the most recent.
    pub fn get_best_prompt_version(&self, agent_id: AgentId) -> Option<PromptVersion> {
        let versions = self.prompt_versions.get(&agent_id)?;
        if versions.is_empty() {
            return None;
        }
        let best_proven = versions
            .iter()
            .filter(|v| v.usage_count >= MIN_VERSION_USAGE)
            .max_by(|a, b| {
                a.performance_score
                    .partial_cmp(&b.performance_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        Some(best_proven.unwrap_or_else(|| versions.last().unwrap()).clone())
    }
}

impl Default for EvolutionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn result(ok: bool, secs: f64) -> ExecutionResult {
        if ok {
            ExecutionResult::success(serde_json::Value::Null, Duration::from_secs_f64(secs))
        } else {
            ExecutionResult::failure("step failed", Duration::from_secs_f64(secs))
        }
    }

    #[test]
    fn half_successful_agent_gets_mutation_strategy() {
        let engine = EvolutionEngine::new();
        let agent = AgentId::generate();

        // 20 samples at 50% success, 10 s each.
        let mut last = None;
        for i in 0..20 {
            last = engine.record(agent, &result(i % 2 == 0, 10.0));
        }
        let mutation = last.expect("score below threshold must propose");
        assert_eq!(mutation.strategy, EvolutionStrategy::Mutation);
        assert_eq!(mutation.risk, RiskLevel::Medium);

        let metrics = engine.metrics(agent).unwrap();
        let score = metrics.overall_score();
        assert!(score < 0.5, "score was {score}");
        assert!(mutation.expected_improvement > 0.0);
    }

    #[test]
    fn healthy_agent_is_left_alone() {
        let engine = EvolutionEngine::new();
        let agent = AgentId::generate();

        let mut last = None;
        for i in 0..100 {
            last = engine.record(agent, &result(i % 10 != 0, 8.0));
        }
        assert!(last.is_none(), "90% success at 8 s must not propose");
        let score = engine.metrics(agent).unwrap().overall_score();
        assert!(score >= 0.7, "score was {score}");
    }

    #[test]
    fn high_error_rate_triggers_reinforcement_despite_good_score() {
        let engine = EvolutionEngine::new();
        let agent = AgentId::generate();

        for i in 0..100 {
            engine.record(agent, &result(i % 10 != 0, 8.0));
        }
        // Successful steps that still surface errors push the error EMA past
        // the ceiling without denting the completion rate.
        let mut flagged = ExecutionResult::success(serde_json::Value::Null, Duration::from_secs(8));
        flagged.error = Some("recovered from transient failure".into());
        let mut last = None;
        for _ in 0..15 {
            last = engine.record(agent, &flagged);
        }

        let mutation = last.expect("error rate above ceiling must propose");
        assert_eq!(mutation.strategy, EvolutionStrategy::Reinforcement);
        assert_eq!(mutation.risk, RiskLevel::Low);
        assert!(engine.metrics(agent).unwrap().error_rate > ERROR_RATE_CEILING);
    }

    #[test]
    fn hopeless_agent_gets_expansion() {
        let engine = EvolutionEngine::new();
        let agent = AgentId::generate();
        let mut last = None;
        for _ in 0..20 {
            last = engine.record(agent, &result(false, 55.0));
        }
        let mutation = last.unwrap();
        assert_eq!(mutation.strategy, EvolutionStrategy::Expansion);
        assert_eq!(mutation.risk, RiskLevel::High);
    }

    #[test]
    fn sample_window_is_bounded() {
        let engine = EvolutionEngine::new();
        let agent = AgentId::generate();
        for _ in 0..250 {
            engine.record(agent, &result(true, 1.0));
        }
        assert_eq!(engine.metrics(agent).unwrap().sample_count, SAMPLE_WINDOW);
    }

    #[test]
    fn prompt_versions_average_and_select() {
        let engine = EvolutionEngine::new();
        let agent = AgentId::generate();

        let seasoned = engine.create_prompt_version(agent, "seasoned prompt");
        let newest = engine.create_prompt_version(agent, "fresh prompt");

        // Not enough usage anywhere: most recent wins.
        assert_eq!(
            engine.get_best_prompt_version(agent).unwrap().version_id,
            newest.version_id
        );

        for _ in 0..6 {
            engine.update_prompt_performance(agent, seasoned.version_id, true, 6.0);
        }
        let best = engine.get_best_prompt_version(agent).unwrap();
        assert_eq!(best.version_id, seasoned.version_id);
        assert_eq!(best.usage_count, 6);
        assert!((best.success_rate - 1.0).abs() < f64::EPSILON);
        // 0.7 * 1.0 + 0.3 * (1 - 6/60)
        assert!((best.performance_score - 0.97).abs() < 1e-9);
    }

    #[test]
    fn external_scores_override_derivations() {
        let engine = EvolutionEngine::new();
        let agent = AgentId::generate();
        engine.set_external_scores(agent, Some(0.9), Some(0.8), Some(0.1));
        for _ in 0..10 {
            engine.record(agent, &result(true, 5.0));
        }
        let metrics = engine.metrics(agent).unwrap();
        assert!((metrics.quality_score - 0.9).abs() < f64::EPSILON);
        assert!((metrics.user_satisfaction - 0.8).abs() < f64::EPSILON);
        assert!((metrics.resource_usage - 0.1).abs() < f64::EPSILON);
    }
}
