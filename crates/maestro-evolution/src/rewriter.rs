//! Deterministic prompt rewriting per evolution strategy.
//!
//! Proposals must be reproducible for the same inputs, so the default
//! rewriter applies fixed textual transformations. An LLM-backed rewriter
//! can implement the same trait where richer rewrites are wanted.

use crate::EvolutionStrategy;

/// Produces a proposed prompt from the current one and a strategy.
pub trait PromptRewriter: Send + Sync {
    /// Rewrite `current` according to `strategy`.
    fn rewrite(&self, strategy: EvolutionStrategy, current: &str) -> String;
}

/// Fixed-transformation rewriter.
pub struct TemplateRewriter;

impl PromptRewriter for TemplateRewriter {
    fn rewrite(&self, strategy: EvolutionStrategy, current: &str) -> String {
        let base = current.trim();
        match strategy {
            EvolutionStrategy::Mutation => format!(
                "{base}\n\nBe precise and concise. State assumptions explicitly and \
                 specify the exact output format before producing it."
            ),
            EvolutionStrategy::Expansion => format!(
                "{base}\n\nAlso handle edge cases: empty or malformed input, partial \
                 context from earlier agents, and oversized outputs. Offer an \
                 alternative approach when the primary one is uncertain."
            ),
            EvolutionStrategy::Pruning => {
                // Keep the essential lines; drop repeated blank lines and
                // trailing elaborations.
                let mut kept: Vec<&str> = Vec::new();
                let mut last_blank = false;
                for line in base.lines() {
                    let blank = line.trim().is_empty();
                    if blank && last_blank {
                        continue;
                    }
                    last_blank = blank;
                    kept.push(line);
                }
                format!(
                    "{}\n\nKeep responses minimal: only the deliverable, no preamble.",
                    kept.join("\n")
                )
            }
            EvolutionStrategy::Reinforcement => format!(
                "{base}\n\nPrefer the approaches that succeeded in earlier runs of \
                 this role. When an error occurred before, name it and avoid the \
                 same path."
            ),
            EvolutionStrategy::Crossover => format!(
                "{base}\n\nBlend the strongest elements of your previous outputs: \
                 keep the structure that validated cleanly and the phrasing that \
                 required no follow-up."
            ),
        }
    }
}
