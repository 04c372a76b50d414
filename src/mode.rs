//! Query mode selection.
//!
//! Scores each query's complexity in `[0, 1]` from cheap lexical signals
//! plus an LM intent classification, then routes it: scores at or above the
//! configured threshold go to deep (graph-expanded) retrieval, everything
//! else to speed (vector-only). An intent-detection failure contributes
//! nothing and never fails the query.

use std::sync::Arc;

use crate::llm::{Intent, LanguageModel};
use crate::models::Mode;

/// Keywords signalling comparative, temporal, or causal questions.
/// Matched case-insensitively as substrings, each counted at most once.
const COMPLEX_KEYWORDS: [&str; 18] = [
    "compare",
    "difference",
    "versus",
    "vs",
    "contrast",
    "how",
    "why",
    "when",
    "evolution",
    "change",
    "trend",
    "cause",
    "effect",
    "impact",
    "influence",
    "relationship",
    "between",
    "among",
];

pub struct ModeSelector {
    lm: Arc<dyn LanguageModel>,
    threshold: f64,
}

impl ModeSelector {
    pub fn new(lm: Arc<dyn LanguageModel>, threshold: f64) -> Self {
        Self { lm, threshold }
    }

    /// Classify `query` as speed or deep, returning the mode and the
    /// complexity score that drove the decision.
    pub async fn select_mode(&self, query: &str) -> (Mode, f64) {
        let score = self.complexity(query).await;

        let mode = if score >= self.threshold {
            Mode::Deep
        } else {
            Mode::Speed
        };

        tracing::info!(score, mode = mode.as_str(), "mode selected");
        (mode, score)
    }

    /// Human-readable rationale for the routing decision, surfaced in query
    /// reasoning steps.
    pub fn explain_selection(&self, mode: Mode, score: f64) -> String {
        match mode {
            Mode::Speed => format!(
                "Using speed mode (complexity: {:.2}). This appears to be a straightforward \
                 factual query answerable with vector search alone.",
                score
            ),
            Mode::Deep => format!(
                "Using deep mode (complexity: {:.2}). This query calls for multi-hop \
                 reasoning across the knowledge graph.",
                score
            ),
        }
    }

    async fn complexity(&self, query: &str) -> f64 {
        let mut score = 0.0;

        let word_count = query.split_whitespace().count();
        if word_count > 20 {
            score += 0.3;
        } else if word_count > 10 {
            score += 0.15;
        }

        let question_marks = query.matches('?').count();
        if question_marks > 1 {
            score += 0.2;
        }

        let query_lower = query.to_lowercase();
        let keyword_hits = COMPLEX_KEYWORDS
            .iter()
            .filter(|kw| query_lower.contains(*kw))
            .count();
        score += (keyword_hits as f64 * 0.15).min(0.4);

        match self.lm.detect_intent(query).await {
            Ok(Intent::Comparative) | Ok(Intent::Temporal) | Ok(Intent::Causal) => score += 0.3,
            Ok(Intent::Exploratory) => score += 0.2,
            Ok(Intent::Factual) => {}
            Err(e) => {
                tracing::warn!(error = %e, "intent detection failed");
            }
        }

        score.min(1.0)
    }
}
