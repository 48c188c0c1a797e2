//! Trust-weighted selection among consensus answers
//!
//! Each successful answer scores `trust_weight × confidence`, with a
//! missing confidence counted as neutral (1.0). The highest score wins;
//! ties go to the lower latency, then to the provider configured first.

use std::cmp::Ordering;
use std::time::Duration;

use serde::Serialize;

use crate::adapter::ProviderResponse;
use crate::resilience::NEUTRAL_CONFIDENCE;

/// One successful consensus participant.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub response: ProviderResponse,
    pub trust_weight: f64,
    /// Position in the configured provider order.
    pub config_order: usize,
}

impl Candidate {
    pub fn score(&self) -> f64 {
        let confidence = self.response.confidence.unwrap_or(NEUTRAL_CONFIDENCE);
        self.trust_weight * confidence
    }

    fn latency(&self) -> Duration {
        self.response.latency
    }
}

/// Score of one participant, for logging and introspection.
#[derive(Debug, Clone, Serialize)]
pub struct ScoreEntry {
    pub provider: String,
    pub score: f64,
    pub latency_ms: u64,
}

/// Result of a voting round.
#[derive(Debug, Clone)]
pub struct VoteOutcome {
    pub winner: Candidate,
    pub score: f64,
    pub scores: Vec<ScoreEntry>,
}

/// `Greater` when `a` beats `b`.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    a.score()
        .total_cmp(&b.score())
        .then_with(|| b.latency().cmp(&a.latency()))
        .then_with(|| b.config_order.cmp(&a.config_order))
}

/// Pick the best candidate, or `None` when there are none.
pub fn select_best(candidates: Vec<Candidate>) -> Option<VoteOutcome> {
    let scores = candidates
        .iter()
        .map(|c| ScoreEntry {
            provider: c.response.provider.clone(),
            score: c.score(),
            latency_ms: c.latency().as_millis() as u64,
        })
        .collect();

    let winner = candidates.into_iter().max_by(rank)?;
    Some(VoteOutcome {
        score: winner.score(),
        winner,
        scores,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, trust: f64, confidence: Option<f64>, latency_ms: u64, order: usize) -> Candidate {
        Candidate {
            response: ProviderResponse {
                provider: id.to_string(),
                text: format!("answer from {id}"),
                confidence,
                latency: Duration::from_millis(latency_ms),
                usage: None,
                attempts: 1,
            },
            trust_weight: trust,
            config_order: order,
        }
    }

    #[test]
    fn highest_confidence_wins_with_equal_trust() {
        let outcome = select_best(vec![
            candidate("a", 1.0, Some(0.6), 100, 0),
            candidate("b", 1.0, Some(0.9), 300, 1),
            candidate("c", 1.0, Some(0.7), 50, 2),
        ])
        .unwrap();
        assert_eq!(outcome.winner.response.provider, "b");
        assert!((outcome.score - 0.9).abs() < f64::EPSILON);
        assert_eq!(outcome.scores.len(), 3);
    }

    #[test]
    fn trust_weight_scales_confidence() {
        let outcome = select_best(vec![
            candidate("cheap", 0.5, Some(1.0), 10, 0),
            candidate("trusted", 0.9, Some(0.8), 10, 1),
        ])
        .unwrap();
        assert_eq!(outcome.winner.response.provider, "trusted");
    }

    #[test]
    fn missing_confidence_is_neutral() {
        let outcome = select_best(vec![
            candidate("silent", 0.8, None, 10, 0),
            candidate("unsure", 1.0, Some(0.5), 10, 1),
        ])
        .unwrap();
        assert_eq!(outcome.winner.response.provider, "silent");
        assert!((outcome.score - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn ties_go_to_lower_latency_then_config_order() {
        let outcome = select_best(vec![
            candidate("slow", 1.0, None, 400, 0),
            candidate("fast", 1.0, None, 120, 1),
        ])
        .unwrap();
        assert_eq!(outcome.winner.response.provider, "fast");

        let outcome = select_best(vec![
            candidate("second", 1.0, None, 100, 1),
            candidate("first", 1.0, None, 100, 0),
        ])
        .unwrap();
        assert_eq!(outcome.winner.response.provider, "first");
    }

    #[test]
    fn no_candidates_no_winner() {
        assert!(select_best(Vec::new()).is_none());
    }
}
