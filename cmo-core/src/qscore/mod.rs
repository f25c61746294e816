//! The QScore calculator: eight bounded signals, weighted fusion, and a
//! static calibration table.
//!
//! Scoring is pure CPU. The calculator never suspends, and identical inputs
//! always produce identical scores; the decision engine depends on that for
//! idempotent re-grading of redelivered results.

mod calibration;
pub mod signals;

pub use calibration::{CalibrationBin, CalibrationTable};
use serde::{Deserialize, Serialize};

use crate::DecisionError;

/// Tolerance on the weight sum.
const WEIGHT_SUM_TOLERANCE: f64 = 0.001;

/// Keywords and actions of the previous attempt, for the consistency signal.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviousAttempt {
    /// Summary keywords of the previous attempt.
    pub summary_keywords: Vec<String>,
    /// Affordance actions of the previous attempt.
    pub affordance_actions: Vec<String>,
}

/// Everything the signals need, extracted from a `TaskResult` envelope and
/// its invocation context by the decision engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QScoreInput {
    /// Number of summary items in the result.
    pub summary_items: u32,
    /// Number of affordances in the result.
    pub affordances: u32,
    /// Unique first tokens across summary items.
    pub unique_first_tokens: u32,
    /// Whether the specialist degraded a policy.
    pub policy_degraded: bool,
    /// Whether the result passed schema validation.
    pub schema_valid: bool,
    /// Keywords from the task inputs.
    pub task_keywords: Vec<String>,
    /// Concatenated affordance text.
    pub affordance_text: String,
    /// Summary keywords of this attempt.
    pub summary_keywords: Vec<String>,
    /// Affordance actions of this attempt.
    pub affordance_actions: Vec<String>,
    /// Specialist latency.
    pub latency_ms: u64,
    /// How many retries preceded this attempt.
    pub retry_depth: u32,
    /// The previous attempt, when there was one.
    pub previous: Option<PreviousAttempt>,
}

/// Weights of the eight signals. Must sum to 1.0 within 0.001.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QScoreWeights {
    /// Weight of `result_confidence`.
    pub confidence: f64,
    /// Weight of `policy_ok`.
    pub policy: f64,
    /// Weight of `schema_ok`.
    pub schema: f64,
    /// Weight of `evidence_coverage`.
    pub evidence: f64,
    /// Weight of `affordance_alignment`.
    pub alignment: f64,
    /// Weight of `latency_norm`.
    pub latency: f64,
    /// Weight of `retry_depth_penalty`.
    pub retry: f64,
    /// Weight of `consistency_prev`.
    pub consistency: f64,
}

impl Default for QScoreWeights {
    fn default() -> Self {
        Self {
            confidence: 0.25,
            policy: 0.20,
            schema: 0.15,
            evidence: 0.15,
            alignment: 0.10,
            latency: 0.05,
            retry: 0.05,
            consistency: 0.05,
        }
    }
}

impl QScoreWeights {
    /// Sum of all eight weights.
    pub fn sum(&self) -> f64 {
        self.confidence
            + self.policy
            + self.schema
            + self.evidence
            + self.alignment
            + self.latency
            + self.retry
            + self.consistency
    }

    /// Reject any configuration whose weights do not sum to 1.0 +/- 0.001.
    pub fn validate(&self) -> Result<(), DecisionError> {
        let sum = self.sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(DecisionError::InvalidWeights(sum));
        }
        Ok(())
    }
}

/// The eight computed signal values, each in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalValues {
    /// `result_confidence`.
    pub confidence: f64,
    /// `policy_ok`.
    pub policy: f64,
    /// `schema_ok`.
    pub schema: f64,
    /// `evidence_coverage`.
    pub evidence: f64,
    /// `affordance_alignment`.
    pub alignment: f64,
    /// `latency_norm`.
    pub latency: f64,
    /// `retry_depth_penalty`.
    pub retry: f64,
    /// `consistency_prev`.
    pub consistency: f64,
}

impl SignalValues {
    fn named(&self) -> [(&'static str, f64); 8] {
        [
            ("result_confidence", self.confidence),
            ("policy_ok", self.policy),
            ("schema_ok", self.schema),
            ("evidence_coverage", self.evidence),
            ("affordance_alignment", self.alignment),
            ("latency_norm", self.latency),
            ("retry_depth_penalty", self.retry),
            ("consistency_prev", self.consistency),
        ]
    }
}

/// A computed, calibrated score with its explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QScoreResult {
    /// The individual signal values.
    pub signals: SignalValues,
    /// Weighted sum before calibration, clamped to `[0, 1]`.
    pub raw: f64,
    /// Calibrated score.
    pub calibrated: f64,
    /// Top contributors and weaknesses, for grading-event reasons.
    pub explanation: String,
}

/// Computes QScores from a fixed weight and calibration configuration.
#[derive(Debug, Clone)]
pub struct QScoreCalculator {
    weights: QScoreWeights,
    calibration: CalibrationTable,
}

impl QScoreCalculator {
    /// Build a calculator, rejecting invalid weights up front.
    pub fn new(
        weights: QScoreWeights,
        calibration: CalibrationTable,
    ) -> Result<Self, DecisionError> {
        weights.validate()?;
        Ok(Self {
            weights,
            calibration,
        })
    }

    /// The configured weights.
    pub fn weights(&self) -> &QScoreWeights {
        &self.weights
    }

    /// Compute signals, fuse, calibrate, and explain.
    pub fn compute(&self, input: &QScoreInput) -> QScoreResult {
        let signals = SignalValues {
            confidence: signals::result_confidence(input),
            policy: signals::policy_ok(input),
            schema: signals::schema_ok(input),
            evidence: signals::evidence_coverage(input),
            alignment: signals::affordance_alignment(input),
            latency: signals::latency_norm(input),
            retry: signals::retry_depth_penalty(input),
            consistency: signals::consistency_prev(input),
        };
        let w = &self.weights;
        let raw = (w.confidence * signals.confidence
            + w.policy * signals.policy
            + w.schema * signals.schema
            + w.evidence * signals.evidence
            + w.alignment * signals.alignment
            + w.latency * signals.latency
            + w.retry * signals.retry
            + w.consistency * signals.consistency)
            .clamp(0.0, 1.0);
        let calibrated = self.calibration.calibrate(raw);
        let explanation = explain(&signals, w);
        QScoreResult {
            signals,
            raw,
            calibrated,
            explanation,
        }
    }
}

impl Default for QScoreCalculator {
    fn default() -> Self {
        Self::new(QScoreWeights::default(), CalibrationTable::identity())
            .expect("default weights sum to 1.0")
    }
}

/// Lists the top-3 weighted contributors, then every signal under 0.5 as a
/// weakness.
fn explain(signals: &SignalValues, weights: &QScoreWeights) -> String {
    let weighted = [
        weights.confidence,
        weights.policy,
        weights.schema,
        weights.evidence,
        weights.alignment,
        weights.latency,
        weights.retry,
        weights.consistency,
    ];
    let mut contributors: Vec<(&'static str, f64)> = signals
        .named()
        .iter()
        .zip(weighted.iter())
        .map(|((name, value), weight)| (*name, value * weight))
        .collect();
    contributors.sort_by(|a, b| b.1.partial_cmp(&a.1).expect("weighted signals are finite"));

    let top: Vec<String> = contributors
        .iter()
        .take(3)
        .map(|(name, contribution)| format!("{name}={contribution:.3}"))
        .collect();
    let weaknesses: Vec<String> = signals
        .named()
        .iter()
        .filter(|(_, value)| *value < 0.5)
        .map(|(name, value)| format!("{name}={value:.2}"))
        .collect();

    if weaknesses.is_empty() {
        format!("top: {}", top.join(", "))
    } else {
        format!("top: {}; weak: {}", top.join(", "), weaknesses.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strong_input() -> QScoreInput {
        QScoreInput {
            summary_items: 6,
            affordances: 2,
            unique_first_tokens: 5,
            policy_degraded: false,
            schema_valid: true,
            task_keywords: vec!["login".to_string()],
            affordance_text: "click login".to_string(),
            summary_keywords: vec!["login".to_string()],
            affordance_actions: vec!["click".to_string()],
            latency_ms: 350,
            retry_depth: 0,
            previous: None,
        }
    }

    #[test]
    fn default_weights_are_valid() {
        QScoreWeights::default().validate().unwrap();
    }

    #[test]
    fn skewed_weights_rejected() {
        let mut weights = QScoreWeights::default();
        weights.confidence = 0.5;
        let err = weights.validate().unwrap_err();
        assert_eq!(err.code(), "invalid_weights");
    }

    #[test]
    fn tolerance_is_one_per_mille() {
        let mut weights = QScoreWeights::default();
        weights.confidence += 0.0009;
        assert!(weights.validate().is_ok());
        weights.confidence += 0.002;
        assert!(weights.validate().is_err());
    }

    #[test]
    fn strong_result_scores_above_accept_threshold() {
        let result = QScoreCalculator::default().compute(&strong_input());
        assert!(result.raw >= 0.75, "raw = {}", result.raw);
        assert_eq!(result.raw, result.calibrated);
        assert!((0.0..=1.0).contains(&result.raw));
    }

    #[test]
    fn weak_result_scores_low() {
        let input = QScoreInput {
            summary_items: 1,
            affordances: 3,
            unique_first_tokens: 1,
            schema_valid: false,
            latency_ms: 900,
            ..strong_input()
        };
        let result = QScoreCalculator::default().compute(&input);
        assert!(result.raw < 0.60, "raw = {}", result.raw);
        assert!(result.explanation.contains("weak:"));
        assert!(result.explanation.contains("schema_ok"));
    }

    #[test]
    fn calibration_applied_when_bin_covers_raw() {
        let calculator = QScoreCalculator::new(
            QScoreWeights::default(),
            CalibrationTable::new(vec![CalibrationBin {
                min: 0.0,
                max: 1.0,
                calibrated: 0.42,
            }])
            .unwrap(),
        )
        .unwrap();
        assert_eq!(calculator.compute(&strong_input()).calibrated, 0.42);
    }

    #[test]
    fn deterministic() {
        let calculator = QScoreCalculator::default();
        let input = strong_input();
        assert_eq!(calculator.compute(&input), calculator.compute(&input));
    }

    #[test]
    fn explanation_names_top_contributors() {
        let result = QScoreCalculator::default().compute(&strong_input());
        assert!(result.explanation.starts_with("top: "));
        assert!(result.explanation.contains("result_confidence"));
    }
}
