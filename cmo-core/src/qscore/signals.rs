//! The eight bounded quality signals.
//!
//! Every function here is pure, deterministic, and returns a value in
//! `[0, 1]`. Anything that would require I/O has already been folded into
//! [`super::QScoreInput`] by the caller.

use std::collections::BTreeSet;

use super::QScoreInput;

fn ratio_capped(count: u32, cap: u32) -> f64 {
    (f64::from(count) / f64::from(cap)).min(1.0)
}

/// `0.5*min(items/10,1) + 0.3*min(affordances/5,1) + 0.2*min(tokens/5,1)`.
pub fn result_confidence(input: &QScoreInput) -> f64 {
    0.5 * ratio_capped(input.summary_items, 10)
        + 0.3 * ratio_capped(input.affordances, 5)
        + 0.2 * ratio_capped(input.unique_first_tokens, 5)
}

/// 1 unless the specialist degraded a policy to produce the result.
pub fn policy_ok(input: &QScoreInput) -> f64 {
    if input.policy_degraded {
        0.0
    } else {
        1.0
    }
}

/// 1 iff the result conformed to the output schema.
pub fn schema_ok(input: &QScoreInput) -> f64 {
    if input.schema_valid {
        1.0
    } else {
        0.0
    }
}

/// Piecewise score of the summaries-per-affordance ratio.
///
/// Under-evidenced results (r < 1) score the ratio itself; the sweet spot is
/// two to three summaries per affordance; rambling results decay down to a
/// floor of 0.5.
pub fn evidence_coverage(input: &QScoreInput) -> f64 {
    let r = f64::from(input.summary_items) / f64::from(input.affordances.max(1));
    if r < 1.0 {
        r
    } else if r < 2.0 {
        0.5 + 0.5 * (r - 1.0)
    } else if r <= 3.0 {
        1.0
    } else {
        (1.0 - 0.1 * (r - 3.0)).max(0.5)
    }
}

/// Keyword-overlap ratio between the task inputs and the concatenated
/// affordance text. Neutral 0.5 when the task carried no keywords.
pub fn affordance_alignment(input: &QScoreInput) -> f64 {
    if input.task_keywords.is_empty() {
        return 0.5;
    }
    let task: BTreeSet<String> = input
        .task_keywords
        .iter()
        .map(|k| k.to_lowercase())
        .collect();
    let affordance: BTreeSet<String> = tokenize(&input.affordance_text);
    let hits = task.intersection(&affordance).count();
    hits as f64 / task.len() as f64
}

/// 1 below 500 ms, 0 above 5000 ms, linear in between.
pub fn latency_norm(input: &QScoreInput) -> f64 {
    const FAST_MS: u64 = 500;
    const SLOW_MS: u64 = 5000;
    if input.latency_ms <= FAST_MS {
        1.0
    } else if input.latency_ms >= SLOW_MS {
        0.0
    } else {
        (SLOW_MS - input.latency_ms) as f64 / (SLOW_MS - FAST_MS) as f64
    }
}

/// 1, 0.7, 0.4, 0.1 for retry depth 0, 1, 2, >= 3.
pub fn retry_depth_penalty(input: &QScoreInput) -> f64 {
    match input.retry_depth {
        0 => 1.0,
        1 => 0.7,
        2 => 0.4,
        _ => 0.1,
    }
}

/// Mean of summary-keyword and affordance-action overlap with the previous
/// attempt; neutral 0.5 on the first attempt.
pub fn consistency_prev(input: &QScoreInput) -> f64 {
    let Some(previous) = &input.previous else {
        return 0.5;
    };
    let summaries = overlap(&input.summary_keywords, &previous.summary_keywords);
    let actions = overlap(&input.affordance_actions, &previous.affordance_actions);
    (summaries + actions) / 2.0
}

/// Jaccard overlap of two keyword sets; identical (including both-empty)
/// sets score 1.
fn overlap(a: &[String], b: &[String]) -> f64 {
    let a: BTreeSet<String> = a.iter().map(|k| k.to_lowercase()).collect();
    let b: BTreeSet<String> = b.iter().map(|k| k.to_lowercase()).collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

fn tokenize(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qscore::PreviousAttempt;

    fn base_input() -> QScoreInput {
        QScoreInput {
            summary_items: 6,
            affordances: 2,
            unique_first_tokens: 4,
            policy_degraded: false,
            schema_valid: true,
            task_keywords: vec!["login".to_string(), "form".to_string()],
            affordance_text: "click the login button on the form".to_string(),
            summary_keywords: vec!["login".to_string()],
            affordance_actions: vec!["click".to_string()],
            latency_ms: 350,
            retry_depth: 0,
            previous: None,
        }
    }

    #[test]
    fn confidence_caps_each_component() {
        let mut input = base_input();
        input.summary_items = 100;
        input.affordances = 100;
        input.unique_first_tokens = 100;
        assert!((result_confidence(&input) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn latency_boundaries() {
        let mut input = base_input();
        input.latency_ms = 500;
        assert_eq!(latency_norm(&input), 1.0);
        input.latency_ms = 5000;
        assert_eq!(latency_norm(&input), 0.0);
        input.latency_ms = 2750;
        assert!((latency_norm(&input) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn retry_penalty_floors_at_depth_three() {
        let mut input = base_input();
        for (depth, expected) in [(0, 1.0), (1, 0.7), (2, 0.4), (3, 0.1), (9, 0.1)] {
            input.retry_depth = depth;
            assert_eq!(retry_depth_penalty(&input), expected);
        }
    }

    #[test]
    fn evidence_coverage_piecewise_boundaries() {
        let mut input = base_input();
        // r = 0.5
        input.summary_items = 1;
        input.affordances = 2;
        assert!((evidence_coverage(&input) - 0.5).abs() < 1e-9);
        // r = 1 lands on the second piece's lower edge.
        input.summary_items = 2;
        assert!((evidence_coverage(&input) - 0.5).abs() < 1e-9);
        // r = 1.5
        input.summary_items = 3;
        assert!((evidence_coverage(&input) - 0.75).abs() < 1e-9);
        // r in [2, 3] is the plateau.
        input.summary_items = 4;
        assert_eq!(evidence_coverage(&input), 1.0);
        input.summary_items = 6;
        assert_eq!(evidence_coverage(&input), 1.0);
        // r = 5 decays; r = 13 floors at 0.5.
        input.summary_items = 10;
        assert!((evidence_coverage(&input) - 0.8).abs() < 1e-9);
        input.summary_items = 26;
        assert_eq!(evidence_coverage(&input), 0.5);
        // Zero affordances never divides by zero.
        input.affordances = 0;
        input.summary_items = 2;
        assert_eq!(evidence_coverage(&input), 1.0);
    }

    #[test]
    fn alignment_neutral_without_keywords() {
        let mut input = base_input();
        input.task_keywords.clear();
        assert_eq!(affordance_alignment(&input), 0.5);
    }

    #[test]
    fn alignment_counts_keyword_hits() {
        let input = base_input();
        // Both "login" and "form" appear in the affordance text.
        assert_eq!(affordance_alignment(&input), 1.0);
    }

    #[test]
    fn consistency_neutral_without_previous() {
        assert_eq!(consistency_prev(&base_input()), 0.5);
    }

    #[test]
    fn consistency_mixes_summary_and_action_overlap() {
        let mut input = base_input();
        input.previous = Some(PreviousAttempt {
            summary_keywords: vec!["login".to_string()],
            affordance_actions: vec!["scroll".to_string()],
        });
        // Summary overlap 1.0, action overlap 0.0.
        assert!((consistency_prev(&input) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn all_signals_bounded() {
        let mut input = base_input();
        input.previous = Some(PreviousAttempt {
            summary_keywords: vec![],
            affordance_actions: vec![],
        });
        for f in [
            result_confidence,
            policy_ok,
            schema_ok,
            evidence_coverage,
            affordance_alignment,
            latency_norm,
            retry_depth_penalty,
            consistency_prev,
        ] {
            let v = f(&input);
            assert!((0.0..=1.0).contains(&v), "signal out of range: {v}");
        }
    }
}
