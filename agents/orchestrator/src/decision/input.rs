//! Extraction of QScore inputs from a `TaskResult` payload.

use std::collections::BTreeSet;

use cmo_core::qscore::{PreviousAttempt, QScoreInput};
use cmo_core::TaskResult;

/// Tokens shorter than this carry no signal.
const MIN_KEYWORD_LEN: usize = 3;

fn tokens(text: &str) -> Vec<String> {
    let unique: BTreeSet<String> = text
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() >= MIN_KEYWORD_LEN)
        .map(|t| t.to_lowercase())
        .collect();
    unique.into_iter().collect()
}

/// Distinct first tokens across the summary items.
fn unique_first_tokens(result: &TaskResult) -> u32 {
    result
        .summary
        .iter()
        .filter_map(|item| {
            item.text
                .split_whitespace()
                .next()
                .map(|t| t.to_lowercase())
        })
        .collect::<BTreeSet<String>>()
        .len() as u32
}

/// Summary keywords of a result, for the consistency signal.
pub fn summary_keywords(result: &TaskResult) -> Vec<String> {
    let joined = result
        .summary
        .iter()
        .map(|s| s.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");
    tokens(&joined)
}

/// Affordance actions of a result, for the consistency signal.
pub fn affordance_actions(result: &TaskResult) -> Vec<String> {
    result
        .affordances
        .iter()
        .map(|a| a.action.to_lowercase())
        .collect()
}

/// Fold a result and its attempt context into the calculator's input.
pub fn score_input(result: &TaskResult, previous: Option<PreviousAttempt>) -> QScoreInput {
    let affordance_text = result
        .affordances
        .iter()
        .map(|a| format!("{} {}", a.action, a.text))
        .collect::<Vec<_>>()
        .join(" ");
    QScoreInput {
        summary_items: result.summary.len() as u32,
        affordances: result.affordances.len() as u32,
        unique_first_tokens: unique_first_tokens(result),
        policy_degraded: result.slicing.policy_degraded,
        schema_valid: result.metadata.schema_valid,
        task_keywords: tokens(&result.task),
        affordance_text,
        summary_keywords: summary_keywords(result),
        affordance_actions: affordance_actions(result),
        latency_ms: result.metadata.latency_ms,
        retry_depth: result.attempt_no,
        previous,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmo_core::{Affordance, ResultMetadata, SlicingReport, SummaryItem};

    fn result() -> TaskResult {
        TaskResult {
            task: "extract the login selectors".into(),
            capability: "selector-extraction".into(),
            specialist_id: "specialist-sel".into(),
            attempt_no: 1,
            summary: vec![
                SummaryItem {
                    text: "Found login form".into(),
                },
                SummaryItem {
                    text: "Found submit button".into(),
                },
            ],
            affordances: vec![Affordance {
                action: "Click".into(),
                text: "the login button".into(),
            }],
            slicing: SlicingReport {
                policy_degraded: false,
            },
            metadata: ResultMetadata {
                schema_valid: true,
                latency_ms: 420,
            },
        }
    }

    #[test]
    fn extraction_counts_and_keywords() {
        let input = score_input(&result(), None);
        assert_eq!(input.summary_items, 2);
        assert_eq!(input.affordances, 1);
        // Both summaries start with "found".
        assert_eq!(input.unique_first_tokens, 1);
        assert!(input.task_keywords.contains(&"login".to_string()));
        assert!(!input.task_keywords.contains(&"the".to_string()));
        assert_eq!(input.affordance_actions, vec!["click".to_string()]);
        assert_eq!(input.retry_depth, 1);
    }

    #[test]
    fn keywords_are_deduplicated_and_lowercased() {
        let keywords = summary_keywords(&result());
        assert!(keywords.contains(&"found".to_string()));
        assert_eq!(
            keywords.iter().filter(|k| *k == "found").count(),
            1,
            "duplicates collapse"
        );
    }
}
