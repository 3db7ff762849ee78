use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::batch::RESERVED_MARKERS;
use crate::corpus::TokenAlignmentMap;
use crate::sampler::EpochInstance;

/// Precision/recall/F1 for one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassReport {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Fraction of positions where `predicted` matches `truth`.
pub fn accuracy(truth: &[usize], predicted: &[usize]) -> f64 {
    assert_eq!(truth.len(), predicted.len(), "label sequences must align");
    if truth.is_empty() {
        return 0.0;
    }
    let correct = truth
        .iter()
        .zip(predicted)
        .filter(|(t, p)| t == p)
        .count();
    correct as f64 / truth.len() as f64
}

/// One-vs-rest precision/recall/F1 per class, keyed by class name. Classes
/// absent from both sequences still appear, with zeroed scores.
pub fn per_class_report(
    class_names: &[String],
    truth: &[usize],
    predicted: &[usize],
) -> BTreeMap<String, ClassReport> {
    assert_eq!(truth.len(), predicted.len(), "label sequences must align");
    let mut report = BTreeMap::new();
    for (class_id, name) in class_names.iter().enumerate() {
        let mut true_positives = 0usize;
        let mut false_positives = 0usize;
        let mut false_negatives = 0usize;
        let mut support = 0usize;
        for (&t, &p) in truth.iter().zip(predicted) {
            if t == class_id {
                support += 1;
                if p == class_id {
                    true_positives += 1;
                } else {
                    false_negatives += 1;
                }
            } else if p == class_id {
                false_positives += 1;
            }
        }
        report.insert(
            name.clone(),
            prf(true_positives, false_positives, false_negatives, support),
        );
    }
    report
}

/// Agreement between predicted rationales and the annotated evidence at
/// original-token granularity, computed through the token alignment map so it
/// is independent of the sub-token padding/truncation scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RationaleScores {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Scores `hard_predictions` (one row per instance, reserved head included)
/// against each instance's un-truncated sub-token targets. An original token
/// counts as predicted/annotated when any sub-token of its aligned span is;
/// documents missing from the alignment map fall back to identity spans.
pub fn rationale_alignment_scores(
    epoch_data: &[EpochInstance],
    hard_predictions: &[Vec<u8>],
    token_mapping: &TokenAlignmentMap,
) -> RationaleScores {
    assert_eq!(
        epoch_data.len(),
        hard_predictions.len(),
        "one prediction row per instance"
    );

    let mut true_positives = 0usize;
    let mut false_positives = 0usize;
    let mut false_negatives = 0usize;

    for (instance, row) in epoch_data.iter().zip(hard_predictions) {
        let evidence = &instance.evidence;
        let reserved = evidence.query_len() + RESERVED_MARKERS;
        let doc_predictions = row.get(reserved..).unwrap_or(&[]);

        let identity: Vec<(usize, usize)>;
        let spans = match token_mapping.get(&evidence.doc_id) {
            Some(spans) => spans.as_slice(),
            None => {
                identity = (0..evidence.token_ids.len()).map(|i| (i, i + 1)).collect();
                identity.as_slice()
            }
        };

        for &(start, end) in spans {
            let annotated = evidence.targets[start.min(evidence.targets.len())
                ..end.min(evidence.targets.len())]
                .iter()
                .any(|&t| t > 0.0);
            let predicted = doc_predictions[start.min(doc_predictions.len())
                ..end.min(doc_predictions.len())]
                .iter()
                .any(|&p| p > 0);
            match (annotated, predicted) {
                (true, true) => true_positives += 1,
                (false, true) => false_positives += 1,
                (true, false) => false_negatives += 1,
                (false, false) => {}
            }
        }
    }

    let report = prf(
        true_positives,
        false_positives,
        false_negatives,
        true_positives + false_negatives,
    );
    RationaleScores {
        precision: report.precision,
        recall: report.recall,
        f1: report.f1,
    }
}

pub(crate) fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (index, &value) in values.iter().enumerate() {
        if value > values[best] {
            best = index;
        }
    }
    best
}

fn prf(
    true_positives: usize,
    false_positives: usize,
    false_negatives: usize,
    support: usize,
) -> ClassReport {
    let precision = ratio(true_positives, true_positives + false_positives);
    let recall = ratio(true_positives, true_positives + false_negatives);
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };
    ClassReport {
        precision,
        recall,
        f1,
        support,
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::SentenceEvidence;
    use std::collections::HashMap;

    #[test]
    fn accuracy_counts_matches() {
        assert_eq!(accuracy(&[0, 1, 1, 0], &[0, 1, 0, 0]), 0.75);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn per_class_report_is_one_vs_rest() {
        let names = vec!["neg".to_string(), "pos".to_string()];
        let truth = [0, 0, 1, 1, 1];
        let predicted = [0, 1, 1, 1, 0];
        let report = per_class_report(&names, &truth, &predicted);

        let pos = &report["pos"];
        assert_eq!(pos.support, 3);
        assert!((pos.precision - 2.0 / 3.0).abs() < 1e-9);
        assert!((pos.recall - 2.0 / 3.0).abs() < 1e-9);

        let neg = &report["neg"];
        assert_eq!(neg.support, 2);
        assert!((neg.precision - 0.5).abs() < 1e-9);
        assert!((neg.recall - 0.5).abs() < 1e-9);
    }

    #[test]
    fn absent_class_scores_zero() {
        let names = vec!["neg".to_string(), "pos".to_string()];
        let report = per_class_report(&names, &[0, 0], &[0, 0]);
        assert_eq!(report["pos"].f1, 0.0);
        assert_eq!(report["neg"].f1, 1.0);
    }

    fn alignment_instance(targets: Vec<f32>, query: Option<Vec<u32>>) -> EpochInstance {
        let tokens: Vec<u32> = (1..=targets.len() as u32).collect();
        EpochInstance {
            label: "pos".to_string(),
            evidence: SentenceEvidence {
                annotation_id: "a0".to_string(),
                doc_id: "d0".to_string(),
                index: 0,
                token_ids: tokens,
                query,
                targets: targets.clone(),
                has_evidence: targets.iter().any(|&t| t > 0.0),
            },
        }
    }

    #[test]
    fn alignment_scores_project_subtokens_to_original_tokens() {
        // Two original tokens, each covering two sub-tokens.
        let mut mapping = HashMap::new();
        mapping.insert("d0".to_string(), vec![(0, 2), (2, 4)]);

        let data = vec![alignment_instance(vec![1.0, 1.0, 0.0, 0.0], None)];
        // Reserved head of 2, then one sub-token of the first original token
        // predicted, plus a false positive on the second original token.
        let hard = vec![vec![0, 0, 1, 0, 0, 1]];
        let scores = rationale_alignment_scores(&data, &hard, &mapping);
        assert!((scores.precision - 0.5).abs() < 1e-9);
        assert!((scores.recall - 1.0).abs() < 1e-9);
    }

    #[test]
    fn missing_alignment_falls_back_to_identity() {
        let mapping = HashMap::new();
        let data = vec![alignment_instance(vec![1.0, 0.0], None)];
        let hard = vec![vec![0, 0, 1, 0]];
        let scores = rationale_alignment_scores(&data, &hard, &mapping);
        assert_eq!(scores.precision, 1.0);
        assert_eq!(scores.recall, 1.0);
        assert_eq!(scores.f1, 1.0);
    }
}
