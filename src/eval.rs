use std::collections::BTreeMap;

use crate::batch::assemble_batch;
use crate::corpus::{LabelVocab, TokenAlignmentMap};
use crate::loss::MtlLoss;
use crate::metrics::{
    accuracy, argmax, per_class_report, rationale_alignment_scores, ClassReport, RationaleScores,
};
use crate::model::RationaleModel;
use crate::sampler::EpochInstance;
use crate::TrainingError;

const HARD_THRESHOLD: f32 = 0.5;

/// Raw per-instance predictions and accumulated losses for one split.
#[derive(Debug, Default)]
pub struct SplitEvaluation {
    /// Instance-normalized losses; zero when losses were not computed.
    pub total_loss: f64,
    pub classification_loss: f64,
    pub rationale_loss: f64,
    /// Per-instance token probabilities, trimmed to the encoded length
    /// (reserved head included).
    pub soft_predictions: Vec<Vec<f32>>,
    /// Thresholded counterpart of `soft_predictions`.
    pub hard_predictions: Vec<Vec<u8>>,
    /// Truncated targets, trimmed the same way.
    pub token_targets: Vec<Vec<u8>>,
    pub predicted_label_vectors: Vec<Vec<f32>>,
    pub true_label_vectors: Vec<Vec<f32>>,
}

/// Runs the model over an epoch-sampled split without gradient updates,
/// collecting per-instance predictions; losses are accumulated when a loss
/// engine is supplied and skipped otherwise (post-training extraction).
pub(crate) fn collect_predictions<M: RationaleModel>(
    model: &M,
    epoch_data: &[EpochInstance],
    labels: &LabelVocab,
    batch_size: usize,
    max_length: usize,
    loss: Option<&MtlLoss>,
) -> Result<SplitEvaluation, TrainingError> {
    let mut evaluation = SplitEvaluation::default();
    if epoch_data.is_empty() {
        return Ok(evaluation);
    }

    for chunk in epoch_data.chunks(batch_size) {
        let batch = assemble_batch(chunk, labels, max_length, model.device())?;
        let output = model.forward(&batch)?;

        if let Some(loss) = loss {
            let breakdown = loss.compute(&output, &batch)?;
            evaluation.total_loss += breakdown.combined;
            evaluation.classification_loss += breakdown.classification;
            evaluation.rationale_loss += breakdown.rationale;
        }

        let soft_rows = output
            .token_probs
            .to_vec2::<f32>()
            .map_err(to_runtime_error)?;
        let target_rows = batch.targets.to_vec2::<f32>().map_err(to_runtime_error)?;
        let class_rows = output
            .class_probs
            .to_vec2::<f32>()
            .map_err(to_runtime_error)?;
        let label_rows = batch.labels.to_vec2::<f32>().map_err(to_runtime_error)?;

        for (row, meta) in batch.instances.iter().enumerate() {
            let len = meta.encoded_len;
            let soft = soft_rows[row][..len].to_vec();
            let hard = soft
                .iter()
                .map(|&p| u8::from(p >= HARD_THRESHOLD))
                .collect();
            let targets = target_rows[row][..len]
                .iter()
                .map(|&t| u8::from(t >= HARD_THRESHOLD))
                .collect();
            evaluation.soft_predictions.push(soft);
            evaluation.hard_predictions.push(hard);
            evaluation.token_targets.push(targets);
            evaluation.predicted_label_vectors.push(class_rows[row].clone());
            evaluation.true_label_vectors.push(label_rows[row].clone());
        }
    }

    let count = epoch_data.len() as f64;
    evaluation.total_loss /= count;
    evaluation.classification_loss /= count;
    evaluation.rationale_loss /= count;

    Ok(evaluation)
}

/// Split evaluation together with the metrics derived from it.
#[derive(Debug)]
pub struct EvalReport {
    pub split: SplitEvaluation,
    /// Token-rationale accuracy over the flattened split.
    pub token_accuracy: f64,
    /// Per-class report for the non-rationale ("0") and rationale ("1")
    /// token classes.
    pub token_report: BTreeMap<String, ClassReport>,
    pub label_accuracy: f64,
    pub label_report: BTreeMap<String, ClassReport>,
    pub rationale_scores: RationaleScores,
}

/// Evaluates one split: losses, token-level and document-level metrics, and
/// the rationale-alignment scores at original-token granularity.
pub fn evaluate_epoch<M: RationaleModel>(
    model: &M,
    epoch_data: &[EpochInstance],
    labels: &LabelVocab,
    batch_size: usize,
    max_length: usize,
    loss: &MtlLoss,
    token_mapping: &TokenAlignmentMap,
) -> Result<EvalReport, TrainingError> {
    let split = collect_predictions(model, epoch_data, labels, batch_size, max_length, Some(loss))?;

    let flat_truth: Vec<usize> = split
        .token_targets
        .iter()
        .flatten()
        .map(|&t| t as usize)
        .collect();
    let flat_predicted: Vec<usize> = split
        .hard_predictions
        .iter()
        .flatten()
        .map(|&p| p as usize)
        .collect();
    let token_classes = vec!["0".to_string(), "1".to_string()];
    let token_accuracy = accuracy(&flat_truth, &flat_predicted);
    let token_report = per_class_report(&token_classes, &flat_truth, &flat_predicted);

    let label_truth: Vec<usize> = split.true_label_vectors.iter().map(|v| argmax(v)).collect();
    let label_predicted: Vec<usize> = split
        .predicted_label_vectors
        .iter()
        .map(|v| argmax(v))
        .collect();
    let label_accuracy = accuracy(&label_truth, &label_predicted);
    let label_report = per_class_report(labels.names(), &label_truth, &label_predicted);

    let rationale_scores =
        rationale_alignment_scores(epoch_data, &split.hard_predictions, token_mapping);

    Ok(EvalReport {
        split,
        token_accuracy,
        token_report,
        label_accuracy,
        label_report,
        rationale_scores,
    })
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{Annotation, EvidenceCorpus, EvidenceSpan};
    use crate::model::{MeanPoolConfig, MeanPoolModel};
    use crate::sampler::{sample_epoch, SamplingPolicy};
    use candle_core::Device;
    use std::collections::HashMap;

    fn tiny_epoch() -> (Vec<EpochInstance>, LabelVocab) {
        let mut documents = HashMap::new();
        documents.insert("d0".to_string(), vec![vec![3, 4, 5, 6]]);
        documents.insert("d1".to_string(), vec![vec![7, 8]]);
        let annotations = vec![
            Annotation {
                id: "a0".to_string(),
                doc_ids: vec!["d0".to_string()],
                query: None,
                label: "pos".to_string(),
                evidence: vec![EvidenceSpan {
                    doc_id: "d0".to_string(),
                    start: 0,
                    end: 2,
                }],
            },
            Annotation {
                id: "a1".to_string(),
                doc_ids: vec!["d1".to_string()],
                query: None,
                label: "neg".to_string(),
                evidence: vec![],
            },
        ];
        let corpus = EvidenceCorpus::build(&annotations, &documents).unwrap();
        let epoch = sample_epoch(&corpus, SamplingPolicy::WholeDocument, 11);
        (epoch, LabelVocab::new(&["neg", "pos"]))
    }

    fn tiny_model(num_classes: usize) -> MeanPoolModel {
        MeanPoolModel::new(
            MeanPoolConfig {
                vocab_size: 16,
                hidden_dim: 4,
                num_classes,
                cls_token_id: 1,
                sep_token_id: 2,
                pad_token_id: 0,
                use_half_precision: false,
            },
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn evaluation_collects_one_row_per_instance() {
        let (epoch, labels) = tiny_epoch();
        let model = tiny_model(labels.len());
        let report = evaluate_epoch(
            &model,
            &epoch,
            &labels,
            2,
            32,
            &MtlLoss::new(1.0),
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(report.split.soft_predictions.len(), 2);
        assert_eq!(report.split.hard_predictions.len(), 2);
        assert_eq!(report.split.predicted_label_vectors.len(), 2);
        for (soft, hard) in report
            .split
            .soft_predictions
            .iter()
            .zip(&report.split.hard_predictions)
        {
            assert_eq!(soft.len(), hard.len());
        }
        assert!(report.split.total_loss.is_finite());
        assert!(report.split.total_loss >= 0.0);
        assert!(report.token_report.contains_key("0"));
        assert!(report.token_report.contains_key("1"));
        assert!(report.label_report.contains_key("pos"));
    }

    #[test]
    fn extraction_path_skips_losses() {
        let (epoch, labels) = tiny_epoch();
        let model = tiny_model(labels.len());
        let split = collect_predictions(&model, &epoch, &labels, 2, 32, None).unwrap();
        assert_eq!(split.total_loss, 0.0);
        assert_eq!(split.classification_loss, 0.0);
        assert_eq!(split.soft_predictions.len(), 2);
    }

    #[test]
    fn rows_are_trimmed_to_encoded_length() {
        let (epoch, labels) = tiny_epoch();
        let model = tiny_model(labels.len());
        let split = collect_predictions(&model, &epoch, &labels, 2, 32, None).unwrap();
        for (row, instance) in split.soft_predictions.iter().zip(&epoch) {
            assert_eq!(
                row.len(),
                instance.evidence.query_len() + 2 + instance.evidence.token_ids.len()
            );
        }
    }
}
