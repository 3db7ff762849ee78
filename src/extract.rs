use crate::batch::RESERVED_MARKERS;
use crate::config::MtlConfig;
use crate::corpus::{EvidenceCorpus, LabelVocab, SentenceEvidence};
use crate::eval::collect_predictions;
use crate::metrics::argmax;
use crate::model::RationaleModel;
use crate::sampler::{sample_epoch, SamplingPolicy};
use crate::TrainingError;

/// One instance re-annotated with the trained identifier's own rationale
/// predictions, for the downstream evidence classifier. Prediction sequences
/// correspond 1:1 to the unit's document tokens; the reserved head is
/// stripped, and positions lost to truncation are zero-filled.
#[derive(Debug, Clone)]
pub struct MachineAnnotation {
    pub instance: SentenceEvidence,
    pub label: String,
    pub soft_predictions: Vec<f32>,
    pub hard_predictions: Vec<u8>,
    pub predicted_label: usize,
    pub true_label: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractionOptions {
    /// Keep only instances whose predicted class matches the ground truth.
    /// Used for the train split feeding stage 2, so rationale predictions the
    /// identifier itself got wrong are not propagated.
    pub keep_correct_only: bool,
}

/// Re-runs the trained model over a split and pairs every sampled unit with
/// its soft and hard rationale predictions. Pure: no state is carried across
/// calls, so the same function serves all three splits.
pub fn extract_machine_annotations<M: RationaleModel>(
    model: &M,
    corpus: &EvidenceCorpus,
    policy: SamplingPolicy,
    labels: &LabelVocab,
    config: &MtlConfig,
    options: ExtractionOptions,
) -> Result<Vec<MachineAnnotation>, TrainingError> {
    let epoch_data = sample_epoch(corpus, policy, config.seed);
    let split = collect_predictions(
        model,
        &epoch_data,
        labels,
        config.batch_size,
        config.max_length,
        None,
    )?;

    let mut annotations = Vec::with_capacity(epoch_data.len());
    for (row, instance) in epoch_data.into_iter().enumerate() {
        let reserved = instance.evidence.query_len() + RESERVED_MARKERS;
        let doc_len = instance.evidence.token_ids.len();

        let mut soft: Vec<f32> = split.soft_predictions[row]
            .get(reserved..)
            .unwrap_or(&[])
            .to_vec();
        soft.resize(doc_len, 0.0);
        let mut hard: Vec<u8> = split.hard_predictions[row]
            .get(reserved..)
            .unwrap_or(&[])
            .to_vec();
        hard.resize(doc_len, 0);

        let predicted_label = argmax(&split.predicted_label_vectors[row]);
        let true_label = argmax(&split.true_label_vectors[row]);
        if options.keep_correct_only && predicted_label != true_label {
            continue;
        }

        annotations.push(MachineAnnotation {
            instance: instance.evidence,
            label: instance.label,
            soft_predictions: soft,
            hard_predictions: hard,
            predicted_label,
            true_label,
        });
    }
    Ok(annotations)
}
