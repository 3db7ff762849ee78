use candle_core::{Device, Tensor};

use crate::corpus::LabelVocab;
use crate::sampler::EpochInstance;
use crate::TrainingError;

/// Positions reserved at the head of every encoded sequence for the
/// sequence-start and separator markers.
pub const RESERVED_MARKERS: usize = 2;

/// Per-instance bookkeeping carried alongside the batch tensors.
#[derive(Debug, Clone)]
pub struct BatchInstance {
    pub annotation_id: String,
    pub doc_id: String,
    pub index: usize,
    pub query_len: usize,
    pub doc_len: usize,
    /// Length of the encoded sequence after truncation to `max_length`:
    /// `query_len + RESERVED_MARKERS + retained document tokens`.
    pub encoded_len: usize,
    pub label_id: usize,
}

impl BatchInstance {
    /// Leading positions that never carry rationale targets.
    pub fn reserved_len(&self) -> usize {
        self.query_len + RESERVED_MARKERS
    }
}

/// One assembled batch. Fields are named rather than positional so the
/// classification and rationale tensors cannot be silently swapped.
#[derive(Debug)]
pub struct TokenBatch {
    /// One-hot document labels, `(batch, classes)` f32.
    pub labels: Tensor,
    /// Rationale targets truncated to `max_length`, `(batch, target_width)`
    /// f32, with each instance's reserved head forced to zero.
    pub targets: Tensor,
    /// Un-truncated padded targets, kept host-side for alignment bookkeeping.
    pub full_targets: Vec<Vec<f32>>,
    /// Query sub-token ids, right-padded to the batch's longest query.
    pub queries: Vec<Vec<u32>>,
    pub query_lens: Vec<usize>,
    /// Document sub-token ids, right-padded to the batch's longest document.
    pub documents: Vec<Vec<u32>>,
    pub doc_lens: Vec<usize>,
    /// 1.0 where the instance carries rationale evidence, `(batch,)` f32.
    pub has_evidence: Tensor,
    pub has_evidence_flags: Vec<bool>,
    pub instances: Vec<BatchInstance>,
    /// Width of `targets`; the model's token predictions must match it.
    pub target_width: usize,
    pub max_length: usize,
}

impl TokenBatch {
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Builds the tensors for one contiguous slice of the epoch sequence.
///
/// Padding is to the batch's longest sequence, right-padded; only the
/// rationale target tail is truncated to `max_length` here, the document
/// tokens themselves are truncated by the model's encoding step.
pub fn assemble_batch(
    instances: &[EpochInstance],
    labels: &LabelVocab,
    max_length: usize,
    device: &Device,
) -> Result<TokenBatch, TrainingError> {
    if instances.is_empty() {
        return Err(TrainingError::runtime("cannot assemble an empty batch"));
    }

    let with_query = instances
        .iter()
        .filter(|i| i.evidence.query.is_some())
        .count();
    assert!(
        with_query == 0 || with_query == instances.len(),
        "mixed query presence within a batch indicates corrupt preprocessing"
    );

    let batch = instances.len();
    let num_classes = labels.len();

    let mut label_rows = Vec::with_capacity(batch * num_classes);
    let mut meta = Vec::with_capacity(batch);
    let mut cropped = Vec::with_capacity(batch);
    let mut full = Vec::with_capacity(batch);
    let mut queries = Vec::with_capacity(batch);
    let mut query_lens = Vec::with_capacity(batch);
    let mut documents = Vec::with_capacity(batch);
    let mut doc_lens = Vec::with_capacity(batch);
    let mut evidence_mask = Vec::with_capacity(batch);
    let mut evidence_flags = Vec::with_capacity(batch);

    for instance in instances {
        let evidence = &instance.evidence;
        let label_id = labels.id_of(&instance.label)?;
        label_rows.extend(labels.one_hot(&instance.label)?);

        let query = evidence.query.clone().unwrap_or_default();
        let query_len = query.len();
        let doc_len = evidence.token_ids.len();
        let reserved = query_len + RESERVED_MARKERS;
        let retained = max_length.saturating_sub(reserved).min(doc_len);
        let encoded_len = reserved + retained;

        let mut cropped_row = vec![0.0f32; reserved];
        cropped_row.extend_from_slice(&evidence.targets[..retained]);
        cropped.push(cropped_row);

        let mut full_row = vec![0.0f32; reserved];
        full_row.extend_from_slice(&evidence.targets);
        full.push(full_row);

        queries.push(query);
        query_lens.push(query_len);
        documents.push(evidence.token_ids.clone());
        doc_lens.push(doc_len);
        evidence_mask.push(if evidence.has_evidence { 1.0f32 } else { 0.0 });
        evidence_flags.push(evidence.has_evidence);

        meta.push(BatchInstance {
            annotation_id: evidence.annotation_id.clone(),
            doc_id: evidence.doc_id.clone(),
            index: evidence.index,
            query_len,
            doc_len,
            encoded_len,
            label_id,
        });
    }

    let target_width = pad_rows(&mut cropped, 0.0);
    pad_rows(&mut full, 0.0);
    pad_rows(&mut queries, 0u32);
    pad_rows(&mut documents, 0u32);

    let labels = Tensor::from_vec(label_rows, (batch, num_classes), device)
        .map_err(to_runtime_error)?;
    let targets_flat: Vec<f32> = cropped.into_iter().flatten().collect();
    let targets = Tensor::from_vec(targets_flat, (batch, target_width), device)
        .map_err(to_runtime_error)?;
    let has_evidence =
        Tensor::from_vec(evidence_mask, (batch,), device).map_err(to_runtime_error)?;

    Ok(TokenBatch {
        labels,
        targets,
        full_targets: full,
        queries,
        query_lens,
        documents,
        doc_lens,
        has_evidence,
        has_evidence_flags: evidence_flags,
        instances: meta,
        target_width,
        max_length,
    })
}

/// Right-pads every row to the longest row's length; returns that length.
fn pad_rows<T: Copy>(rows: &mut [Vec<T>], fill: T) -> usize {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    for row in rows.iter_mut() {
        row.resize(width, fill);
    }
    width
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::SentenceEvidence;

    fn instance(
        id: &str,
        tokens: Vec<u32>,
        targets: Vec<f32>,
        query: Option<Vec<u32>>,
    ) -> EpochInstance {
        let has_evidence = targets.iter().any(|&t| t > 0.0);
        EpochInstance {
            label: "pos".to_string(),
            evidence: SentenceEvidence {
                annotation_id: id.to_string(),
                doc_id: "d0".to_string(),
                index: 0,
                token_ids: tokens,
                query,
                targets,
                has_evidence,
            },
        }
    }

    fn vocab() -> LabelVocab {
        LabelVocab::new(&["neg", "pos"])
    }

    #[test]
    fn reserved_positions_are_always_zero() {
        let instances = vec![
            instance("a0", vec![1, 2, 3], vec![1.0, 1.0, 1.0], Some(vec![9, 9])),
            instance("a1", vec![4, 5], vec![1.0, 0.0], Some(vec![8])),
        ];
        let batch = assemble_batch(&instances, &vocab(), 32, &Device::Cpu).unwrap();
        let rows = batch.targets.to_vec2::<f32>().unwrap();
        for (row, meta) in rows.iter().zip(&batch.instances) {
            for &value in &row[..meta.reserved_len()] {
                assert_eq!(value, 0.0);
            }
        }
        // Targets survive past the reserved head.
        assert_eq!(rows[0][4], 1.0);
    }

    #[test]
    fn target_tail_is_truncated_to_max_length() {
        let instances = vec![instance(
            "a0",
            (0..10).collect(),
            vec![1.0; 10],
            Some(vec![7, 7, 7]),
        )];
        // reserved = 3 + 2 = 5, so only 3 of 10 document positions remain.
        let batch = assemble_batch(&instances, &vocab(), 8, &Device::Cpu).unwrap();
        assert_eq!(batch.target_width, 8);
        assert_eq!(batch.instances[0].encoded_len, 8);
        // The un-truncated copy keeps the full document.
        assert_eq!(batch.full_targets[0].len(), 15);
    }

    #[test]
    fn padding_is_to_batch_longest_not_max_length() {
        let instances = vec![
            instance("a0", vec![1, 2, 3, 4], vec![0.0; 4], None),
            instance("a1", vec![5], vec![1.0], None),
        ];
        let batch = assemble_batch(&instances, &vocab(), 128, &Device::Cpu).unwrap();
        assert_eq!(batch.target_width, 6);
        assert_eq!(batch.documents[0].len(), 4);
        assert_eq!(batch.documents[1].len(), 4);
        assert_eq!(batch.doc_lens, vec![4, 1]);
    }

    #[test]
    fn labels_are_one_hot() {
        let mut a = instance("a0", vec![1], vec![0.0], None);
        a.label = "neg".to_string();
        let b = instance("a1", vec![2], vec![0.0], None);
        let batch = assemble_batch(&[a, b], &vocab(), 16, &Device::Cpu).unwrap();
        let rows = batch.labels.to_vec2::<f32>().unwrap();
        assert_eq!(rows, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn has_evidence_mask_follows_flags() {
        let instances = vec![
            instance("a0", vec![1, 2], vec![1.0, 0.0], None),
            instance("a1", vec![3, 4], vec![0.0, 0.0], None),
        ];
        let batch = assemble_batch(&instances, &vocab(), 16, &Device::Cpu).unwrap();
        assert_eq!(batch.has_evidence.to_vec1::<f32>().unwrap(), vec![1.0, 0.0]);
        assert_eq!(batch.has_evidence_flags, vec![true, false]);
    }

    #[test]
    #[should_panic(expected = "mixed query presence")]
    fn mixed_query_presence_is_fatal() {
        let instances = vec![
            instance("a0", vec![1], vec![0.0], Some(vec![3])),
            instance("a1", vec![2], vec![0.0], None),
        ];
        let _ = assemble_batch(&instances, &vocab(), 16, &Device::Cpu);
    }
}
