use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{embedding, linear, ops, Embedding, Linear, Module, VarBuilder, VarMap};

use crate::batch::TokenBatch;
use crate::TrainingError;

/// Probabilities produced by one forward pass.
#[derive(Debug)]
pub struct ModelOutput {
    /// Per-class probabilities, `(batch, classes)` f32.
    pub class_probs: Tensor,
    /// Per-position rationale probabilities, `(batch, target_width)` f32,
    /// zeroed beyond each instance's encoded length.
    pub token_probs: Tensor,
}

/// Seam between the training pipeline and the encoder. The pipeline only
/// needs a forward pass to probabilities, the trainable parameters by name,
/// and the device the parameters live on; the encoder architecture itself is
/// a collaborator's concern.
pub trait RationaleModel {
    fn forward(&self, batch: &TokenBatch) -> Result<ModelOutput, TrainingError>;
    fn named_parameters(&self) -> Vec<(String, Var)>;
    fn device(&self) -> &Device;
}

#[derive(Debug, Clone)]
pub struct MeanPoolConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    pub num_classes: usize,
    pub cls_token_id: u32,
    pub sep_token_id: u32,
    pub pad_token_id: u32,
    pub use_half_precision: bool,
}

/// Reference model: token embeddings, a linear-sigmoid rationale head over
/// each position, and a mean-pooled linear-sigmoid classification head. Small
/// enough to train on CPU, which keeps the whole pipeline exercisable without
/// a pretrained encoder.
pub struct MeanPoolModel {
    config: MeanPoolConfig,
    device: Device,
    dtype: DType,
    varmap: VarMap,
    embedding: Embedding,
    rationale_head: Linear,
    classification_head: Linear,
}

impl MeanPoolModel {
    pub fn new(config: MeanPoolConfig, device: &Device) -> Result<Self, TrainingError> {
        if config.vocab_size == 0 || config.hidden_dim == 0 || config.num_classes == 0 {
            return Err(TrainingError::initialization(
                "model dimensions must all be greater than zero",
            ));
        }
        let dtype = if config.use_half_precision {
            DType::F16
        } else {
            DType::F32
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, device);
        let embedding = embedding(config.vocab_size, config.hidden_dim, vb.pp("token_embedding"))
            .map_err(to_runtime_error)?;
        let rationale_head =
            linear(config.hidden_dim, 1, vb.pp("rationale_head")).map_err(to_runtime_error)?;
        let classification_head = linear(
            config.hidden_dim,
            config.num_classes,
            vb.pp("classification_head"),
        )
        .map_err(to_runtime_error)?;
        Ok(Self {
            config,
            device: device.clone(),
            dtype,
            varmap,
            embedding,
            rationale_head,
            classification_head,
        })
    }

    pub fn config(&self) -> &MeanPoolConfig {
        &self.config
    }

    /// Encodes `[start] query [sep] document` per instance, truncated to the
    /// batch's `max_length` and padded to its target width.
    fn encode_input(&self, batch: &TokenBatch) -> Result<(Tensor, Tensor, Vec<f32>), TrainingError> {
        let width = batch.target_width;
        let mut ids = Vec::with_capacity(batch.len() * width);
        let mut mask = Vec::with_capacity(batch.len() * width);
        let mut lengths = Vec::with_capacity(batch.len());

        for (row, meta) in batch.instances.iter().enumerate() {
            let mut sequence = Vec::with_capacity(meta.encoded_len);
            sequence.push(self.config.cls_token_id);
            sequence.extend_from_slice(&batch.queries[row][..meta.query_len]);
            sequence.push(self.config.sep_token_id);
            sequence.extend_from_slice(&batch.documents[row][..meta.doc_len]);
            sequence.truncate(meta.encoded_len);
            sequence.resize(width, self.config.pad_token_id);
            ids.extend_from_slice(&sequence);

            for position in 0..width {
                mask.push(if position < meta.encoded_len { 1.0f32 } else { 0.0 });
            }
            lengths.push(meta.encoded_len as f32);
        }

        let ids = Tensor::from_vec(ids, (batch.len(), width), &self.device)
            .map_err(to_runtime_error)?;
        let mask = Tensor::from_vec(mask, (batch.len(), width), &self.device)
            .map_err(to_runtime_error)?
            .to_dtype(self.dtype)
            .map_err(to_runtime_error)?;
        Ok((ids, mask, lengths))
    }
}

impl RationaleModel for MeanPoolModel {
    fn forward(&self, batch: &TokenBatch) -> Result<ModelOutput, TrainingError> {
        let (ids, mask, lengths) = self.encode_input(batch)?;

        let hidden = self.embedding.forward(&ids).map_err(to_runtime_error)?;

        let token_logits = self
            .rationale_head
            .forward(&hidden)
            .map_err(to_runtime_error)?
            .squeeze(D::Minus1)
            .map_err(to_runtime_error)?;
        let token_probs = ops::sigmoid(&token_logits)
            .map_err(to_runtime_error)?
            .mul(&mask)
            .map_err(to_runtime_error)?;

        let mask_expanded = mask.unsqueeze(D::Minus1).map_err(to_runtime_error)?;
        let summed = hidden
            .broadcast_mul(&mask_expanded)
            .map_err(to_runtime_error)?
            .sum(1)
            .map_err(to_runtime_error)?;
        let lengths = Tensor::from_vec(lengths, (batch.len(), 1), &self.device)
            .map_err(to_runtime_error)?
            .to_dtype(self.dtype)
            .map_err(to_runtime_error)?;
        let pooled = summed.broadcast_div(&lengths).map_err(to_runtime_error)?;
        let class_logits = self
            .classification_head
            .forward(&pooled)
            .map_err(to_runtime_error)?;
        let class_probs = ops::sigmoid(&class_logits).map_err(to_runtime_error)?;

        Ok(ModelOutput {
            class_probs: class_probs
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?,
            token_probs: token_probs
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?,
        })
    }

    fn named_parameters(&self) -> Vec<(String, Var)> {
        let data = self.varmap.data().lock().unwrap();
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));
        params
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::assemble_batch;
    use crate::corpus::{LabelVocab, SentenceEvidence};
    use crate::sampler::EpochInstance;

    fn test_config() -> MeanPoolConfig {
        MeanPoolConfig {
            vocab_size: 32,
            hidden_dim: 8,
            num_classes: 2,
            cls_token_id: 1,
            sep_token_id: 2,
            pad_token_id: 0,
            use_half_precision: false,
        }
    }

    fn test_batch(max_length: usize) -> TokenBatch {
        let instances = vec![
            EpochInstance {
                label: "pos".to_string(),
                evidence: SentenceEvidence {
                    annotation_id: "a0".to_string(),
                    doc_id: "d0".to_string(),
                    index: 0,
                    token_ids: vec![5, 6, 7, 8],
                    query: Some(vec![9]),
                    targets: vec![1.0, 1.0, 0.0, 0.0],
                    has_evidence: true,
                },
            },
            EpochInstance {
                label: "neg".to_string(),
                evidence: SentenceEvidence {
                    annotation_id: "a1".to_string(),
                    doc_id: "d1".to_string(),
                    index: 0,
                    token_ids: vec![10, 11],
                    query: Some(vec![12]),
                    targets: vec![0.0, 0.0],
                    has_evidence: false,
                },
            },
        ];
        let vocab = LabelVocab::new(&["neg", "pos"]);
        assemble_batch(&instances, &vocab, max_length, &Device::Cpu).unwrap()
    }

    #[test]
    fn forward_shapes_match_the_batch() {
        let model = MeanPoolModel::new(test_config(), &Device::Cpu).unwrap();
        let batch = test_batch(32);
        let output = model.forward(&batch).unwrap();
        assert_eq!(output.class_probs.dims(), &[2, 2]);
        assert_eq!(output.token_probs.dims(), &[2, batch.target_width]);
    }

    #[test]
    fn probabilities_are_bounded_and_padding_is_zeroed() {
        let model = MeanPoolModel::new(test_config(), &Device::Cpu).unwrap();
        let batch = test_batch(32);
        let output = model.forward(&batch).unwrap();
        let token_rows = output.token_probs.to_vec2::<f32>().unwrap();
        for (row, meta) in token_rows.iter().zip(&batch.instances) {
            for (position, &p) in row.iter().enumerate() {
                assert!((0.0..=1.0).contains(&p));
                if position >= meta.encoded_len {
                    assert_eq!(p, 0.0);
                }
            }
        }
        for row in output.class_probs.to_vec2::<f32>().unwrap() {
            for p in row {
                assert!((0.0..=1.0).contains(&p));
            }
        }
    }

    #[test]
    fn truncation_is_consistent_with_the_target_width() {
        let model = MeanPoolModel::new(test_config(), &Device::Cpu).unwrap();
        let batch = test_batch(5);
        let output = model.forward(&batch).unwrap();
        assert_eq!(output.token_probs.dims(), &[2, batch.target_width]);
        assert_eq!(batch.target_width, 5);
    }

    #[test]
    fn parameters_are_named_and_trainable() {
        let model = MeanPoolModel::new(test_config(), &Device::Cpu).unwrap();
        let params = model.named_parameters();
        assert!(params.iter().any(|(n, _)| n.contains("token_embedding")));
        assert!(params.iter().any(|(n, _)| n.contains("rationale_head")));
        assert!(params.iter().any(|(n, _)| n.contains("classification_head")));
    }
}
