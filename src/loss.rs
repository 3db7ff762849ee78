use candle_core::{Tensor, D};

use crate::batch::TokenBatch;
use crate::model::ModelOutput;
use crate::TrainingError;

const EPS: f64 = 1e-10;

/// Loss tensor plus detached scalar components for reporting.
#[derive(Debug)]
pub struct LossBreakdown {
    /// `classification + par_lambda * rationale`, kept as a graph-connected
    /// scalar tensor for the backward pass.
    pub total: Tensor,
    pub classification: f64,
    pub rationale: f64,
    pub combined: f64,
}

/// Combines the document-classification loss with the rebalanced
/// token-rationale loss.
#[derive(Debug, Clone, Copy)]
pub struct MtlLoss {
    par_lambda: f64,
}

impl MtlLoss {
    pub fn new(par_lambda: f64) -> Self {
        Self { par_lambda }
    }

    pub fn compute(
        &self,
        output: &ModelOutput,
        batch: &TokenBatch,
    ) -> Result<LossBreakdown, TrainingError> {
        let classification = classification_loss(&output.class_probs, &batch.labels)?;

        let per_token = rebalanced_token_loss(&output.token_probs, &batch.targets)?;
        let per_instance = per_token.mean(D::Minus1).map_err(to_runtime_error)?;
        let rationale = per_instance
            .mul(&batch.has_evidence)
            .map_err(to_runtime_error)?
            .sum_all()
            .map_err(to_runtime_error)?;

        let weighted = rationale
            .affine(self.par_lambda, 0.0)
            .map_err(to_runtime_error)?;
        let total = classification.add(&weighted).map_err(to_runtime_error)?;

        let classification_value = scalar(&classification)?;
        let rationale_value = scalar(&rationale)?;
        let combined = scalar(&total)?;

        Ok(LossBreakdown {
            total,
            classification: classification_value,
            rationale: rationale_value,
            combined,
        })
    }
}

/// Binary cross-entropy between predicted class probabilities and the one-hot
/// label matrix, summed over classes and over the batch.
fn classification_loss(probs: &Tensor, labels: &Tensor) -> Result<Tensor, TrainingError> {
    let log_p = probs
        .affine(1.0, EPS)
        .map_err(to_runtime_error)?
        .log()
        .map_err(to_runtime_error)?;
    let log_not_p = probs
        .affine(-1.0, 1.0 + EPS)
        .map_err(to_runtime_error)?
        .log()
        .map_err(to_runtime_error)?;
    let inverted_labels = labels.affine(-1.0, 1.0).map_err(to_runtime_error)?;

    let positive_term = labels.mul(&log_p).map_err(to_runtime_error)?;
    let negative_term = inverted_labels.mul(&log_not_p).map_err(to_runtime_error)?;
    positive_term
        .add(&negative_term)
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?
        .neg()
        .map_err(to_runtime_error)
}

/// Per-position cross-entropy with class rebalancing: each position is
/// weighted by the inverse of its class's empirical frequency within the
/// instance, so the minority rationale class cannot be drowned out even at
/// 1:20 imbalance or worse. No reduction; the engine reduces.
fn rebalanced_token_loss(probs: &Tensor, targets: &Tensor) -> Result<Tensor, TrainingError> {
    let inverted_targets = targets.affine(-1.0, 1.0).map_err(to_runtime_error)?;

    let prior_positive = targets
        .mean_keepdim(D::Minus1)
        .map_err(to_runtime_error)?
        .affine(1.0, EPS)
        .map_err(to_runtime_error)?;
    let prior_negative = inverted_targets
        .mean_keepdim(D::Minus1)
        .map_err(to_runtime_error)?
        .affine(1.0, EPS)
        .map_err(to_runtime_error)?;

    let positive_weight = targets
        .broadcast_div(&prior_positive)
        .map_err(to_runtime_error)?;
    let negative_weight = inverted_targets
        .broadcast_div(&prior_negative)
        .map_err(to_runtime_error)?;
    let weight = positive_weight
        .add(&negative_weight)
        .map_err(to_runtime_error)?;

    let log_p = probs
        .affine(1.0, EPS)
        .map_err(to_runtime_error)?
        .log()
        .map_err(to_runtime_error)?;
    let log_not_p = probs
        .affine(-1.0, 1.0 + EPS)
        .map_err(to_runtime_error)?
        .log()
        .map_err(to_runtime_error)?;

    let positive_term = targets.mul(&log_p).map_err(to_runtime_error)?;
    let negative_term = inverted_targets.mul(&log_not_p).map_err(to_runtime_error)?;
    let log_likelihood = positive_term.add(&negative_term).map_err(to_runtime_error)?;

    weight
        .mul(&log_likelihood)
        .map_err(to_runtime_error)?
        .neg()
        .map_err(to_runtime_error)
}

fn scalar(tensor: &Tensor) -> Result<f64, TrainingError> {
    Ok(tensor.to_vec0::<f32>().map_err(to_runtime_error)? as f64)
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
