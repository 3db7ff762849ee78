use std::collections::HashMap;
use std::path::Path;

use candle_core::backprop::GradStore;
use candle_core::{DType, Tensor, Var};
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};

use crate::batch::assemble_batch;
use crate::checkpoint::{
    restore_weights, snapshot_weights, CheckpointManager, MetricHistory, RunLifecycle, RunState,
};
use crate::config::MtlConfig;
use crate::corpus::{Annotation, EvidenceCorpus, LabelVocab, TokenAlignmentMap};
use crate::eval::evaluate_epoch;
use crate::extract::{extract_machine_annotations, ExtractionOptions, MachineAnnotation};
use crate::logging::{Logger, LoggingSettings};
use crate::loss::MtlLoss;
use crate::model::RationaleModel;
use crate::sampler::{sample_epoch, SamplingPolicy};
use crate::scheduler::{LRScheduler, LinearDecayWithWarmup};
use crate::TrainingError;

/// Decorrelates the per-epoch validation sampling from the training sampling.
const VALIDATION_SEED_OFFSET: u64 = 0x9e37_79b9_7f4a_7c15;

/// Orchestrates identifier training: per-epoch sampling, batched optimizer
/// steps with optional gradient clipping, validation, best-model tracking
/// with patience-based early stopping, and checkpointing for resumption.
pub struct Trainer<M: RationaleModel> {
    model: M,
    config: MtlConfig,
    policy: SamplingPolicy,
    labels: LabelVocab,
    checkpoints: CheckpointManager,
    logger: Logger,
}

impl<M: RationaleModel> Trainer<M> {
    pub fn new(
        model: M,
        config: MtlConfig,
        labels: LabelVocab,
        output_dir: &Path,
    ) -> Result<Self, TrainingError> {
        config.validate()?;
        if labels.is_empty() {
            return Err(TrainingError::initialization(
                "label vocabulary must not be empty",
            ));
        }
        let policy = SamplingPolicy::resolve(&config.sampling_method)?;
        let checkpoints = CheckpointManager::new(output_dir);
        let logger = Logger::new(LoggingSettings {
            enable_stdout: config.log_stdout,
            metrics_path: Some(checkpoints.directory().join("metrics.jsonl")),
        })?;
        Ok(Self {
            model,
            config,
            policy,
            labels,
            checkpoints,
            logger,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn sampling_policy(&self) -> SamplingPolicy {
        self.policy
    }

    /// Runs the epoch loop. A checkpoint left by an earlier run is restored
    /// first: its weights become the live (and best) weights and training
    /// continues at the epoch after the recorded one. On return the model
    /// holds the best-validation-loss weights, not necessarily the last
    /// epoch's.
    pub fn train(
        &mut self,
        train_corpus: &EvidenceCorpus,
        val_corpus: &EvidenceCorpus,
        token_mapping: &TokenAlignmentMap,
    ) -> Result<RunState, TrainingError> {
        if train_corpus.is_empty() || val_corpus.is_empty() {
            return Err(TrainingError::initialization(
                "training and validation corpora must not be empty",
            ));
        }
        let params = self.model.named_parameters();
        if params.is_empty() {
            return Err(TrainingError::initialization(
                "model produced no trainable parameters",
            ));
        }
        let device = self.model.device().clone();

        let mut history = MetricHistory::default();
        let mut best_epoch: Option<usize> = None;
        let mut best_val_loss = f64::INFINITY;
        let mut best_weights: Option<Vec<(String, Tensor)>> = None;
        let mut start_epoch = 0usize;
        let mut resumed_epoch: Option<usize> = None;

        if let Some(loaded) = self.checkpoints.load(&device)? {
            restore_weights(&params, &loaded.weights)?;
            history = loaded.state.history;
            best_epoch = loaded.state.best_epoch;
            best_val_loss = loaded.state.best_val_loss.unwrap_or(f64::INFINITY);
            resumed_epoch = loaded.state.lifecycle.epoch();
            start_epoch = resumed_epoch.map_or(0, |epoch| epoch + 1);
            // The weights on disk are the best snapshot by construction.
            best_weights = Some(snapshot_weights(&params)?);
        }

        let vars: Vec<Var> = params.iter().map(|(_, var)| var.clone()).collect();
        let mut optimizer = AdamW::new(
            vars,
            ParamsAdamW {
                lr: self.config.lr,
                weight_decay: 0.0,
                ..ParamsAdamW::default()
            },
        )
        .map_err(to_runtime_error)?;

        let steps_per_epoch = (train_corpus.unit_count() / self.config.batch_size).max(1);
        let total_steps = self.config.epochs * steps_per_epoch;
        let mut scheduler = LinearDecayWithWarmup::new(self.config.lr, total_steps, 0)?;
        let loss_engine = MtlLoss::new(self.config.par_lambda);

        let mut last_epoch = resumed_epoch;
        for epoch in start_epoch..self.config.epochs {
            last_epoch = Some(epoch);
            let epoch_train = sample_epoch(
                train_corpus,
                self.policy,
                self.config.seed.wrapping_add(epoch as u64),
            );
            // Validation is re-sampled each epoch because it reuses the same
            // corpus/sampler machinery as training; with one unit per
            // (annotation, document) pair only the ordering varies.
            let epoch_val = sample_epoch(
                val_corpus,
                self.policy,
                self.config
                    .seed
                    .wrapping_add(epoch as u64)
                    .wrapping_add(VALIDATION_SEED_OFFSET),
            );

            let mut sampled_epoch_train_loss = 0.0;
            for chunk in epoch_train.chunks(self.config.batch_size) {
                let batch = assemble_batch(chunk, &self.labels, self.config.max_length, &device)?;
                let output = self.model.forward(&batch)?;
                let breakdown = loss_engine.compute(&output, &batch)?;

                let mut grads = breakdown.total.backward().map_err(to_runtime_error)?;
                if let Some(max_norm) = self.config.max_grad_norm {
                    clip_gradient_norm(&params, &mut grads, max_norm)?;
                }
                optimizer.step(&grads).map_err(to_runtime_error)?;
                optimizer.set_learning_rate(scheduler.step());

                sampled_epoch_train_loss += breakdown.combined;
            }
            sampled_epoch_train_loss /= epoch_train.len() as f64;

            let report = evaluate_epoch(
                &self.model,
                &epoch_val,
                &self.labels,
                self.config.batch_size,
                self.config.max_length,
                &loss_engine,
                token_mapping,
            )?;

            history.push_scalar("sampled_epoch_train_losses", sampled_epoch_train_loss);
            history.push_scalar("epoch_val_total_losses", report.split.total_loss);
            history.push_scalar("epoch_val_cls_losses", report.split.classification_loss);
            history.push_scalar("epoch_val_exp_losses", report.split.rationale_loss);
            history.push_scalar("epoch_val_exp_acc", report.token_accuracy);
            history.push_value("epoch_val_exp_f", to_json(&report.token_report)?);
            history.push_scalar("epoch_val_cls_acc", report.label_accuracy);
            history.push_value("epoch_val_cls_f", to_json(&report.label_report)?);
            history.push_value(
                "full_epoch_val_rationale_scores",
                to_json(&report.rationale_scores)?,
            );

            self.logger
                .log_epoch(epoch, sampled_epoch_train_loss, &report);

            if strictly_improves(report.split.total_loss, best_val_loss) {
                best_val_loss = report.split.total_loss;
                best_epoch = Some(epoch);
                let snapshot = snapshot_weights(&params)?;
                let state = RunState {
                    lifecycle: RunLifecycle::InProgress(epoch),
                    best_epoch,
                    best_val_loss: Some(best_val_loss),
                    history: history.clone(),
                };
                self.checkpoints.save(&snapshot, &state)?;
                best_weights = Some(snapshot);
            }

            if let Some(best) = best_epoch {
                if epoch.saturating_sub(best) > self.config.patience {
                    self.logger.log_early_stop(epoch, best);
                    break;
                }
            }
        }

        self.logger.flush();

        let final_state = RunState {
            lifecycle: match last_epoch {
                Some(epoch) => RunLifecycle::Completed(epoch),
                None => RunLifecycle::NotStarted,
            },
            best_epoch,
            best_val_loss: best_val_loss.is_finite().then_some(best_val_loss),
            history,
        };

        if let Some(weights) = &best_weights {
            if last_epoch.is_some() {
                // Terminal persist marks completion for resumability.
                self.checkpoints.save(weights, &final_state)?;
            }
            let by_name: HashMap<String, Tensor> = weights.iter().cloned().collect();
            restore_weights(&params, &by_name)?;
        }

        Ok(final_state)
    }
}

/// The best snapshot is only replaced on strict improvement; ties keep it.
fn strictly_improves(candidate: f64, best: f64) -> bool {
    candidate < best
}

/// Scales all gradients down when their global L2 norm exceeds `max_norm`.
/// Returns the pre-clip norm.
fn clip_gradient_norm(
    params: &[(String, Var)],
    grads: &mut GradStore,
    max_norm: f64,
) -> Result<f64, TrainingError> {
    let mut sum_squares = 0.0f64;
    for (_, var) in params {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sq = grad
                .to_dtype(DType::F32)
                .map_err(to_runtime_error)?
                .sqr()
                .map_err(to_runtime_error)?
                .sum_all()
                .map_err(to_runtime_error)?
                .to_vec0::<f32>()
                .map_err(to_runtime_error)? as f64;
            sum_squares += sq;
        }
    }

    let total_norm = sum_squares.sqrt();
    if total_norm > max_norm {
        let scale = max_norm / (total_norm + 1e-6);
        for (_, var) in params {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                let clipped = grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                grads.insert(var.as_tensor(), clipped);
            }
        }
    }

    Ok(total_norm)
}

/// Stage-1 training plus machine-annotation of all three splits, for handoff
/// to the downstream evidence classifier. The train split keeps only
/// instances the identifier classified correctly; validation and test pass
/// through unfiltered.
pub struct TokenIdentifierOutput<M> {
    pub model: M,
    pub state: RunState,
    pub train_annotated: Vec<MachineAnnotation>,
    pub val_annotated: Vec<MachineAnnotation>,
    pub test_annotated: Vec<MachineAnnotation>,
}

#[allow(clippy::too_many_arguments)]
pub fn train_token_identifier<M: RationaleModel>(
    model: M,
    output_dir: &Path,
    config: MtlConfig,
    labels: LabelVocab,
    train: &[Annotation],
    val: &[Annotation],
    test: &[Annotation],
    documents: &HashMap<String, Vec<Vec<u32>>>,
    token_mapping: &TokenAlignmentMap,
) -> Result<TokenIdentifierOutput<M>, TrainingError> {
    let train_corpus = EvidenceCorpus::build(train, documents)?;
    let val_corpus = EvidenceCorpus::build(val, documents)?;
    let test_corpus = EvidenceCorpus::build(test, documents)?;

    let mut trainer = Trainer::new(model, config.clone(), labels.clone(), output_dir)?;
    let state = trainer.train(&train_corpus, &val_corpus, token_mapping)?;
    let policy = trainer.sampling_policy();
    let model = trainer.into_model();

    let train_annotated = extract_machine_annotations(
        &model,
        &train_corpus,
        policy,
        &labels,
        &config,
        ExtractionOptions {
            keep_correct_only: true,
        },
    )?;
    let val_annotated = extract_machine_annotations(
        &model,
        &val_corpus,
        policy,
        &labels,
        &config,
        ExtractionOptions::default(),
    )?;
    let test_annotated = extract_machine_annotations(
        &model,
        &test_corpus,
        policy,
        &labels,
        &config,
        ExtractionOptions::default(),
    )?;

    Ok(TokenIdentifierOutput {
        model,
        state,
        train_annotated,
        val_annotated,
        test_annotated,
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, TrainingError> {
    serde_json::to_value(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize metrics: {err}")))
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
