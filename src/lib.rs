pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod corpus;
pub mod eval;
pub mod extract;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod sampler;
pub mod scheduler;
pub mod trainer;

pub use batch::{assemble_batch, BatchInstance, TokenBatch, RESERVED_MARKERS};
pub use checkpoint::{CheckpointManager, MetricHistory, RunLifecycle, RunState};
pub use config::{MtlConfig, TrainingError};
pub use corpus::{
    Annotation, EvidenceCorpus, EvidenceSpan, LabelVocab, SentenceEvidence, TokenAlignmentMap,
};
pub use eval::{evaluate_epoch, EvalReport, SplitEvaluation};
pub use extract::{extract_machine_annotations, ExtractionOptions, MachineAnnotation};
pub use logging::{Logger, LoggingSettings};
pub use loss::{LossBreakdown, MtlLoss};
pub use metrics::{ClassReport, RationaleScores};
pub use model::{MeanPoolConfig, MeanPoolModel, ModelOutput, RationaleModel};
pub use sampler::{sample_epoch, EpochInstance, SamplingPolicy};
pub use scheduler::{LRScheduler, LinearDecayWithWarmup};
pub use trainer::{train_token_identifier, TokenIdentifierOutput, Trainer};
