use std::{
    collections::{BTreeMap, HashMap},
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
};

use candle_core::{safetensors, Device, Tensor, Var};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::TrainingError;

pub const CHECKPOINT_VERSION: u32 = 1;
const MODEL_FILENAME: &str = "model.safetensors";
const RUN_STATE_FILENAME: &str = "run_state.json";
const MANIFEST_FILENAME: &str = "manifest.json";
const CHECKPOINT_SUBDIR: &str = "evidence_identifier";

/// Where a run stands. Persisted as a single value so resumption never has to
/// reconcile a completion flag with a separately stored epoch counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "epoch", rename_all = "snake_case")]
pub enum RunLifecycle {
    NotStarted,
    /// The given epoch finished and was persisted; the next run starts at
    /// `epoch + 1`.
    InProgress(usize),
    /// Training ended (naturally or by early stopping) after the given epoch.
    Completed(usize),
}

impl RunLifecycle {
    pub fn epoch(&self) -> Option<usize> {
        match self {
            RunLifecycle::NotStarted => None,
            RunLifecycle::InProgress(epoch) | RunLifecycle::Completed(epoch) => Some(*epoch),
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, RunLifecycle::Completed(_))
    }
}

/// Per-epoch metric series keyed by metric name. Scalar series hold numbers;
/// report series hold structured per-class values. Everything is plain JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricHistory {
    #[serde(flatten)]
    series: BTreeMap<String, Vec<serde_json::Value>>,
}

impl MetricHistory {
    pub fn push_scalar(&mut self, name: &str, value: f64) {
        self.push_value(name, serde_json::Value::from(value));
    }

    pub fn push_value(&mut self, name: &str, value: serde_json::Value) {
        self.series.entry(name.to_string()).or_default().push(value);
    }

    pub fn get(&self, name: &str) -> Option<&[serde_json::Value]> {
        self.series.get(name).map(Vec::as_slice)
    }

    pub fn series_len(&self, name: &str) -> usize {
        self.series.get(name).map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }
}

/// Everything a restart needs besides the weights themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub lifecycle: RunLifecycle,
    pub best_epoch: Option<usize>,
    /// Best validation total loss seen so far; `None` until one exists (the
    /// conceptual starting point is positive infinity, which JSON cannot
    /// carry).
    pub best_val_loss: Option<f64>,
    pub history: MetricHistory,
}

impl RunState {
    pub fn fresh() -> Self {
        Self {
            lifecycle: RunLifecycle::NotStarted,
            best_epoch: None,
            best_val_loss: None,
            history: MetricHistory::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub model: FileRecord,
    pub run_state: FileRecord,
}

pub struct LoadedCheckpoint {
    pub state: RunState,
    pub weights: HashMap<String, Tensor>,
}

/// Persists and restores the best model weights plus run state under
/// `<output_dir>/evidence_identifier/`.
pub struct CheckpointManager {
    directory: PathBuf,
}

impl CheckpointManager {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            directory: output_dir.join(CHECKPOINT_SUBDIR),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Writes weights first, the run state second, and the manifest last, so
    /// a restart never observes a run state without the weights it refers to.
    pub fn save(
        &self,
        weights: &[(String, Tensor)],
        state: &RunState,
    ) -> Result<(), TrainingError> {
        if weights.is_empty() {
            return Err(TrainingError::runtime(
                "model contains no parameters to checkpoint",
            ));
        }
        fs::create_dir_all(&self.directory).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create checkpoint directory {}: {err}",
                self.directory.display()
            ))
        })?;

        let model_path = self.directory.join(MODEL_FILENAME);
        let tensors: HashMap<String, Tensor> = weights.iter().cloned().collect();
        safetensors::save(&tensors, &model_path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to serialize model weights to {}: {err}",
                model_path.display()
            ))
        })?;
        let model_record = file_record(&model_path)?;

        let state_path = self.directory.join(RUN_STATE_FILENAME);
        write_json(&state_path, state)?;
        let state_record = file_record(&state_path)?;

        let manifest = CheckpointManifest {
            version: CHECKPOINT_VERSION,
            model: model_record,
            run_state: state_record,
        };
        write_json(&self.directory.join(MANIFEST_FILENAME), &manifest)
    }

    /// Returns `None` when no checkpoint exists; otherwise validates the
    /// manifest digests and returns the run state with the weights found on
    /// disk.
    pub fn load(&self, device: &Device) -> Result<Option<LoadedCheckpoint>, TrainingError> {
        let manifest_path = self.directory.join(MANIFEST_FILENAME);
        if !manifest_path.is_file() {
            return Ok(None);
        }
        let manifest: CheckpointManifest = read_json(&manifest_path)?;
        if manifest.version != CHECKPOINT_VERSION {
            return Err(TrainingError::runtime(format!(
                "unsupported checkpoint version {} (expected {})",
                manifest.version, CHECKPOINT_VERSION
            )));
        }

        let model_path = self.directory.join(&manifest.model.filename);
        validate_file(&model_path, &manifest.model.sha256)?;
        let state_path = self.directory.join(&manifest.run_state.filename);
        validate_file(&state_path, &manifest.run_state.sha256)?;

        let state: RunState = read_json(&state_path)?;
        let weights = safetensors::load(&model_path, device).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to load model weights from {}: {err}",
                model_path.display()
            ))
        })?;

        Ok(Some(LoadedCheckpoint { state, weights }))
    }
}

/// Deep-copies the current parameter values so later optimizer steps cannot
/// mutate the snapshot through shared storage.
pub fn snapshot_weights(params: &[(String, Var)]) -> Result<Vec<(String, Tensor)>, TrainingError> {
    let mut snapshot = Vec::with_capacity(params.len());
    for (name, var) in params {
        let copy = var.as_tensor().copy().map_err(to_runtime_error)?;
        snapshot.push((name.clone(), copy));
    }
    Ok(snapshot)
}

/// Sets every live parameter from `weights`; a missing or extra entry means
/// the checkpoint belongs to a different model and is an error.
pub fn restore_weights(
    params: &[(String, Var)],
    weights: &HashMap<String, Tensor>,
) -> Result<(), TrainingError> {
    let mut remaining: HashMap<&String, &Tensor> = weights.iter().collect();
    for (name, var) in params {
        let tensor = remaining.remove(name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        let desired_dtype = var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired_dtype {
            tensor.clone()
        } else {
            tensor.to_dtype(desired_dtype).map_err(to_runtime_error)?
        };
        var.set(&tensor).map_err(to_runtime_error)?;
    }
    if !remaining.is_empty() {
        let extra = remaining
            .keys()
            .map(|name| name.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {extra}"
        )));
    }
    Ok(())
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn to_runtime_error(err: candle_core::Error) -> TrainingError {
    TrainingError::runtime(err.to_string())
}
