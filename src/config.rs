use serde::{Deserialize, Serialize};
use std::{fmt, fs, path::Path};

use crate::sampler::SamplingPolicy;

/// Hyperparameters for one identifier training run.
///
/// Loadable from JSON or TOML; every field except `epochs` has a default so
/// sweep configs only need to state what they override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MtlConfig {
    #[serde(default = "default_sampling_method")]
    pub sampling_method: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    pub epochs: usize,
    #[serde(default = "default_patience")]
    pub patience: usize,
    /// Weight of the rationale-tagging loss relative to the classification
    /// loss. Zero degenerates to single-task classification.
    #[serde(default = "default_par_lambda")]
    pub par_lambda: f64,
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
    #[serde(default = "default_lr")]
    pub lr: f64,
    #[serde(default)]
    pub use_half_precision: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_log_stdout")]
    pub log_stdout: bool,
}

impl MtlConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: MtlConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        if let Err(err) = SamplingPolicy::resolve(&self.sampling_method) {
            errors.push(err.to_string());
        }

        if self.batch_size == 0 {
            errors.push("batch_size must be greater than 0".to_string());
        }

        // Two positions are always reserved for the sequence-start and
        // separator markers, so anything shorter cannot carry a document.
        if self.max_length <= 2 {
            errors.push("max_length must be greater than 2".to_string());
        }

        if self.epochs == 0 {
            errors.push("epochs must be greater than 0".to_string());
        }

        if self.lr <= 0.0 {
            errors.push("lr must be greater than 0".to_string());
        }

        if self.par_lambda < 0.0 {
            errors.push("par_lambda must be >= 0".to_string());
        }

        if let Some(max_norm) = self.max_grad_norm {
            if max_norm <= 0.0 {
                errors.push("max_grad_norm must be greater than 0".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(TrainingError::validation(errors));
        }

        Ok(())
    }
}

fn default_sampling_method() -> String {
    "whole_document".to_string()
}

fn default_batch_size() -> usize {
    16
}

fn default_max_length() -> usize {
    512
}

fn default_patience() -> usize {
    10
}

fn default_par_lambda() -> f64 {
    1.0
}

fn default_lr() -> f64 {
    1e-5
}

fn default_seed() -> u64 {
    42
}

fn default_log_stdout() -> bool {
    true
}

#[derive(Debug)]
pub enum TrainingError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Runtime(String),
}

impl TrainingError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for TrainingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrainingError::Io(err) => write!(f, "failed to read config: {}", err),
            TrainingError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            TrainingError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            TrainingError::Initialization(msg) => {
                write!(f, "trainer initialization failed: {}", msg)
            }
            TrainingError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for TrainingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TrainingError::Io(err) => Some(err),
            TrainingError::ConfigFormat(_)
            | TrainingError::Validation(_)
            | TrainingError::Initialization(_)
            | TrainingError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for TrainingError {
    fn from(value: std::io::Error) -> Self {
        TrainingError::Io(value)
    }
}

impl From<toml::de::Error> for TrainingError {
    fn from(value: toml::de::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for TrainingError {
    fn from(value: serde_json::Error) -> Self {
        TrainingError::ConfigFormat(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        "epochs = 3\n"
    }

    #[test]
    fn defaults_fill_missing_fields() {
        let config: MtlConfig = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.sampling_method, "whole_document");
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.max_length, 512);
        assert_eq!(config.epochs, 3);
        assert_eq!(config.patience, 10);
        assert_eq!(config.par_lambda, 1.0);
        assert!(config.max_grad_norm.is_none());
        assert!(!config.use_half_precision);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_sampling_method_is_fatal() {
        let mut config: MtlConfig = toml::from_str(minimal_toml()).unwrap();
        config.sampling_method = "per_sentence_negative".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("per_sentence_negative"));
    }

    #[test]
    fn validation_collects_all_errors() {
        let mut config: MtlConfig = toml::from_str(minimal_toml()).unwrap();
        config.batch_size = 0;
        config.lr = 0.0;
        config.max_grad_norm = Some(-1.0);
        match config.validate() {
            Err(TrainingError::Validation(messages)) => assert_eq!(messages.len(), 3),
            other => panic!("expected validation failure, got {:?}", other),
        }
    }

    #[test]
    fn loads_json_and_toml_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("run.json");
        std::fs::write(&json_path, r#"{"epochs": 2, "batch_size": 4}"#).unwrap();
        let config = MtlConfig::from_path(&json_path).unwrap();
        assert_eq!(config.epochs, 2);
        assert_eq!(config.batch_size, 4);

        let toml_path = dir.path().join("run.toml");
        std::fs::write(&toml_path, "epochs = 5\nmax_length = 64\n").unwrap();
        let config = MtlConfig::from_path(&toml_path).unwrap();
        assert_eq!(config.epochs, 5);
        assert_eq!(config.max_length, 64);
    }
}
