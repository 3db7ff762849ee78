use std::{
    fs::{self, OpenOptions},
    io::{BufWriter, Write},
    path::PathBuf,
};

use crate::eval::EvalReport;
use crate::TrainingError;

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    /// Append-mode JSON-lines sink for per-epoch metrics; `None` disables it.
    pub metrics_path: Option<PathBuf>,
}

/// Per-epoch progress reporting: a stdout summary line plus one JSON record
/// per epoch. Sink failures are not fatal to the run.
pub struct Logger {
    settings: LoggingSettings,
    writer: Option<BufWriter<fs::File>>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let writer = if let Some(path) = settings.metrics_path.as_ref() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|err| {
                    TrainingError::runtime(format!(
                        "failed to create metrics directory {}: {err}",
                        parent.display()
                    ))
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|err| {
                    TrainingError::runtime(format!(
                        "failed to open metrics file {}: {err}",
                        path.display()
                    ))
                })?;
            Some(BufWriter::new(file))
        } else {
            None
        };
        Ok(Self { settings, writer })
    }

    pub fn log_epoch(&mut self, epoch: usize, train_loss: f64, report: &EvalReport) {
        if self.settings.enable_stdout {
            println!(
                "epoch={} train_loss={:.4} val_loss={:.4} val_cls_loss={:.4} val_exp_loss={:.4} cls_acc={:.3} exp_acc={:.3} rationale_f1={:.3}",
                epoch,
                train_loss,
                report.split.total_loss,
                report.split.classification_loss,
                report.split.rationale_loss,
                report.label_accuracy,
                report.token_accuracy,
                report.rationale_scores.f1,
            );
        }

        if let Some(writer) = self.writer.as_mut() {
            let record = serde_json::json!({
                "epoch": epoch,
                "train_loss": train_loss,
                "val_total_loss": report.split.total_loss,
                "val_cls_loss": report.split.classification_loss,
                "val_exp_loss": report.split.rationale_loss,
                "val_cls_acc": report.label_accuracy,
                "val_exp_acc": report.token_accuracy,
                "val_rationale_scores": report.rationale_scores,
            });
            let _ = serde_json::to_writer(&mut *writer, &record);
            let _ = writer.write_all(b"\n");
        }
    }

    pub fn log_early_stop(&mut self, epoch: usize, best_epoch: usize) {
        if self.settings.enable_stdout {
            println!(
                "early stop at epoch {} (no improvement since epoch {})",
                epoch, best_epoch
            );
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
        }
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        self.flush();
    }
}
