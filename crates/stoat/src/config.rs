use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use stoat_core::{Error, Result};

// TrainerOptions — the flat configuration surface
//
// Consumed once at orchestrator construction; a small subset (batch size,
// max epochs, validation cadence) may be hot-reloaded from a watched JSON
// file between steps, so long runs can be retuned without a restart.

/// Flat trainer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerOptions {
    /// Sentences per mini-batch.
    pub batch_size: usize,
    pub max_epochs: usize,
    /// Mini-batches accumulated per weight update, per device.
    pub update_frequency: usize,
    /// Device indices to replicate over; index 0 is canonical.
    pub device_ids: Vec<usize>,
    /// Optional per-device allocation cap in bytes.
    pub device_memory_budget: Option<usize>,
    pub base_lr: f64,
    pub warmup_steps: usize,
    /// Global gradient-norm clip; 0 disables clipping.
    pub max_grad_norm: f64,
    /// Validate every N updates; 0 = only at epoch boundaries.
    pub valid_run_every_updates: usize,
    /// No validation before this many updates.
    pub valid_start_after_updates: usize,
    /// Progress log cadence, in updates.
    pub report_every_updates: usize,
    /// Where the best model is saved; `.latest` is appended for snapshots.
    pub model_path: PathBuf,
}

impl Default for TrainerOptions {
    fn default() -> Self {
        TrainerOptions {
            batch_size: 32,
            max_epochs: 10,
            update_frequency: 1,
            device_ids: vec![0],
            device_memory_budget: None,
            base_lr: 1e-3,
            warmup_steps: 100,
            max_grad_norm: 5.0,
            valid_run_every_updates: 0,
            valid_start_after_updates: 0,
            report_every_updates: 50,
            model_path: PathBuf::from("model.stoat"),
        }
    }
}

impl TrainerOptions {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| Error::msg(format!("bad options file: {e}")))
    }

    /// Adopt the hot-reloadable subset from a newer options value.
    pub fn apply_reload(&mut self, newer: &TrainerOptions) {
        self.batch_size = newer.batch_size;
        self.max_epochs = newer.max_epochs;
        self.valid_run_every_updates = newer.valid_run_every_updates;
    }
}

/// Polls an options file's mtime between steps and re-reads it on change.
pub struct OptionsWatcher {
    path: PathBuf,
    last_mtime: Option<SystemTime>,
}

impl OptionsWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_mtime = fs::metadata(&path).and_then(|m| m.modified()).ok();
        OptionsWatcher {
            path,
            last_mtime,
        }
    }

    /// Fresh options when the file changed since the last poll. Read
    /// failures are reported once per change and otherwise ignored — a
    /// malformed edit must not stop training.
    pub fn poll(&mut self) -> Option<TrainerOptions> {
        let mtime = fs::metadata(&self.path).and_then(|m| m.modified()).ok()?;
        if Some(mtime) == self.last_mtime {
            return None;
        }
        self.last_mtime = Some(mtime);
        match TrainerOptions::load(&self.path) {
            Ok(opts) => Some(opts),
            Err(e) => {
                tracing::warn!("options file changed but could not be read: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reload_touches_only_the_hot_subset() {
        let mut opts = TrainerOptions {
            batch_size: 8,
            base_lr: 0.5,
            ..TrainerOptions::default()
        };
        let newer = TrainerOptions {
            batch_size: 16,
            max_epochs: 3,
            valid_run_every_updates: 7,
            base_lr: 0.001,
            ..TrainerOptions::default()
        };
        opts.apply_reload(&newer);
        assert_eq!(opts.batch_size, 16);
        assert_eq!(opts.max_epochs, 3);
        assert_eq!(opts.valid_run_every_updates, 7);
        // not hot-reloadable:
        assert_eq!(opts.base_lr, 0.5);
    }

    #[test]
    fn options_roundtrip_json() {
        let opts = TrainerOptions::default();
        let json = serde_json::to_string(&opts).unwrap();
        let back: TrainerOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.batch_size, opts.batch_size);
        assert_eq!(back.model_path, opts.model_path);
    }
}
