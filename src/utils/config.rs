//! Run configuration and validation.
//!
//! The CLI flags collapse into [`TrainConfig`], and the boolean
//! mode flags (mixup / label smoothing / distillation) are resolved
//! once, at validation time, into the closed [`TrainMode`] variant.
//! Unsupported flag combinations are rejected here instead of
//! branching deep in the batch loop.

use std::path::PathBuf;

use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::training::scheduler::LrMode;
use crate::utils::error::{Result, TrainError};

/// Label smoothing factor applied when `--label-smoothing` is set.
pub const SMOOTHING_ETA: f32 = 0.1;

/// Gradient compression settings forwarded to the distributed
/// optimizer. The compression numerics live in the communication
/// layer; this crate validates and carries the parameters.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompressionParams {
    pub compressor: Option<String>,
    pub error_feedback: Option<String>,
    pub momentum: Option<String>,
    pub onebit_scaling: bool,
    pub k: f64,
    pub normalize: NormalizeMode,
    pub fp16_pushpull: bool,
}

impl CompressionParams {
    pub fn enabled(&self) -> bool {
        self.compressor.is_some()
    }
}

/// Gradient normalization applied by top-k style compressors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NormalizeMode {
    #[default]
    Max,
    L2,
}

impl std::str::FromStr for NormalizeMode {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "max" => Ok(Self::Max),
            "l2" => Ok(Self::L2),
            other => Err(TrainError::Config(format!(
                "unknown normalize mode '{}', expected 'max' or 'l2'",
                other
            ))),
        }
    }
}

/// The resolved training mode. Exactly one variant is active for a
/// run; conversion from the raw flags happens in
/// [`TrainConfig::resolve_mode`].
#[derive(Debug, Clone, PartialEq)]
pub enum TrainMode {
    /// Sparse integer labels, plain cross-entropy.
    Plain,
    /// Labels smoothed toward uniform by `eta`; hard labels retained
    /// for metric reporting.
    Smoothed { eta: f32 },
    /// Inputs and labels blended with a per-batch Beta(alpha, alpha)
    /// draw. `eta` layers label smoothing under the blend and is 0.1
    /// only when `--label-smoothing` is also set. Mixing is disabled
    /// (lambda forced to 1) for the last `off_epoch` epochs.
    Mixup { alpha: f64, off_epoch: usize, eta: f32 },
    /// Knowledge distillation from a pretrained teacher model.
    Distilled {
        teacher: String,
        teacher_params: PathBuf,
        temperature: f64,
        hard_weight: f64,
        smoothing: bool,
    },
}

impl TrainMode {
    /// Whether the label transform produces a dense distribution.
    pub fn dense_labels(&self) -> bool {
        match self {
            TrainMode::Plain => false,
            TrainMode::Smoothed { .. } | TrainMode::Mixup { .. } => true,
            TrainMode::Distilled { smoothing, .. } => *smoothing,
        }
    }
}

/// Complete configuration of a training run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub model: String,
    pub classes: usize,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub input_size: usize,
    pub dtype: String,

    pub lr: f64,
    pub momentum: f64,
    pub wd: f64,
    pub lr_mode: LrMode,
    pub lr_decay: f64,
    pub lr_decay_period: usize,
    pub lr_decay_epoch: Vec<usize>,
    pub warmup_lr: f64,
    pub warmup_epochs: usize,
    pub no_wd: bool,

    pub mixup: bool,
    pub mixup_alpha: f64,
    pub mixup_off_epoch: usize,
    pub label_smoothing: bool,

    pub teacher: Option<String>,
    pub teacher_params: Option<PathBuf>,
    pub temperature: f64,
    pub hard_weight: f64,

    pub use_rec: bool,
    pub rec_train: PathBuf,
    pub rec_val: PathBuf,
    pub data_dir: PathBuf,
    pub num_workers: usize,

    pub save_frequency: usize,
    pub save_dir: PathBuf,
    pub resume_epoch: usize,
    pub resume_params: Option<PathBuf>,
    pub resume_states: Option<PathBuf>,
    pub log_interval: usize,

    pub compression: CompressionParams,
}

impl TrainConfig {
    /// Resolve the boolean mode flags into the closed [`TrainMode`]
    /// variant, rejecting unsupported combinations.
    pub fn resolve_mode(&self) -> Result<TrainMode> {
        if !(0.0..=1.0).contains(&self.hard_weight) {
            return Err(TrainError::Config(format!(
                "hard-weight must be in [0, 1], got {}",
                self.hard_weight
            )));
        }
        if self.temperature <= 0.0 {
            return Err(TrainError::Config(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }

        // hard_weight == 1.0 means the teacher output would carry no
        // weight, so distillation degenerates to the plain modes.
        let distillation = self.teacher.is_some() && self.hard_weight < 1.0;

        if distillation {
            if self.mixup {
                return Err(TrainError::Config(
                    "distillation cannot be combined with mixup".to_string(),
                ));
            }
            let teacher = self.teacher.clone().unwrap_or_default();
            let teacher_params = self.teacher_params.clone().ok_or_else(|| {
                TrainError::Config(format!(
                    "distillation from '{}' requires --teacher-params",
                    teacher
                ))
            })?;
            return Ok(TrainMode::Distilled {
                teacher,
                teacher_params,
                temperature: self.temperature,
                hard_weight: self.hard_weight,
                smoothing: self.label_smoothing,
            });
        }

        if self.mixup {
            if self.mixup_alpha <= 0.0 {
                return Err(TrainError::Config(format!(
                    "mixup-alpha must be positive, got {}",
                    self.mixup_alpha
                )));
            }
            let eta = if self.label_smoothing { SMOOTHING_ETA } else { 0.0 };
            return Ok(TrainMode::Mixup {
                alpha: self.mixup_alpha,
                off_epoch: self.mixup_off_epoch,
                eta,
            });
        }

        if self.label_smoothing {
            return Ok(TrainMode::Smoothed { eta: SMOOTHING_ETA });
        }

        Ok(TrainMode::Plain)
    }

    /// Remaining scalar sanity checks, run once at startup.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TrainError::Config("batch-size must be nonzero".to_string()));
        }
        if self.num_epochs == 0 {
            return Err(TrainError::Config("num-epochs must be nonzero".to_string()));
        }
        if self.resume_epoch >= self.num_epochs {
            return Err(TrainError::Config(format!(
                "resume-epoch {} is not below num-epochs {}",
                self.resume_epoch, self.num_epochs
            )));
        }
        if self.warmup_epochs >= self.num_epochs {
            return Err(TrainError::Config(format!(
                "warmup-epochs {} must be below num-epochs {}",
                self.warmup_epochs, self.num_epochs
            )));
        }
        self.train_dtype()?;
        self.resolve_mode().map(|_| ())
    }

    /// Decay epoch boundaries in absolute epoch numbers. A nonzero
    /// `lr_decay_period` generates periodic boundaries and overrides
    /// the explicit list.
    pub fn decay_epochs(&self) -> Vec<usize> {
        if self.lr_decay_period > 0 {
            (self.lr_decay_period..self.num_epochs)
                .step_by(self.lr_decay_period)
                .collect()
        } else {
            self.lr_decay_epoch.clone()
        }
    }

    pub fn train_dtype(&self) -> Result<DType> {
        match self.dtype.as_str() {
            "float32" => Ok(DType::F32),
            "float16" => Ok(DType::F16),
            other => Err(TrainError::Config(format!(
                "unsupported dtype '{}', expected float32 or float16",
                other
            ))),
        }
    }

    /// Whether checkpointing is enabled at all.
    pub fn checkpointing(&self) -> bool {
        self.save_frequency > 0 && !self.save_dir.as_os_str().is_empty()
    }
}
