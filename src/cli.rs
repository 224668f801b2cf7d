//! Command-line interface for the training binary.

use std::path::PathBuf;

use clap::Parser;

use crate::utils::config::{CompressionParams, NormalizeMode, TrainConfig};
use crate::utils::error::{Result, TrainError};

/// Train a model for image classification.
#[derive(Parser, Debug, Clone)]
#[command(name = "train-imagenet", about = "Train an image classification model")]
pub struct Args {
    /// Training and validation data directory (shard layout).
    #[arg(long, default_value = "data/imagenet")]
    pub data_dir: PathBuf,

    /// The training record file.
    #[arg(long, default_value = "data/imagenet/train.safetensors")]
    pub rec_train: PathBuf,

    /// The validation record file.
    #[arg(long, default_value = "data/imagenet/val.safetensors")]
    pub rec_val: PathBuf,

    /// Read single record files instead of shard directories.
    #[arg(long)]
    pub use_rec: bool,

    /// Training batch size per worker.
    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,

    /// Data type for training.
    #[arg(long, default_value = "float32")]
    pub dtype: String,

    /// Number of GPUs to use; 0 trains on CPU.
    #[arg(long, default_value_t = 0)]
    pub num_gpus: usize,

    /// Number of preprocessing workers.
    #[arg(long = "num-data-workers", short = 'j', default_value_t = 4)]
    pub num_workers: usize,

    /// Number of training epochs.
    #[arg(long, default_value_t = 3)]
    pub num_epochs: usize,

    /// Number of label classes.
    #[arg(long, default_value_t = 1000)]
    pub classes: usize,

    /// Learning rate.
    #[arg(long, default_value_t = 0.1)]
    pub lr: f64,

    /// Momentum value for the optimizer.
    #[arg(long, default_value_t = 0.9)]
    pub momentum: f64,

    /// Weight decay rate.
    #[arg(long, default_value_t = 0.0001)]
    pub wd: f64,

    /// Learning rate scheduler mode: step, poly or cosine.
    #[arg(long, default_value = "step")]
    pub lr_mode: String,

    /// Decay rate of the learning rate.
    #[arg(long, default_value_t = 0.1)]
    pub lr_decay: f64,

    /// Interval for periodic learning rate decays; 0 to disable.
    #[arg(long, default_value_t = 0)]
    pub lr_decay_period: usize,

    /// Epochs at which the learning rate decays.
    #[arg(long, default_value = "40,60")]
    pub lr_decay_epoch: String,

    /// Starting warmup learning rate.
    #[arg(long, default_value_t = 0.0)]
    pub warmup_lr: f64,

    /// Number of warmup epochs.
    #[arg(long, default_value_t = 0)]
    pub warmup_epochs: usize,

    /// Type of model to use.
    #[arg(long, required = true)]
    pub model: String,

    /// Size of the input image.
    #[arg(long, default_value_t = 224)]
    pub input_size: usize,

    /// Train the model with mixup.
    #[arg(long)]
    pub mixup: bool,

    /// Beta distribution parameter for mixup sampling.
    #[arg(long, default_value_t = 0.2)]
    pub mixup_alpha: f64,

    /// How many final epochs to train without mixup.
    #[arg(long, default_value_t = 0)]
    pub mixup_off_epoch: usize,

    /// Use label smoothing.
    #[arg(long)]
    pub label_smoothing: bool,

    /// Remove weight decay on bias and batch-norm parameters.
    #[arg(long)]
    pub no_wd: bool,

    /// Teacher model for distillation training.
    #[arg(long)]
    pub teacher: Option<String>,

    /// Pretrained parameters of the teacher model.
    #[arg(long)]
    pub teacher_params: Option<PathBuf>,

    /// Temperature parameter for the distillation teacher.
    #[arg(long, default_value_t = 20.0)]
    pub temperature: f64,

    /// Weight of the one-hot label loss in distillation training.
    #[arg(long, default_value_t = 0.5)]
    pub hard_weight: f64,

    /// Frequency of model saving in epochs.
    #[arg(long, default_value_t = 10)]
    pub save_frequency: usize,

    /// Directory for saved checkpoints.
    #[arg(long, default_value = "params")]
    pub save_dir: PathBuf,

    /// Epoch to resume training from.
    #[arg(long, default_value_t = 0)]
    pub resume_epoch: usize,

    /// Path of parameters to load for resume.
    #[arg(long)]
    pub resume_params: Option<PathBuf>,

    /// Path of trainer states to load for resume.
    #[arg(long)]
    pub resume_states: Option<PathBuf>,

    /// Number of batches between progress logs.
    #[arg(long, default_value_t = 50)]
    pub log_interval: usize,

    /// Name of the training log file.
    #[arg(long, default_value = "train_imagenet.log")]
    pub logging_file: String,

    /// Which gradient compressor to use; empty disables compression.
    #[arg(long, default_value = "")]
    pub compressor: String,

    /// Which error-feedback scheme to use.
    #[arg(long, default_value = "")]
    pub ef: String,

    /// Which compressed-momentum scheme to use.
    #[arg(long, default_value = "")]
    pub compress_momentum: String,

    /// Enable scaling for the onebit compressor.
    #[arg(long)]
    pub onebit_scaling: bool,

    /// k parameter for topk and randomk compressors.
    #[arg(long, default_value_t = 1.0)]
    pub k: f64,

    /// Gradient normalization for compression: max or l2.
    #[arg(long, default_value = "max")]
    pub normalize: String,

    /// Use fp16 compression during push-pull.
    #[arg(long)]
    pub fp16_pushpull: bool,
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

impl Args {
    /// Convert parsed flags into a validated [`TrainConfig`].
    pub fn into_config(self) -> Result<TrainConfig> {
        let lr_mode = self.lr_mode.parse()?;
        let normalize: NormalizeMode = self.normalize.parse()?;

        let lr_decay_epoch = self
            .lr_decay_epoch
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|s| {
                s.trim().parse::<usize>().map_err(|_| {
                    TrainError::Config(format!("invalid lr-decay-epoch entry '{}'", s))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let compression = CompressionParams {
            compressor: non_empty(self.compressor),
            error_feedback: non_empty(self.ef),
            momentum: non_empty(self.compress_momentum),
            onebit_scaling: self.onebit_scaling,
            k: self.k,
            normalize,
            fp16_pushpull: self.fp16_pushpull,
        };

        let cfg = TrainConfig {
            model: self.model,
            classes: self.classes,
            batch_size: self.batch_size,
            num_epochs: self.num_epochs,
            input_size: self.input_size,
            dtype: self.dtype,
            lr: self.lr,
            momentum: self.momentum,
            wd: self.wd,
            lr_mode,
            lr_decay: self.lr_decay,
            lr_decay_period: self.lr_decay_period,
            lr_decay_epoch,
            warmup_lr: self.warmup_lr,
            warmup_epochs: self.warmup_epochs,
            no_wd: self.no_wd,
            mixup: self.mixup,
            mixup_alpha: self.mixup_alpha,
            mixup_off_epoch: self.mixup_off_epoch,
            label_smoothing: self.label_smoothing,
            teacher: self.teacher,
            teacher_params: self.teacher_params,
            temperature: self.temperature,
            hard_weight: self.hard_weight,
            use_rec: self.use_rec,
            rec_train: self.rec_train,
            rec_val: self.rec_val,
            data_dir: self.data_dir,
            num_workers: self.num_workers,
            save_frequency: self.save_frequency,
            save_dir: self.save_dir,
            resume_epoch: self.resume_epoch,
            resume_params: self.resume_params,
            resume_states: self.resume_states,
            log_interval: self.log_interval,
            compression,
        };
        cfg.validate()?;
        Ok(cfg)
    }
}
