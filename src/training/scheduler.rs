//! Two-phase learning-rate schedule.
//!
//! Phase one ramps linearly from the warmup rate to the target rate
//! over the warmup epochs; phase two decays the target rate toward
//! zero with the configured mode. Decay epoch boundaries are given in
//! absolute epoch numbers and shifted backward by the warmup length so
//! they stay anchored after the warmup phase is spliced in front.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::utils::error::TrainError;

/// Decay mode of the post-warmup phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LrMode {
    Step,
    Poly,
    Cosine,
}

impl std::str::FromStr for LrMode {
    type Err = TrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "step" => Ok(Self::Step),
            "poly" => Ok(Self::Poly),
            "cosine" => Ok(Self::Cosine),
            other => Err(TrainError::Config(format!(
                "unknown lr-mode '{}', expected step, poly or cosine",
                other
            ))),
        }
    }
}

/// Per-iteration learning-rate schedule for a whole run.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    warmup_lr: f64,
    target_lr: f64,
    warmup_iters: usize,
    decay_iters: usize,
    mode: LrMode,
    /// Step boundaries in iterations, relative to the decay phase.
    step_boundaries: Vec<usize>,
    step_factor: f64,
    power: f64,
}

impl LrSchedule {
    /// Build the schedule.
    ///
    /// `decay_epochs` are absolute epoch numbers; boundaries that fall
    /// inside the warmup window are dropped after shifting.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mode: LrMode,
        target_lr: f64,
        warmup_lr: f64,
        warmup_epochs: usize,
        num_epochs: usize,
        decay_epochs: &[usize],
        step_factor: f64,
        iters_per_epoch: usize,
    ) -> Self {
        let warmup_iters = warmup_epochs * iters_per_epoch;
        let decay_iters = num_epochs.saturating_sub(warmup_epochs) * iters_per_epoch;
        let step_boundaries = decay_epochs
            .iter()
            .filter_map(|&e| e.checked_sub(warmup_epochs))
            .map(|e| e * iters_per_epoch)
            .collect();

        Self {
            warmup_lr,
            target_lr,
            warmup_iters,
            decay_iters,
            mode,
            step_boundaries,
            step_factor,
            power: 2.0,
        }
    }

    /// Learning rate at a global iteration number.
    pub fn at(&self, iteration: usize) -> f64 {
        if iteration < self.warmup_iters {
            let progress = iteration as f64 / self.warmup_iters as f64;
            return self.warmup_lr + (self.target_lr - self.warmup_lr) * progress;
        }

        let it = (iteration - self.warmup_iters).min(self.decay_iters);
        match self.mode {
            LrMode::Step => {
                let passed = self.step_boundaries.iter().filter(|&&b| it >= b).count();
                self.target_lr * self.step_factor.powi(passed as i32)
            }
            LrMode::Poly => {
                let progress = it as f64 / self.decay_iters.max(1) as f64;
                self.target_lr * (1.0 - progress).powf(self.power)
            }
            LrMode::Cosine => {
                let progress = it as f64 / self.decay_iters.max(1) as f64;
                self.target_lr * 0.5 * (1.0 + (PI * progress).cos())
            }
        }
    }
}
