//! The push-pull distributed optimizer.
//!
//! Wraps the model parameters, averages gradients across the worker
//! group inside `step` (the collective synchronization point), and
//! applies an SGD-with-momentum or Nesterov update. Parameters are
//! visited in name order so every worker issues the collectives in the
//! same sequence.
//!
//! When a gradient compressor is configured the plain SGD update rule
//! is used; otherwise Nesterov momentum. The compression parameters
//! themselves are forwarded to the communication layer untouched.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::VarMap;
use tracing::info;

use crate::distributed::CollectiveCommunicator;
use crate::training::scheduler::LrSchedule;
use crate::utils::checkpoint;
use crate::utils::config::CompressionParams;
use crate::utils::error::{Result, TrainError};

/// Update rule applied after gradient synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerKind {
    /// Plain SGD with momentum. Selected when a compressor is
    /// configured, since error-feedback compressors assume it.
    Sgd,
    /// Nesterov accelerated gradient, the default.
    Nag,
}

impl OptimizerKind {
    pub fn for_compression(compression: &CompressionParams) -> Self {
        if compression.enabled() {
            OptimizerKind::Sgd
        } else {
            OptimizerKind::Nag
        }
    }
}

struct ParamSlot {
    name: String,
    var: Var,
    wd_mult: f64,
    momentum: Option<Tensor>,
}

/// Data-parallel optimizer: rescale, push-pull, update.
pub struct DistributedOptimizer {
    slots: Vec<ParamSlot>,
    kind: OptimizerKind,
    momentum: f64,
    weight_decay: f64,
    schedule: LrSchedule,
    iteration: usize,
    comm: Arc<dyn CollectiveCommunicator>,
    compression: CompressionParams,
}

impl DistributedOptimizer {
    /// Build from a var map. With `no_wd` set, weight decay is removed
    /// from biases and normalization parameters.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        varmap: &VarMap,
        kind: OptimizerKind,
        momentum: f64,
        weight_decay: f64,
        no_wd: bool,
        schedule: LrSchedule,
        comm: Arc<dyn CollectiveCommunicator>,
        compression: CompressionParams,
    ) -> Self {
        let mut slots: Vec<ParamSlot> = varmap
            .data()
            .lock()
            .unwrap()
            .iter()
            .map(|(name, var)| {
                let wd_mult = if no_wd && decay_exempt(name) { 0.0 } else { 1.0 };
                ParamSlot {
                    name: name.clone(),
                    var: var.clone(),
                    wd_mult,
                    momentum: None,
                }
            })
            .collect();
        // Name order keeps the collective sequence identical on every
        // worker.
        slots.sort_by(|a, b| a.name.cmp(&b.name));

        if compression.enabled() {
            info!(
                compressor = compression.compressor.as_deref().unwrap_or(""),
                k = compression.k,
                normalize = ?compression.normalize,
                "gradient compression configured"
            );
        }

        Self {
            slots,
            kind,
            momentum,
            weight_decay,
            schedule,
            iteration: 0,
            comm,
            compression,
        }
    }

    /// The learning rate the next `step` will apply.
    pub fn learning_rate(&self) -> f64 {
        self.schedule.at(self.iteration)
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn compression(&self) -> &CompressionParams {
        &self.compression
    }

    /// One synchronized optimizer step. `batch_size` is the
    /// per-worker synchronization unit: gradients are rescaled by its
    /// inverse before the collective average.
    pub fn step(&mut self, batch_size: usize, grads: &GradStore) -> Result<()> {
        if batch_size == 0 {
            return Err(TrainError::Training("step with empty batch".to_string()));
        }
        let lr = self.schedule.at(self.iteration);
        let rescale = 1.0 / batch_size as f64;
        let world = self.comm.world_size();

        for slot in self.slots.iter_mut() {
            let Some(grad) = grads.get(&slot.var) else {
                continue;
            };

            let mut g = (grad * rescale)?;
            if world > 1 {
                g = (self
                    .comm
                    .all_reduce(&g)
                    .map_err(|e| TrainError::Distributed(format!("all_reduce failed: {}", e)))?
                    / world as f64)?;
            }

            let wd = self.weight_decay * slot.wd_mult;
            if wd != 0.0 {
                g = (g + (slot.var.as_tensor() * wd)?)?;
            }

            let prev = match slot.momentum.take() {
                Some(m) => m,
                None => g.zeros_like()?,
            };
            let m = ((prev * self.momentum)? + &g)?;

            let update = match self.kind {
                OptimizerKind::Sgd => m.clone(),
                OptimizerKind::Nag => (&g + (&m * self.momentum)?)?,
            };
            slot.momentum = Some(m);

            let next = (slot.var.as_tensor() - (update * lr)?)?;
            slot.var.set(&next)?;
        }

        self.iteration += 1;
        Ok(())
    }

    /// Persist momentum buffers and the iteration counter.
    pub fn save_states<P: AsRef<Path>>(&self, path: P, epoch: Option<u64>) -> Result<()> {
        let device = Device::Cpu;
        let mut tensors: HashMap<String, Tensor> = HashMap::new();
        for slot in &self.slots {
            if let Some(m) = &slot.momentum {
                tensors.insert(format!("momentum.{}", slot.name), m.to_device(&device)?);
            }
        }
        tensors.insert(
            "iteration".to_string(),
            Tensor::new(&[self.iteration as f32], &device)?,
        );
        checkpoint::save_tensors(&tensors, path, epoch, None)
    }

    /// Restore momentum buffers and the iteration counter.
    pub fn load_states<P: AsRef<Path>>(&mut self, path: P, device: &Device) -> Result<()> {
        let (tensors, _meta) = checkpoint::load_tensors(path.as_ref(), device)?;

        let iteration = tensors
            .get("iteration")
            .ok_or_else(|| {
                TrainError::Checkpoint(format!(
                    "state file {} has no iteration counter",
                    path.as_ref().display()
                ))
            })?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?[0] as usize;
        self.iteration = iteration;

        for slot in self.slots.iter_mut() {
            if let Some(m) = tensors.get(&format!("momentum.{}", slot.name)) {
                slot.momentum = Some(m.to_device(device)?);
            }
        }

        info!(states = %path.as_ref().display(), iteration, "optimizer states restored");
        Ok(())
    }
}

/// Parameters exempt from weight decay under `--no-wd`: biases and
/// batch/group-norm scale and shift.
fn decay_exempt(name: &str) -> bool {
    name.ends_with(".bias") || name.contains(".bn") || name.contains("norm")
}
