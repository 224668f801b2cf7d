//! The per-worker training loop.
//!
//! One process per worker, each running the same epoch state machine:
//! resume, train an epoch, evaluate, checkpoint, repeat until the
//! configured epoch count. Gradient synchronization happens inside the
//! distributed optimizer's `step`, which every worker must reach the
//! same number of times per epoch.

use std::sync::Arc;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::{ops, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;

use crate::data::{split_batch, BatchLoader};
use crate::distributed::{CollectiveCommunicator, DistributedOptimizer, OptimizerKind};
use crate::model::{build_model, ImageClassifier};
use crate::training::loss::{distillation_loss, teacher_soft_targets, Target};
use crate::training::metric::{Accuracy, TopKAccuracy, TrainMetric};
use crate::training::scheduler::LrSchedule;
use crate::training::transform::{mixup_inputs, mixup_labels, one_hot_smoothed, MixupDecision};
use crate::utils::checkpoint;
use crate::utils::config::{TrainConfig, TrainMode};
use crate::utils::error::Result;
use crate::utils::metrics as prom;

/// Monotone best-error tracking for checkpoint decisions.
#[derive(Debug)]
pub struct BestTracker {
    best: f64,
}

impl BestTracker {
    pub fn new() -> Self {
        Self { best: 1.0 }
    }

    /// Record an epoch error; true when it improves on every earlier
    /// epoch.
    pub fn improved(&mut self, err: f64) -> bool {
        if err < self.best {
            self.best = err;
            true
        } else {
            false
        }
    }

    pub fn best(&self) -> f64 {
        self.best
    }
}

impl Default for BestTracker {
    fn default() -> Self {
        Self::new()
    }
}

struct TeacherModel {
    model: Box<dyn ImageClassifier>,
    // Holds the pretrained weights referenced by `model`.
    _varmap: VarMap,
}

/// Trainer for one worker process.
pub struct Trainer {
    cfg: TrainConfig,
    mode: TrainMode,
    dtype: DType,
    devices: Vec<Device>,
    varmap: VarMap,
    model: Box<dyn ImageClassifier>,
    teacher: Option<TeacherModel>,
    optimizer: DistributedOptimizer,
    nworker: usize,
    train_metric: TrainMetric,
    acc_top1: Accuracy,
    acc_top5: TopKAccuracy,
    best: BestTracker,
    rng: StdRng,
}

impl Trainer {
    /// Build the model, optional teacher, and distributed optimizer.
    /// `iters_per_epoch` anchors the learning-rate schedule and comes
    /// from the training loader.
    pub fn new(
        cfg: TrainConfig,
        devices: Vec<Device>,
        comm: Arc<dyn CollectiveCommunicator>,
        iters_per_epoch: usize,
    ) -> Result<Self> {
        cfg.validate()?;
        let mode = cfg.resolve_mode()?;
        let dtype = cfg.train_dtype()?;
        let primary = devices[0].clone();
        let nworker = comm.world_size();

        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, dtype, &primary);
        let model = build_model(&cfg.model, cfg.classes, cfg.input_size, vb)?;
        if let Some(path) = &cfg.resume_params {
            checkpoint::load_parameters(&mut varmap, path)?;
        }

        let teacher = match &mode {
            TrainMode::Distilled {
                teacher,
                teacher_params,
                ..
            } => {
                let mut tvarmap = VarMap::new();
                let tvb = VarBuilder::from_varmap(&tvarmap, dtype, &primary);
                let tmodel = build_model(teacher, cfg.classes, cfg.input_size, tvb)?;
                checkpoint::load_parameters(&mut tvarmap, teacher_params)?;
                info!(teacher = %teacher, "distillation teacher loaded");
                Some(TeacherModel {
                    model: tmodel,
                    _varmap: tvarmap,
                })
            }
            _ => None,
        };

        // The target rate scales with the worker count; decay epochs
        // are anchored to absolute epoch numbers inside the schedule.
        let schedule = LrSchedule::new(
            cfg.lr_mode,
            cfg.lr * nworker as f64,
            cfg.warmup_lr,
            cfg.warmup_epochs,
            cfg.num_epochs,
            &cfg.decay_epochs(),
            cfg.lr_decay,
            iters_per_epoch,
        );

        let kind = OptimizerKind::for_compression(&cfg.compression);
        let mut optimizer = DistributedOptimizer::new(
            &varmap,
            kind,
            cfg.momentum,
            cfg.wd,
            cfg.no_wd,
            schedule,
            comm,
            cfg.compression.clone(),
        );
        if let Some(path) = &cfg.resume_states {
            optimizer.load_states(path, &primary)?;
        }

        let train_metric = match mode {
            TrainMode::Mixup { .. } => TrainMetric::rmse(),
            _ => TrainMetric::accuracy(),
        };

        Ok(Self {
            cfg,
            mode,
            dtype,
            devices,
            varmap,
            model,
            teacher,
            optimizer,
            nworker,
            train_metric,
            acc_top1: Accuracy::new(),
            acc_top5: TopKAccuracy::new(5),
            best: BestTracker::new(),
            rng: StdRng::seed_from_u64(0),
        })
    }

    /// One batch: transform, forward, loss, backward, synchronized
    /// step, metric update. Returns the mean loss over the batch.
    fn train_batch(&mut self, epoch: usize, data: &Tensor, label: &Tensor) -> Result<f64> {
        let batch_size = data.dim(0)?;
        let shards = split_batch(data, label, &self.devices)?;

        // One draw per batch, shared by the input and label blends of
        // every shard.
        let decision = match &self.mode {
            TrainMode::Mixup {
                alpha, off_epoch, ..
            } => MixupDecision::sample(
                &mut self.rng,
                *alpha,
                epoch,
                self.cfg.num_epochs,
                *off_epoch,
            )?,
            _ => MixupDecision::disabled(),
        };

        let mut total_loss: Option<Tensor> = None;
        let mut outputs = Vec::with_capacity(shards.len());
        let mut metric_refs = Vec::with_capacity(shards.len());

        for (x, l) in &shards {
            let x = x.to_dtype(self.dtype)?;
            let shard_n = x.dim(0)?;

            let (x, target, metric_ref) = match &self.mode {
                TrainMode::Plain => (x, Target::Sparse(l.clone()), MetricRef::Hard(l.clone())),
                TrainMode::Smoothed { eta } => {
                    let dense = one_hot_smoothed(l, self.cfg.classes, *eta)?;
                    (x, Target::Dense(dense), MetricRef::Hard(l.clone()))
                }
                TrainMode::Mixup { eta, .. } => {
                    let x = mixup_inputs(decision, &x)?;
                    let dense = mixup_labels(decision, l, self.cfg.classes, *eta)?;
                    (x, Target::Dense(dense.clone()), MetricRef::Soft(dense))
                }
                TrainMode::Distilled { smoothing, .. } => {
                    let target = if *smoothing {
                        Target::Dense(one_hot_smoothed(
                            l,
                            self.cfg.classes,
                            crate::utils::config::SMOOTHING_ETA,
                        )?)
                    } else {
                        Target::Sparse(l.clone())
                    };
                    (x, target, MetricRef::Hard(l.clone()))
                }
            };

            let out = self.model.forward_t(&x, true)?;
            let out = out.to_dtype(DType::F32)?;

            let loss = match &self.mode {
                TrainMode::Distilled {
                    temperature,
                    hard_weight,
                    ..
                } => {
                    let teacher = self.teacher.as_ref().expect("distillation without teacher");
                    let t_logits = teacher.model.forward_t(&x, false)?.to_dtype(DType::F32)?;
                    let prob = teacher_soft_targets(&t_logits, *temperature)?;
                    distillation_loss(&out, &target, &prob, *temperature, *hard_weight)?
                }
                _ => target.cross_entropy(&out)?,
            };

            // Shard losses are means; weight by shard size so the
            // 1/batch rescale inside `step` yields the batch mean.
            let weighted = (loss * shard_n as f64)?;
            total_loss = Some(match total_loss {
                Some(acc) => (acc + weighted.to_device(&self.devices[0])?)?,
                None => weighted,
            });

            outputs.push(out);
            metric_refs.push(metric_ref);
        }

        let total_loss = total_loss.expect("empty batch");
        let grads = total_loss.backward()?;
        self.optimizer.step(batch_size, &grads)?;

        for (out, metric_ref) in outputs.iter().zip(metric_refs.iter()) {
            match (&mut self.train_metric, metric_ref) {
                (TrainMetric::Rmse(m), MetricRef::Soft(dense)) => {
                    let probs = ops::softmax(out, candle_core::D::Minus1)?;
                    m.update(dense, &probs)?;
                }
                (TrainMetric::Accuracy(m), MetricRef::Hard(hard)) => {
                    m.update(hard, out)?;
                }
                // Mode and metric are selected together; the other
                // pairings cannot occur.
                _ => unreachable!("metric does not match training mode"),
            }
        }

        let loss_value = total_loss.to_scalar::<f32>()? as f64 / batch_size as f64;
        Ok(loss_value)
    }

    /// One full pass over the training shard.
    pub fn train_epoch(&mut self, epoch: usize, loader: &mut BatchLoader) -> Result<()> {
        let tic = Instant::now();
        loader.reset();
        self.train_metric.reset();

        let mut btic = Instant::now();
        let mut batches = 0usize;
        let mut last_loss = 0.0;

        while let Some((data, label)) = loader.next_batch()? {
            last_loss = self.train_batch(epoch, &data, &label)?;
            batches += 1;

            if self.cfg.log_interval > 0 && batches % self.cfg.log_interval == 0 {
                let lr = self.optimizer.learning_rate();
                let interval_samples =
                    self.cfg.batch_size * self.nworker * self.cfg.log_interval;
                let speed = interval_samples as f64 / btic.elapsed().as_secs_f64();
                info!(
                    "Epoch[{}] Batch [{}]\tSpeed: {:.2} samples/sec\t{}={:.6}\tlr={:.6}",
                    epoch,
                    batches - 1,
                    speed,
                    self.train_metric.name(),
                    self.train_metric.value(),
                    lr
                );
                prom::record_interval(last_loss, speed, lr, self.cfg.log_interval as u64);
                btic = Instant::now();
            }
        }

        let elapsed = tic.elapsed().as_secs_f64();
        let throughput =
            (self.cfg.batch_size * self.nworker * batches) as f64 / elapsed.max(f64::EPSILON);
        info!(
            "[Epoch {}] speed: {:.0} samples/sec\ttime cost: {:.2}s",
            epoch, throughput, elapsed
        );
        Ok(())
    }

    /// Forward-only pass over the validation set, returning
    /// `(err_top1, err_top5)`. Accumulators reset on entry, so calls
    /// are independent.
    pub fn evaluate(&mut self, loader: &mut BatchLoader) -> Result<(f64, f64)> {
        loader.reset();
        self.acc_top1.reset();
        self.acc_top5.reset();

        while let Some((data, label)) = loader.next_batch()? {
            for (x, l) in split_batch(&data, &label, &self.devices)? {
                let x = x.to_dtype(self.dtype)?;
                let out = self.model.forward_t(&x, false)?.to_dtype(DType::F32)?;
                self.acc_top1.update(&l, &out)?;
                self.acc_top5.update(&l, &out)?;
            }
        }

        Ok((1.0 - self.acc_top1.value(), 1.0 - self.acc_top5.value()))
    }

    /// Run the epoch state machine from the resume point to the
    /// configured epoch count.
    pub fn fit(&mut self, train: &mut BatchLoader, val: &mut BatchLoader) -> Result<()> {
        let model_name = self.cfg.model.clone();

        for epoch in self.cfg.resume_epoch..self.cfg.num_epochs {
            self.train_epoch(epoch, train)?;
            info!(
                "[Epoch {}] training: {}={:.6}",
                epoch,
                self.train_metric.name(),
                self.train_metric.value()
            );

            let (err_top1, err_top5) = self.evaluate(val)?;
            prom::record_validation(err_top1, err_top5);
            info!(
                "[Epoch {}] validation: err-top1={:.6} err-top5={:.6}",
                epoch, err_top1, err_top5
            );

            if self.best.improved(err_top1) && self.cfg.checkpointing() {
                let stem = checkpoint::best_stem(err_top1, &model_name, epoch);
                checkpoint::save_parameters(
                    &self.varmap,
                    checkpoint::params_path(&self.cfg.save_dir, &stem),
                    Some(epoch as u64),
                    Some(err_top1),
                )?;
                self.optimizer.save_states(
                    checkpoint::states_path(&self.cfg.save_dir, &stem),
                    Some(epoch as u64),
                )?;
            }

            if self.cfg.checkpointing() && (epoch + 1) % self.cfg.save_frequency == 0 {
                self.save_periodic(epoch)?;
            }
        }

        if self.cfg.checkpointing() {
            self.save_periodic(self.cfg.num_epochs - 1)?;
        }
        Ok(())
    }

    fn save_periodic(&self, epoch: usize) -> Result<()> {
        let stem = checkpoint::periodic_stem(&self.cfg.model, epoch);
        checkpoint::save_parameters(
            &self.varmap,
            checkpoint::params_path(&self.cfg.save_dir, &stem),
            Some(epoch as u64),
            None,
        )?;
        self.optimizer.save_states(
            checkpoint::states_path(&self.cfg.save_dir, &stem),
            Some(epoch as u64),
        )
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn best_val_error(&self) -> f64 {
        self.best.best()
    }
}

/// What the training metric compares against for a shard.
enum MetricRef {
    /// Original integer labels.
    Hard(Tensor),
    /// Blended label distribution.
    Soft(Tensor),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_tracker_sequence() {
        let mut tracker = BestTracker::new();
        let errors = [0.5, 0.3, 0.4, 0.2];
        let saved: Vec<f64> = errors
            .iter()
            .copied()
            .filter(|&e| tracker.improved(e))
            .collect();
        assert_eq!(saved, vec![0.5, 0.3, 0.2]);
        assert!((tracker.best() - 0.2).abs() < 1e-12);
    }
}
