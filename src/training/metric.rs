//! Streaming metric accumulators with `update` / `value` / `reset`.
//!
//! Under mixup the training metric is RMSE between the softmax output
//! and the blended label distribution; under smoothing, accuracy
//! against the original hard labels; otherwise accuracy against the
//! labels as given. Validation uses top-1 and top-5 accuracy, reported
//! as error (`1 - accuracy`).

use candle_core::{DType, Tensor, D};

use crate::utils::error::{Result, TrainError};

/// Top-1 accuracy over integer labels.
#[derive(Debug, Default)]
pub struct Accuracy {
    correct: usize,
    total: usize,
}

impl Accuracy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, labels: &Tensor, outputs: &Tensor) -> Result<()> {
        let predicted = outputs.argmax(D::Minus1)?.to_dtype(DType::U32)?;
        let predicted = predicted.to_vec1::<u32>()?;
        let labels = labels.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        if predicted.len() != labels.len() {
            return Err(TrainError::Training(format!(
                "accuracy update with {} predictions but {} labels",
                predicted.len(),
                labels.len()
            )));
        }
        self.correct += predicted
            .iter()
            .zip(labels.iter())
            .filter(|(p, l)| p == l)
            .count();
        self.total += labels.len();
        Ok(())
    }

    pub fn value(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    pub fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
    }
}

/// Top-k accuracy: a sample counts when fewer than `k` classes score
/// strictly higher than the true class.
#[derive(Debug)]
pub struct TopKAccuracy {
    k: usize,
    correct: usize,
    total: usize,
}

impl TopKAccuracy {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            correct: 0,
            total: 0,
        }
    }

    pub fn update(&mut self, labels: &Tensor, outputs: &Tensor) -> Result<()> {
        let scores = outputs.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let labels = labels.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        if scores.len() != labels.len() {
            return Err(TrainError::Training(format!(
                "top-{} update with {} rows but {} labels",
                self.k,
                scores.len(),
                labels.len()
            )));
        }
        for (row, &label) in scores.iter().zip(labels.iter()) {
            let target = row[label as usize];
            let rank = row.iter().filter(|&&s| s > target).count();
            if rank < self.k {
                self.correct += 1;
            }
        }
        self.total += labels.len();
        Ok(())
    }

    pub fn value(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f64 / self.total as f64
        }
    }

    pub fn reset(&mut self) {
        self.correct = 0;
        self.total = 0;
    }
}

/// Per-batch root-mean-square error between a dense label and the
/// prediction, averaged over batches.
#[derive(Debug, Default)]
pub struct Rmse {
    sum: f64,
    batches: usize,
}

impl Rmse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, labels: &Tensor, predictions: &Tensor) -> Result<()> {
        let diff = (labels - predictions)?;
        let mse = diff.sqr()?.mean_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
        self.sum += (mse as f64).sqrt();
        self.batches += 1;
        Ok(())
    }

    pub fn value(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.sum / self.batches as f64
        }
    }

    pub fn reset(&mut self) {
        self.sum = 0.0;
        self.batches = 0;
    }
}

/// The training metric, selected once from the training mode.
#[derive(Debug)]
pub enum TrainMetric {
    Accuracy(Accuracy),
    Rmse(Rmse),
}

impl TrainMetric {
    pub fn accuracy() -> Self {
        TrainMetric::Accuracy(Accuracy::new())
    }

    pub fn rmse() -> Self {
        TrainMetric::Rmse(Rmse::new())
    }

    pub fn name(&self) -> &'static str {
        match self {
            TrainMetric::Accuracy(_) => "accuracy",
            TrainMetric::Rmse(_) => "rmse",
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            TrainMetric::Accuracy(m) => m.value(),
            TrainMetric::Rmse(m) => m.value(),
        }
    }

    pub fn reset(&mut self) {
        match self {
            TrainMetric::Accuracy(m) => m.reset(),
            TrainMetric::Rmse(m) => m.reset(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn outputs(rows: Vec<Vec<f32>>, device: &Device) -> Tensor {
        let cols = rows[0].len();
        let n = rows.len();
        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        Tensor::from_vec(flat, (n, cols), device).unwrap()
    }

    #[test]
    fn test_accuracy() -> Result<()> {
        let device = Device::Cpu;
        let mut acc = Accuracy::new();
        let out = outputs(
            vec![vec![0.9, 0.1, 0.0], vec![0.1, 0.2, 0.7], vec![0.3, 0.5, 0.2]],
            &device,
        );
        let labels = Tensor::from_vec(vec![0u32, 2, 0], 3, &device)?;
        acc.update(&labels, &out)?;
        assert!((acc.value() - 2.0 / 3.0).abs() < 1e-9);

        acc.reset();
        assert_eq!(acc.value(), 0.0);
        Ok(())
    }

    #[test]
    fn test_top_k() -> Result<()> {
        let device = Device::Cpu;
        let mut top2 = TopKAccuracy::new(2);
        let out = outputs(
            vec![vec![0.5, 0.3, 0.2], vec![0.5, 0.3, 0.2], vec![0.5, 0.3, 0.2]],
            &device,
        );
        // ranks: class0 -> 1st, class1 -> 2nd, class2 -> 3rd
        let labels = Tensor::from_vec(vec![0u32, 1, 2], 3, &device)?;
        top2.update(&labels, &out)?;
        assert!((top2.value() - 2.0 / 3.0).abs() < 1e-9);
        Ok(())
    }

    #[test]
    fn test_rmse_batch_average() -> Result<()> {
        let device = Device::Cpu;
        let mut rmse = Rmse::new();
        let label = Tensor::from_vec(vec![1.0f32, 0.0], (1, 2), &device)?;
        let pred = Tensor::from_vec(vec![0.0f32, 0.0], (1, 2), &device)?;
        rmse.update(&label, &pred)?;
        // mse = 0.5 -> rmse = sqrt(0.5)
        assert!((rmse.value() - 0.5f64.sqrt()).abs() < 1e-6);

        let exact = Tensor::from_vec(vec![1.0f32, 0.0], (1, 2), &device)?;
        rmse.update(&label, &exact)?;
        assert!((rmse.value() - 0.5f64.sqrt() / 2.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_reset_makes_updates_independent() -> Result<()> {
        let device = Device::Cpu;
        let mut acc = Accuracy::new();
        let out = outputs(vec![vec![0.9, 0.1], vec![0.2, 0.8]], &device);
        let labels = Tensor::from_vec(vec![0u32, 1], 2, &device)?;

        acc.update(&labels, &out)?;
        let first = acc.value();
        acc.reset();
        acc.update(&labels, &out)?;
        assert_eq!(first, acc.value());
        Ok(())
    }
}
