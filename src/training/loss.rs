//! Loss selection and computation.
//!
//! Sparse-label cross-entropy applies only when neither smoothing nor
//! mixup produced a distribution; dense cross-entropy otherwise. With
//! a teacher configured the combined distillation loss is
//! `hard_weight * CE(student, label)
//!  + (1 - hard_weight) * T^2 * CE(student / T, softmax(teacher / T))`,
//! the T^2 scaling keeping gradient magnitude independent of the
//! temperature (Hinton et al.).

use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::utils::error::Result;

/// The label a loss is computed against: either integer class indices
/// or a dense distribution produced by the label transform.
#[derive(Debug, Clone)]
pub enum Target {
    Sparse(Tensor),
    Dense(Tensor),
}

impl Target {
    pub fn cross_entropy(&self, logits: &Tensor) -> Result<Tensor> {
        match self {
            Target::Sparse(labels) => sparse_cross_entropy(logits, labels),
            Target::Dense(target) => dense_cross_entropy(logits, target),
        }
    }
}

/// Cross-entropy on integer class labels, mean over the batch.
pub fn sparse_cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let log_probs = ops::log_softmax(logits, D::Minus1)?;
    let labels_u32 = labels.to_dtype(DType::U32)?;
    let picked = log_probs
        .gather(&labels_u32.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?;
    Ok(picked.neg()?.mean_all()?)
}

/// Cross-entropy against a dense target distribution, mean over the
/// batch.
pub fn dense_cross_entropy(logits: &Tensor, target: &Tensor) -> Result<Tensor> {
    let log_probs = ops::log_softmax(logits, D::Minus1)?;
    Ok((target * log_probs)?.sum(D::Minus1)?.neg()?.mean_all()?)
}

/// The teacher's softened output distribution, detached from the
/// autograd graph: `softmax(teacher_logits / T)`.
pub fn teacher_soft_targets(teacher_logits: &Tensor, temperature: f64) -> Result<Tensor> {
    let scaled = (teacher_logits / temperature)?;
    Ok(ops::softmax(&scaled, D::Minus1)?.detach())
}

/// Combined distillation loss over one device shard.
pub fn distillation_loss(
    student_logits: &Tensor,
    target: &Target,
    teacher_prob: &Tensor,
    temperature: f64,
    hard_weight: f64,
) -> Result<Tensor> {
    if hard_weight >= 1.0 {
        return target.cross_entropy(student_logits);
    }

    let scaled = (student_logits / temperature)?;
    let soft = (dense_cross_entropy(&scaled, teacher_prob)? * (temperature * temperature))?;

    if hard_weight <= 0.0 {
        return Ok(soft);
    }
    let hard = target.cross_entropy(student_logits)?;
    Ok(((hard * hard_weight)? + (soft * (1.0 - hard_weight))?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::training::transform::one_hot_smoothed;
    use candle_core::Device;

    fn logits_2x3(device: &Device) -> Tensor {
        Tensor::from_vec(vec![2.0f32, 0.5, -1.0, 0.0, 1.0, 3.0], (2, 3), device).unwrap()
    }

    #[test]
    fn test_sparse_matches_dense_one_hot() -> Result<()> {
        let device = Device::Cpu;
        let logits = logits_2x3(&device);
        let labels = Tensor::from_vec(vec![0u32, 2], 2, &device)?;

        let sparse = sparse_cross_entropy(&logits, &labels)?.to_scalar::<f32>()?;
        let one_hot = one_hot_smoothed(&labels, 3, 0.0)?;
        let dense = dense_cross_entropy(&logits, &one_hot)?.to_scalar::<f32>()?;

        assert!((sparse - dense).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn test_dense_cross_entropy_manual() -> Result<()> {
        let device = Device::Cpu;
        // Uniform target over two classes with symmetric logits gives
        // exactly ln(2).
        let logits = Tensor::from_vec(vec![0.0f32, 0.0], (1, 2), &device)?;
        let target = Tensor::from_vec(vec![0.5f32, 0.5], (1, 2), &device)?;
        let loss = dense_cross_entropy(&logits, &target)?.to_scalar::<f32>()?;
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_teacher_soft_targets_sum_to_one() -> Result<()> {
        let device = Device::Cpu;
        let teacher_logits = logits_2x3(&device);
        let probs = teacher_soft_targets(&teacher_logits, 20.0)?;
        let sums = probs.sum(D::Minus1)?.to_vec1::<f32>()?;
        for s in sums {
            assert!((s - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_distillation_weight_extremes() -> Result<()> {
        let device = Device::Cpu;
        let student = logits_2x3(&device);
        let labels = Tensor::from_vec(vec![1u32, 2], 2, &device)?;
        let target = Target::Sparse(labels.clone());
        let teacher_prob = teacher_soft_targets(&logits_2x3(&device), 4.0)?;

        let hard_only =
            distillation_loss(&student, &target, &teacher_prob, 4.0, 1.0)?.to_scalar::<f32>()?;
        let plain = sparse_cross_entropy(&student, &labels)?.to_scalar::<f32>()?;
        assert!((hard_only - plain).abs() < 1e-6);

        let soft_only =
            distillation_loss(&student, &target, &teacher_prob, 4.0, 0.0)?.to_scalar::<f32>()?;
        let blended =
            distillation_loss(&student, &target, &teacher_prob, 4.0, 0.5)?.to_scalar::<f32>()?;
        let expect = 0.5 * plain + 0.5 * soft_only;
        assert!((blended - expect).abs() < 1e-5);
        Ok(())
    }
}
