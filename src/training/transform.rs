//! Label and input transforms for the training step.
//!
//! Covers one-hot smoothing and mixup blending. A mixup batch draws a
//! single lambda from Beta(alpha, alpha); the same [`MixupDecision`]
//! value is threaded through both the input blend and the label blend
//! so the two can never disagree on the draw.

use candle_core::Tensor;
use rand::Rng;
use rand_distr::{Beta, Distribution};

use crate::utils::error::{Result, TrainError};

/// The per-batch mixup draw. Created fresh for every batch and
/// discarded after use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixupDecision {
    pub lambda: f64,
}

impl MixupDecision {
    /// Sample lambda ~ Beta(alpha, alpha) for one batch. Within the
    /// final `off_epoch` epochs of training lambda is forced to 1,
    /// which disables mixing while the label path still pays the
    /// smoothing cost.
    pub fn sample<R: Rng>(
        rng: &mut R,
        alpha: f64,
        epoch: usize,
        num_epochs: usize,
        off_epoch: usize,
    ) -> Result<Self> {
        if epoch >= num_epochs.saturating_sub(off_epoch) {
            return Ok(Self { lambda: 1.0 });
        }
        let beta = Beta::new(alpha, alpha)
            .map_err(|e| TrainError::Training(format!("invalid mixup alpha {}: {}", alpha, e)))?;
        Ok(Self {
            lambda: beta.sample(rng),
        })
    }

    /// A decision that leaves inputs and labels unmixed.
    pub fn disabled() -> Self {
        Self { lambda: 1.0 }
    }
}

/// Reverse a tensor along the batch axis, pairing sample `i` with
/// sample `n - 1 - i`. Involutive.
pub fn reverse_batch(t: &Tensor) -> Result<Tensor> {
    let n = t.dim(0)?;
    let idx: Vec<u32> = (0..n as u32).rev().collect();
    let idx = Tensor::from_vec(idx, n, t.device())?;
    Ok(t.index_select(&idx, 0)?)
}

/// Encode integer class labels as a dense distribution with value
/// `1 - eta + eta/C` at the true class and `eta/C` elsewhere. With
/// `eta == 0` this is exactly one-hot.
pub fn one_hot_smoothed(labels: &Tensor, classes: usize, eta: f32) -> Result<Tensor> {
    let labels = labels.to_dtype(candle_core::DType::U32)?;
    let idx = labels.to_vec1::<u32>()?;
    let n = idx.len();

    let off = eta / classes as f32;
    let on = 1.0 - eta + off;

    let mut buf = vec![off; n * classes];
    for (i, &c) in idx.iter().enumerate() {
        if c as usize >= classes {
            return Err(TrainError::Data(format!(
                "label {} out of range for {} classes",
                c, classes
            )));
        }
        buf[i * classes + c as usize] = on;
    }

    Ok(Tensor::from_vec(buf, (n, classes), labels.device())?)
}

/// Blend a batch of inputs with its sample-reversed version:
/// `lambda * x + (1 - lambda) * reverse(x)`.
pub fn mixup_inputs(decision: MixupDecision, x: &Tensor) -> Result<Tensor> {
    if decision.lambda >= 1.0 {
        return Ok(x.clone());
    }
    let rev = reverse_batch(x)?;
    Ok(((x * decision.lambda)? + (rev * (1.0 - decision.lambda))?)?)
}

/// Blend smoothed label distributions with the same lambda used for
/// the inputs: `lambda * y1 + (1 - lambda) * y2` where `y2` encodes
/// the labels in reversed sample order.
pub fn mixup_labels(
    decision: MixupDecision,
    labels: &Tensor,
    classes: usize,
    eta: f32,
) -> Result<Tensor> {
    let y1 = one_hot_smoothed(labels, classes, eta)?;
    if decision.lambda >= 1.0 {
        return Ok(y1);
    }
    let y2 = one_hot_smoothed(&reverse_batch(labels)?, classes, eta)?;
    Ok(((y1 * decision.lambda)? + (y2 * (1.0 - decision.lambda))?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn labels(vals: &[u32]) -> Tensor {
        Tensor::from_vec(vals.to_vec(), vals.len(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_zero_eta_is_one_hot() -> Result<()> {
        let l = labels(&[1, 0, 2]);
        let y = one_hot_smoothed(&l, 3, 0.0)?;
        let rows = y.to_vec2::<f32>()?;
        assert_eq!(rows[0], vec![0.0, 1.0, 0.0]);
        assert_eq!(rows[1], vec![1.0, 0.0, 0.0]);
        assert_eq!(rows[2], vec![0.0, 0.0, 1.0]);
        Ok(())
    }

    #[test]
    fn test_smoothing_values() -> Result<()> {
        // batch=2, C=3, labels=[0,2], eta=0.1
        let l = labels(&[0, 2]);
        let y = one_hot_smoothed(&l, 3, 0.1)?;
        let rows = y.to_vec2::<f32>()?;
        let expect0 = [0.9333f32, 0.0333, 0.0333];
        let expect1 = [0.0333f32, 0.0333, 0.9333];
        for (a, b) in rows[0].iter().zip(expect0.iter()) {
            assert!((a - b).abs() < 1e-3, "got {:?}", rows[0]);
        }
        for (a, b) in rows[1].iter().zip(expect1.iter()) {
            assert!((a - b).abs() < 1e-3, "got {:?}", rows[1]);
        }
        Ok(())
    }

    #[test]
    fn test_label_out_of_range_rejected() {
        let l = labels(&[5]);
        assert!(one_hot_smoothed(&l, 3, 0.0).is_err());
    }

    #[test]
    fn test_reverse_is_involutive() -> Result<()> {
        let x = Tensor::from_vec(
            (0..12).map(|v| v as f32).collect::<Vec<_>>(),
            (4, 3),
            &Device::Cpu,
        )?;
        let twice = reverse_batch(&reverse_batch(&x)?)?;
        assert_eq!(x.to_vec2::<f32>()?, twice.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_mixup_blend() -> Result<()> {
        // lambda=0.7 on labels [0,1], C=3, eta=0
        let decision = MixupDecision { lambda: 0.7 };
        let l = labels(&[0, 1]);
        let y = mixup_labels(decision, &l, 3, 0.0)?;
        let rows = y.to_vec2::<f32>()?;
        let expect0 = [0.7f32, 0.3, 0.0];
        for (a, b) in rows[0].iter().zip(expect0.iter()) {
            assert!((a - b).abs() < 1e-6, "got {:?}", rows[0]);
        }
        let expect1 = [0.3f32, 0.7, 0.0];
        for (a, b) in rows[1].iter().zip(expect1.iter()) {
            assert!((a - b).abs() < 1e-6, "got {:?}", rows[1]);
        }
        Ok(())
    }

    #[test]
    fn test_lambda_one_is_identity() -> Result<()> {
        let decision = MixupDecision { lambda: 1.0 };

        let x = Tensor::randn(0f32, 1f32, (4, 3, 8, 8), &Device::Cpu)?;
        let mixed = mixup_inputs(decision, &x)?;
        assert_eq!(
            x.flatten_all()?.to_vec1::<f32>()?,
            mixed.flatten_all()?.to_vec1::<f32>()?
        );

        let l = labels(&[0, 2, 1]);
        let y = mixup_labels(decision, &l, 3, 0.1)?;
        let base = one_hot_smoothed(&l, 3, 0.1)?;
        assert_eq!(y.to_vec2::<f32>()?, base.to_vec2::<f32>()?);
        Ok(())
    }

    #[test]
    fn test_inputs_and_labels_share_lambda() -> Result<()> {
        let decision = MixupDecision { lambda: 0.25 };
        let x = Tensor::from_vec(vec![1.0f32, 3.0], (2, 1), &Device::Cpu)?;
        let mixed = mixup_inputs(decision, &x)?;
        let vals = mixed.to_vec2::<f32>()?;
        // 0.25*1 + 0.75*3 and 0.25*3 + 0.75*1
        assert!((vals[0][0] - 2.5).abs() < 1e-6);
        assert!((vals[1][0] - 1.5).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_off_epoch_forces_lambda_one() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        // 120 epochs with a 20-epoch mixup-off tail.
        let d = MixupDecision::sample(&mut rng, 0.2, 100, 120, 20)?;
        assert_eq!(d.lambda, 1.0);
        let d = MixupDecision::sample(&mut rng, 0.2, 99, 120, 20)?;
        assert!((0.0..=1.0).contains(&d.lambda));
        Ok(())
    }
}
