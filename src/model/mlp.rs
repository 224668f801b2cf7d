use candle_core::Tensor;
use candle_nn::{linear, Linear, Module, VarBuilder};

use super::ImageClassifier;
use crate::utils::error::Result;

/// Flatten-and-project baseline, mostly useful for smoke tests and
/// pipeline debugging.
pub struct MlpNet {
    fc1: Linear,
    fc2: Linear,
}

impl MlpNet {
    pub fn new(classes: usize, input_size: usize, vb: VarBuilder) -> Result<Self> {
        let in_dim = 3 * input_size * input_size;
        let fc1 = linear(in_dim, 512, vb.pp("fc1"))?;
        let fc2 = linear(512, classes, vb.pp("fc2"))?;
        Ok(Self { fc1, fc2 })
    }
}

impl ImageClassifier for MlpNet {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Result<Tensor> {
        let xs = xs.flatten_from(1)?;
        let xs = self.fc1.forward(&xs)?.relu()?;
        Ok(self.fc2.forward(&xs)?)
    }
}
