use candle_core::Tensor;
use candle_nn::{batch_norm, conv2d, BatchNorm, Conv2d, Conv2dConfig, Module, ModuleT, VarBuilder};

use super::ImageClassifier;
use crate::utils::error::Result;

/// Three-stage convolutional baseline with batch norm.
pub struct SmallCnn {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    conv3: Conv2d,
    bn3: BatchNorm,
    fc: candle_nn::Linear,
}

impl SmallCnn {
    pub fn new(classes: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = conv2d(3, 32, 3, cfg, vb.pp("conv1"))?;
        let bn1 = batch_norm(32, 1e-5, vb.pp("bn1"))?;
        let conv2 = conv2d(32, 64, 3, cfg, vb.pp("conv2"))?;
        let bn2 = batch_norm(64, 1e-5, vb.pp("bn2"))?;
        let conv3 = conv2d(64, 128, 3, cfg, vb.pp("conv3"))?;
        let bn3 = batch_norm(128, 1e-5, vb.pp("bn3"))?;
        let fc = candle_nn::linear(128, classes, vb.pp("fc"))?;
        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            conv3,
            bn3,
            fc,
        })
    }
}

impl ImageClassifier for SmallCnn {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv1.forward(xs)?;
        let xs = self.bn1.forward_t(&xs, train)?.relu()?.max_pool2d(2)?;
        let xs = self.conv2.forward(&xs)?;
        let xs = self.bn2.forward_t(&xs, train)?.relu()?.max_pool2d(2)?;
        let xs = self.conv3.forward(&xs)?;
        let xs = self.bn3.forward_t(&xs, train)?.relu()?;
        // Global average pool over the spatial dims.
        let xs = xs.mean(3)?.mean(2)?;
        Ok(self.fc.forward(&xs)?)
    }
}
