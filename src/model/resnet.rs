use candle_core::Tensor;
use candle_nn::{batch_norm, conv2d, BatchNorm, Conv2d, Conv2dConfig, Module, ModuleT, VarBuilder};

use super::ImageClassifier;
use crate::utils::error::Result;

struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm,
    conv2: Conv2d,
    bn2: BatchNorm,
    downsample: Option<(Conv2d, BatchNorm)>,
}

impl BasicBlock {
    fn new(in_c: usize, out_c: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let cfg1 = Conv2dConfig {
            padding: 1,
            stride,
            ..Default::default()
        };
        let cfg2 = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let conv1 = conv2d(in_c, out_c, 3, cfg1, vb.pp("conv1"))?;
        let bn1 = batch_norm(out_c, 1e-5, vb.pp("bn1"))?;
        let conv2 = conv2d(out_c, out_c, 3, cfg2, vb.pp("conv2"))?;
        let bn2 = batch_norm(out_c, 1e-5, vb.pp("bn2"))?;

        let downsample = if stride != 1 || in_c != out_c {
            let cfg = Conv2dConfig {
                stride,
                ..Default::default()
            };
            let conv = conv2d(in_c, out_c, 1, cfg, vb.pp("down.conv"))?;
            let bn = batch_norm(out_c, 1e-5, vb.pp("down.bn"))?;
            Some((conv, bn))
        } else {
            None
        };

        Ok(Self {
            conv1,
            bn1,
            conv2,
            bn2,
            downsample,
        })
    }

    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let residual = match &self.downsample {
            Some((conv, bn)) => bn.forward_t(&conv.forward(xs)?, train)?,
            None => xs.clone(),
        };
        let out = self.bn1.forward_t(&self.conv1.forward(xs)?, train)?.relu()?;
        let out = self.bn2.forward_t(&self.conv2.forward(&out)?, train)?;
        Ok((out + residual)?.relu()?)
    }
}

/// Reduced residual network: a stem plus three stages of two basic
/// blocks each (16/32/64 channels), global average pooling and a
/// linear head.
pub struct TinyResNet {
    stem_conv: Conv2d,
    stem_bn: BatchNorm,
    stages: Vec<BasicBlock>,
    fc: candle_nn::Linear,
}

impl TinyResNet {
    pub fn new(classes: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        let stem_conv = conv2d(3, 16, 3, cfg, vb.pp("stem.conv"))?;
        let stem_bn = batch_norm(16, 1e-5, vb.pp("stem.bn"))?;

        let mut stages = Vec::new();
        let plan: [(usize, usize, usize); 6] = [
            (16, 16, 1),
            (16, 16, 1),
            (16, 32, 2),
            (32, 32, 1),
            (32, 64, 2),
            (64, 64, 1),
        ];
        for (i, (in_c, out_c, stride)) in plan.into_iter().enumerate() {
            stages.push(BasicBlock::new(
                in_c,
                out_c,
                stride,
                vb.pp(format!("layer{}", i)),
            )?);
        }

        let fc = candle_nn::linear(64, classes, vb.pp("fc"))?;
        Ok(Self {
            stem_conv,
            stem_bn,
            stages,
            fc,
        })
    }
}

impl ImageClassifier for TinyResNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = self
            .stem_bn
            .forward_t(&self.stem_conv.forward(xs)?, train)?
            .relu()?;
        for block in &self.stages {
            xs = block.forward_t(&xs, train)?;
        }
        let xs = xs.mean(3)?.mean(2)?;
        Ok(self.fc.forward(&xs)?)
    }
}
