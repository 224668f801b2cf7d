//! Model factory.
//!
//! Maps a model name to a forward-capable classifier. The same
//! factory builds the student and, for distillation, the teacher
//! model (whose pretrained weights are then loaded on top).

use candle_core::Tensor;
use candle_nn::VarBuilder;

use crate::utils::error::{Result, TrainError};

mod cnn;
mod mlp;
mod resnet;

pub use cnn::SmallCnn;
pub use mlp::MlpNet;
pub use resnet::TinyResNet;

/// A classifier producing per-class logits of shape
/// `(batch, classes)`. `train` toggles batch-norm statistics.
pub trait ImageClassifier {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor>;
}

/// Build a model by name. Unknown names are configuration errors.
pub fn build_model(
    name: &str,
    classes: usize,
    input_size: usize,
    vb: VarBuilder,
) -> Result<Box<dyn ImageClassifier>> {
    match name {
        "mlp" => Ok(Box::new(MlpNet::new(classes, input_size, vb)?)),
        "cnn-small" => Ok(Box::new(SmallCnn::new(classes, vb)?)),
        "resnet-tiny" => Ok(Box::new(TinyResNet::new(classes, vb)?)),
        other => Err(TrainError::Config(format!(
            "unknown model '{}', expected one of mlp, cnn-small, resnet-tiny",
            other
        ))),
    }
}
