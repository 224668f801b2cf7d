//! Distributed ImageNet classification training in Rust/Candle.
//!
//! The crate trains image classifiers with data-parallel gradient
//! push-pull, supporting mixup, label smoothing and knowledge
//! distillation. Collective communication is abstracted behind
//! [`distributed::CollectiveCommunicator`]; gradient compression is a
//! validated configuration handed to the distributed optimizer.

pub mod cli;
pub mod data;
pub mod distributed;
pub mod model;
pub mod training;
pub mod utils;

pub use utils::error::{Result, TrainError};
