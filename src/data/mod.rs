//! Dataset loading and batching.
//!
//! Two sources mirror the record-iterator / image-folder split of the
//! original pipeline: a single safetensors record file, or a directory
//! of safetensors shards. Both yield `(images, labels)` batches that
//! are split across the configured device list.

pub mod loader;

pub use loader::{split_batch, ArrayDataset, BatchLoader, LoaderOptions};
