use std::path::Path;

use candle_core::{safetensors, DType, Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::utils::error::{Result, TrainError};

/// An in-memory classification dataset: `images` of shape
/// `(N, C, H, W)` and integer `labels` of shape `(N,)`, both on the
/// CPU until batches are dispatched to devices.
pub struct ArrayDataset {
    images: Tensor,
    labels: Tensor,
}

impl ArrayDataset {
    pub fn new(images: Tensor, labels: Tensor) -> Result<Self> {
        let n = images.dim(0)?;
        if labels.dim(0)? != n {
            return Err(TrainError::Data(format!(
                "{} images but {} labels",
                n,
                labels.dim(0)?
            )));
        }
        let labels = labels.to_dtype(DType::U32)?;
        Ok(Self { images, labels })
    }

    /// Load from a single record file holding `images` and `labels`
    /// tensors.
    pub fn from_record<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tensors = safetensors::load(path, &Device::Cpu)?;
        let images = tensors
            .get("images")
            .ok_or_else(|| {
                TrainError::Data(format!("record {} has no 'images' tensor", path.display()))
            })?
            .clone();
        let labels = tensors
            .get("labels")
            .ok_or_else(|| {
                TrainError::Data(format!("record {} has no 'labels' tensor", path.display()))
            })?
            .clone();
        info!(record = %path.display(), samples = images.dim(0)?, "record file loaded");
        Self::new(images, labels)
    }

    /// Load from a directory of record shards, concatenated in file
    /// name order.
    pub fn from_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        let mut shards: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |e| e == "safetensors"))
            .collect();
        shards.sort();
        if shards.is_empty() {
            return Err(TrainError::Data(format!(
                "no .safetensors shards under {}",
                dir.display()
            )));
        }

        let mut images = Vec::with_capacity(shards.len());
        let mut labels = Vec::with_capacity(shards.len());
        for shard in &shards {
            let part = Self::from_record(shard)?;
            images.push(part.images);
            labels.push(part.labels);
        }
        let images = Tensor::cat(&images, 0)?;
        let labels = Tensor::cat(&labels, 0)?;
        info!(dir = %dir.display(), shards = shards.len(), samples = images.dim(0)?, "shard directory loaded");
        Self::new(images, labels)
    }

    /// Deterministic synthetic dataset, used by tests and smoke runs.
    pub fn synthetic(
        samples: usize,
        classes: usize,
        input_size: usize,
        seed: u64,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        let numel = samples * 3 * input_size * input_size;
        let pixels: Vec<f32> = (0..numel).map(|_| rng.gen_range(-1.0f32..1.0f32)).collect();
        let images = Tensor::from_vec(
            pixels,
            (samples, 3, input_size, input_size),
            &Device::Cpu,
        )?;
        let labels: Vec<u32> = (0..samples)
            .map(|_| rng.gen_range(0..classes as u32))
            .collect();
        let labels = Tensor::from_vec(labels, samples, &Device::Cpu)?;
        Self::new(images, labels)
    }

    pub fn len(&self) -> usize {
        self.images.dim(0).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Batching options. `num_parts` / `part_index` shard the dataset
/// across workers so each sees only its slice.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub batch_size: usize,
    pub shuffle: bool,
    /// Drop a trailing partial batch (training); keep it (validation).
    pub discard_last: bool,
    pub num_parts: usize,
    pub part_index: usize,
    pub seed: u64,
}

impl LoaderOptions {
    pub fn train(batch_size: usize, num_parts: usize, part_index: usize) -> Self {
        Self {
            batch_size,
            shuffle: true,
            discard_last: true,
            num_parts,
            part_index,
            seed: 0,
        }
    }

    pub fn val(batch_size: usize, num_parts: usize, part_index: usize) -> Self {
        Self {
            batch_size,
            shuffle: false,
            discard_last: false,
            num_parts,
            part_index,
            seed: 0,
        }
    }
}

/// Iterates a dataset in fixed-size batches. `reset` must be called at
/// each epoch boundary; it reshuffles the worker's shard with a seed
/// derived from the epoch so all data-parallel workers stay distinct
/// but reproducible.
pub struct BatchLoader {
    dataset: ArrayDataset,
    opts: LoaderOptions,
    order: Vec<u32>,
    cursor: usize,
    epoch: u64,
}

impl BatchLoader {
    pub fn new(dataset: ArrayDataset, opts: LoaderOptions) -> Result<Self> {
        if opts.batch_size == 0 {
            return Err(TrainError::Data("batch size must be nonzero".to_string()));
        }
        if opts.num_parts == 0 || opts.part_index >= opts.num_parts {
            return Err(TrainError::Data(format!(
                "invalid shard {}/{}",
                opts.part_index, opts.num_parts
            )));
        }
        let mut loader = Self {
            dataset,
            opts,
            order: Vec::new(),
            cursor: 0,
            epoch: 0,
        };
        loader.rebuild_order();
        Ok(loader)
    }

    fn rebuild_order(&mut self) {
        let n = self.dataset.len();
        self.order = (self.opts.part_index..n)
            .step_by(self.opts.num_parts)
            .map(|i| i as u32)
            .collect();
        if self.opts.shuffle {
            let mut rng = StdRng::seed_from_u64(self.opts.seed.wrapping_add(self.epoch));
            self.order.shuffle(&mut rng);
        }
        self.cursor = 0;
    }

    /// Rewind for the next epoch.
    pub fn reset(&mut self) {
        self.epoch += 1;
        self.rebuild_order();
    }

    /// Number of batches one pass yields.
    pub fn num_batches(&self) -> usize {
        let n = self.order.len();
        if self.opts.discard_last {
            n / self.opts.batch_size
        } else {
            n.div_ceil(self.opts.batch_size)
        }
    }

    /// Number of samples in this worker's shard.
    pub fn shard_len(&self) -> usize {
        self.order.len()
    }

    pub fn next_batch(&mut self) -> Result<Option<(Tensor, Tensor)>> {
        let remaining = self.order.len() - self.cursor;
        if remaining == 0 || (self.opts.discard_last && remaining < self.opts.batch_size) {
            return Ok(None);
        }

        let take = remaining.min(self.opts.batch_size);
        let idx = &self.order[self.cursor..self.cursor + take];
        self.cursor += take;

        let idx = Tensor::from_vec(idx.to_vec(), take, &Device::Cpu)?;
        let images = self.dataset.images.index_select(&idx, 0)?;
        let labels = self.dataset.labels.index_select(&idx, 0)?;
        Ok(Some((images, labels)))
    }
}

/// Split a batch across devices along the batch axis, the
/// `split_and_load` counterpart. Devices beyond the sample count get
/// no shard.
pub fn split_batch(
    data: &Tensor,
    label: &Tensor,
    devices: &[Device],
) -> Result<Vec<(Tensor, Tensor)>> {
    if devices.is_empty() {
        return Err(TrainError::Data("no devices to split across".to_string()));
    }
    let n = data.dim(0)?;
    let chunk = n.div_ceil(devices.len());
    let mut shards = Vec::with_capacity(devices.len());
    let mut start = 0;
    for device in devices {
        if start >= n {
            break;
        }
        let len = chunk.min(n - start);
        let d = data.narrow(0, start, len)?.to_device(device)?;
        let l = label.narrow(0, start, len)?.to_device(device)?;
        shards.push((d, l));
        start += len;
    }
    Ok(shards)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_dataset(n: usize) -> ArrayDataset {
        ArrayDataset::synthetic(n, 4, 4, 42).unwrap()
    }

    #[test]
    fn test_discard_last_batch() -> Result<()> {
        let mut loader = BatchLoader::new(tiny_dataset(10), LoaderOptions::train(4, 1, 0))?;
        assert_eq!(loader.num_batches(), 2);
        let mut seen = 0;
        while let Some((data, label)) = loader.next_batch()? {
            assert_eq!(data.dim(0)?, 4);
            assert_eq!(label.dim(0)?, 4);
            seen += 1;
        }
        assert_eq!(seen, 2);
        Ok(())
    }

    #[test]
    fn test_validation_keeps_tail() -> Result<()> {
        let mut loader = BatchLoader::new(tiny_dataset(10), LoaderOptions::val(4, 1, 0))?;
        assert_eq!(loader.num_batches(), 3);
        let mut sizes = Vec::new();
        while let Some((data, _)) = loader.next_batch()? {
            sizes.push(data.dim(0)?);
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        Ok(())
    }

    #[test]
    fn test_worker_shards_are_disjoint() -> Result<()> {
        let mut covered = std::collections::HashSet::new();
        for part in 0..3 {
            let mut opts = LoaderOptions::val(2, 3, part);
            opts.shuffle = false;
            let mut loader = BatchLoader::new(tiny_dataset(9), opts)?;
            assert_eq!(loader.shard_len(), 3);
            while let Some((_, labels)) = loader.next_batch()? {
                let _ = labels;
            }
            for idx in &loader.order {
                assert!(covered.insert(*idx));
            }
        }
        assert_eq!(covered.len(), 9);
        Ok(())
    }

    #[test]
    fn test_reset_reshuffles_but_covers_all() -> Result<()> {
        let mut loader = BatchLoader::new(tiny_dataset(8), LoaderOptions::train(2, 1, 0))?;
        let first: Vec<u32> = loader.order.clone();
        loader.reset();
        let second: Vec<u32> = loader.order.clone();
        let mut a = first.clone();
        let mut b = second.clone();
        a.sort();
        b.sort();
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn test_split_batch_shards() -> Result<()> {
        let data = Tensor::zeros((10, 3, 4, 4), DType::F32, &Device::Cpu)?;
        let label = Tensor::zeros(10, DType::U32, &Device::Cpu)?;
        let devices = vec![Device::Cpu, Device::Cpu, Device::Cpu];
        let shards = split_batch(&data, &label, &devices)?;
        let sizes: Vec<usize> = shards.iter().map(|(d, _)| d.dim(0).unwrap()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        Ok(())
    }

    #[test]
    fn test_record_roundtrip() -> Result<()> {
        use std::collections::HashMap;
        use tempfile::tempdir;

        let dir = tempdir().unwrap();
        let path = dir.path().join("val.safetensors");

        let ds = tiny_dataset(6);
        let mut tensors = HashMap::new();
        tensors.insert("images".to_string(), ds.images.clone());
        tensors.insert("labels".to_string(), ds.labels.clone());
        safetensors::save(&tensors, &path).map_err(TrainError::from)?;

        let loaded = ArrayDataset::from_record(&path)?;
        assert_eq!(loaded.len(), 6);
        Ok(())
    }
}
