//! Checkpoint I/O with SHA256 checksum validation.
//!
//! Each save point produces two artifacts: a weights file (`.params`)
//! and an optimizer-state file (`.states`), both safetensors payloads
//! with a companion `.meta.json` carrying the checksum and epoch
//! metadata. Writes are synchronous and non-atomic; the checksum
//! detects (but does not prevent) a torn write at load time.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{safetensors, Device, Tensor};
use candle_nn::VarMap;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::utils::error::{Result, TrainError};

/// Metadata stored alongside each checkpoint artifact.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMeta {
    /// SHA256 checksum of the tensor payload.
    pub checksum: String,
    /// Epoch at which the artifact was written.
    pub epoch: Option<u64>,
    /// Validation top-1 error for `-best` artifacts.
    pub best_error: Option<f64>,
}

/// Checksum over tensor metadata and (sampled) tensor data.
///
/// Large tensors contribute their first and last 1024 bytes, which is
/// enough to catch truncation and header corruption without hashing
/// multi-gigabyte payloads.
pub fn tensor_checksum(tensors: &HashMap<String, Tensor>) -> Result<String> {
    let mut hasher = Sha256::new();

    let mut keys: Vec<&String> = tensors.keys().collect();
    keys.sort();

    for key in keys {
        let tensor = &tensors[key];
        let meta = format!("{}:{:?}:{:?}", key, tensor.dtype(), tensor.dims());
        hasher.update(meta.as_bytes());

        let flat = tensor.flatten_all()?.to_dtype(candle_core::DType::F32)?;
        let data = flat.to_vec1::<f32>()?;
        let bytes: Vec<u8> = data.iter().flat_map(|f| f.to_le_bytes()).collect();
        if bytes.len() > 2048 {
            hasher.update(&bytes[..1024]);
            hasher.update(&bytes[bytes.len() - 1024..]);
        } else {
            hasher.update(&bytes);
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Save a tensor map with its checksum sidecar.
pub fn save_tensors<P: AsRef<Path>>(
    tensors: &HashMap<String, Tensor>,
    path: P,
    epoch: Option<u64>,
    best_error: Option<f64>,
) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let checksum = tensor_checksum(tensors)?;
    safetensors::save(tensors, path)?;

    let meta = CheckpointMeta {
        checksum: checksum.clone(),
        epoch,
        best_error,
    };
    let meta_json = serde_json::to_string_pretty(&meta)
        .map_err(|e| TrainError::Checkpoint(format!("failed to serialize metadata: {}", e)))?;
    fs::write(meta_path(path), meta_json)?;

    info!(checkpoint = %path.display(), checksum = %checksum, epoch = ?epoch, "checkpoint saved");
    Ok(())
}

/// Load a tensor map, verifying the checksum when a sidecar exists.
pub fn load_tensors<P: AsRef<Path>>(
    path: P,
    device: &Device,
) -> Result<(HashMap<String, Tensor>, Option<CheckpointMeta>)> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(TrainError::Checkpoint(format!(
            "checkpoint not found: {}",
            path.display()
        )));
    }

    let tensors = safetensors::load(path, device)?;

    let meta_file = meta_path(path);
    let meta = if meta_file.exists() {
        let meta_json = fs::read_to_string(&meta_file)?;
        let meta: CheckpointMeta = serde_json::from_str(&meta_json)
            .map_err(|e| TrainError::Checkpoint(format!("failed to parse metadata: {}", e)))?;

        let current = tensor_checksum(&tensors)?;
        if current != meta.checksum {
            return Err(TrainError::Checkpoint(format!(
                "checksum mismatch for {} (expected {}, got {})",
                path.display(),
                meta.checksum,
                current
            )));
        }
        Some(meta)
    } else {
        warn!(checkpoint = %path.display(), "no metadata sidecar, skipping checksum verification");
        None
    };

    Ok((tensors, meta))
}

/// Persist all model parameters from a var map.
pub fn save_parameters<P: AsRef<Path>>(
    varmap: &VarMap,
    path: P,
    epoch: Option<u64>,
    best_error: Option<f64>,
) -> Result<()> {
    let tensors: HashMap<String, Tensor> = varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect();
    save_tensors(&tensors, path, epoch, best_error)
}

/// Restore model parameters into an existing var map. The model must
/// already be built so shapes can be checked against the payload.
pub fn load_parameters<P: AsRef<Path>>(varmap: &mut VarMap, path: P) -> Result<()> {
    let path = path.as_ref();
    // Verify the payload before touching live parameters.
    let _ = load_tensors(path, &Device::Cpu)?;
    varmap.load(path)?;
    info!(checkpoint = %path.display(), "parameters restored");
    Ok(())
}

fn meta_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".meta.json");
    path.with_file_name(name)
}

/// File stem for a best-so-far checkpoint:
/// `{err:.4}-imagenet-{model}-{epoch}-best`.
pub fn best_stem(err_top1: f64, model: &str, epoch: usize) -> String {
    format!("{:.4}-imagenet-{}-{}-best", err_top1, model, epoch)
}

/// File stem for a periodic checkpoint: `imagenet-{model}-{epoch}`.
pub fn periodic_stem(model: &str, epoch: usize) -> String {
    format!("imagenet-{}-{}", model, epoch)
}

pub fn params_path(save_dir: &Path, stem: &str) -> PathBuf {
    save_dir.join(format!("{}.params", stem))
}

pub fn states_path(save_dir: &Path, stem: &str) -> PathBuf {
    save_dir.join(format!("{}.states", stem))
}
