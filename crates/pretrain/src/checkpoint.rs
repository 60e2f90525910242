use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::{safetensors::load as load_safetensors, Device};
use hex::encode as hex_encode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{
    config::PretrainConfig,
    model::Model,
    optimizer::{GradientScaler, GradientScalerState, OptimizerHandle, OptimizerState},
    scheduler::{AnnealingLr, SchedulerState},
    PretrainError,
};

pub const CHECKPOINT_VERSION: u32 = 1;
const DIR_PREFIX: &str = "iter_";
const MODEL_FILENAME: &str = "model.safetensors";
const OPTIMIZER_FILENAME: &str = "optimizer.json";
const SCHEDULER_FILENAME: &str = "scheduler.json";
const SCALER_FILENAME: &str = "scaler.json";
const MANIFEST_FILENAME: &str = "manifest.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub iteration: usize,
    pub config_sha256: String,
    pub model: FileRecord,
    /// Absent for runs without a local optimizer.
    pub optimizer: Option<FileRecord>,
    pub scheduler: Option<FileRecord>,
    pub scaler: FileRecord,
}

pub struct SaveRequest<'a> {
    pub base_dir: &'a Path,
    pub config: &'a PretrainConfig,
    pub model: &'a dyn Model,
    pub optimizer: &'a OptimizerHandle,
    pub scheduler: Option<&'a AnnealingLr>,
    pub scaler: &'a GradientScaler,
    pub iteration: usize,
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct CheckpointDescriptor {
    pub directory: PathBuf,
    pub manifest: CheckpointManifest,
}

pub struct LoadOutcome {
    pub manifest: CheckpointManifest,
    pub optimizer_state: Option<OptimizerState>,
    pub scheduler_state: Option<SchedulerState>,
    pub scaler_state: GradientScalerState,
    pub model_weights_path: PathBuf,
}

pub fn save_checkpoint(request: SaveRequest<'_>) -> Result<CheckpointDescriptor, PretrainError> {
    fs::create_dir_all(request.base_dir).map_err(|err| {
        PretrainError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            request.base_dir.display()
        ))
    })?;

    let checkpoint_dir = request
        .base_dir
        .join(format!("{}{:07}", DIR_PREFIX, request.iteration));
    if checkpoint_dir.exists() {
        fs::remove_dir_all(&checkpoint_dir).map_err(|err| {
            PretrainError::runtime(format!(
                "failed to replace checkpoint directory {}: {err}",
                checkpoint_dir.display()
            ))
        })?;
    }
    fs::create_dir(&checkpoint_dir).map_err(|err| {
        PretrainError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            checkpoint_dir.display()
        ))
    })?;

    let model_path = checkpoint_dir.join(MODEL_FILENAME);
    save_model_weights(request.model, &model_path)?;
    let model_record = file_record(&model_path)?;

    let optimizer_record = match request.optimizer.as_local() {
        Some(optimizer) => {
            let optimizer_path = checkpoint_dir.join(OPTIMIZER_FILENAME);
            write_json(&optimizer_path, &optimizer.state()?)?;
            Some(file_record(&optimizer_path)?)
        }
        None => None,
    };

    let scheduler_record = match request.scheduler {
        Some(scheduler) => {
            let scheduler_path = checkpoint_dir.join(SCHEDULER_FILENAME);
            write_json(&scheduler_path, &scheduler.snapshot())?;
            Some(file_record(&scheduler_path)?)
        }
        None => None,
    };

    let scaler_path = checkpoint_dir.join(SCALER_FILENAME);
    write_json(&scaler_path, &request.scaler.snapshot())?;
    let scaler_record = file_record(&scaler_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        iteration: request.iteration,
        config_sha256: fingerprint_config(request.config)?,
        model: model_record,
        optimizer: optimizer_record,
        scheduler: scheduler_record,
        scaler: scaler_record,
    };
    write_json(&checkpoint_dir.join(MANIFEST_FILENAME), &manifest)?;

    prune_checkpoints(request.base_dir, request.max_keep)?;

    Ok(CheckpointDescriptor {
        directory: checkpoint_dir,
        manifest,
    })
}

/// Highest-iteration checkpoint under the base directory, if any.
pub fn latest_checkpoint(base_dir: &Path) -> Result<Option<CheckpointDescriptor>, PretrainError> {
    let entries = checkpoint_directories(base_dir)?;
    let Some(path) = entries.into_iter().max() else {
        return Ok(None);
    };
    let manifest = load_manifest(&path)?;
    Ok(Some(CheckpointDescriptor {
        directory: path,
        manifest,
    }))
}

pub fn load_checkpoint(directory: &Path) -> Result<LoadOutcome, PretrainError> {
    let manifest = load_manifest(directory)?;
    if manifest.version != CHECKPOINT_VERSION {
        return Err(PretrainError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            manifest.version, CHECKPOINT_VERSION
        )));
    }

    let model_path = directory.join(&manifest.model.filename);
    validate_file(&model_path, &manifest.model.sha256)?;

    let optimizer_state = match manifest.optimizer.as_ref() {
        Some(record) => {
            let path = directory.join(&record.filename);
            validate_file(&path, &record.sha256)?;
            Some(read_json(&path)?)
        }
        None => None,
    };

    let scheduler_state = match manifest.scheduler.as_ref() {
        Some(record) => {
            let path = directory.join(&record.filename);
            validate_file(&path, &record.sha256)?;
            Some(read_json(&path)?)
        }
        None => None,
    };

    let scaler_path = directory.join(&manifest.scaler.filename);
    validate_file(&scaler_path, &manifest.scaler.sha256)?;
    let scaler_state: GradientScalerState = read_json(&scaler_path)?;

    Ok(LoadOutcome {
        manifest,
        optimizer_state,
        scheduler_state,
        scaler_state,
        model_weights_path: model_path,
    })
}

/// Writes checkpointed weights into the live model, casting dtypes
/// where they differ. Every model parameter must be present and every
/// stored tensor must be consumed.
pub fn apply_model_weights(
    model: &dyn Model,
    weights_path: &Path,
    device: &Device,
) -> Result<(), PretrainError> {
    let tensors = load_safetensors(weights_path, device).map_err(to_runtime_error)?;
    let mut by_name: HashMap<_, _> = tensors.into_iter().collect();

    for parameter in model.named_parameters() {
        let tensor = by_name.remove(&parameter.name).ok_or_else(|| {
            PretrainError::runtime(format!("checkpoint missing parameter {}", parameter.name))
        })?;
        let desired = parameter.var.as_tensor().dtype();
        let tensor = if tensor.dtype() == desired {
            tensor
        } else {
            tensor.to_dtype(desired).map_err(to_runtime_error)?
        };
        parameter.var.set(&tensor).map_err(to_runtime_error)?;
    }

    if !by_name.is_empty() {
        let extra = by_name.keys().cloned().collect::<Vec<_>>().join(", ");
        return Err(PretrainError::runtime(format!(
            "checkpoint contains unused parameters: {extra}"
        )));
    }
    Ok(())
}

fn save_model_weights(model: &dyn Model, path: &Path) -> Result<(), PretrainError> {
    let named_parameters = model.named_parameters();
    if named_parameters.is_empty() {
        return Err(PretrainError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let mut tensors = HashMap::with_capacity(named_parameters.len());
    for parameter in named_parameters {
        tensors.insert(parameter.name, parameter.var.as_tensor().clone());
    }
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        PretrainError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn fingerprint_config(config: &PretrainConfig) -> Result<String, PretrainError> {
    let json = serde_json::to_vec(config)
        .map_err(|err| PretrainError::runtime(format!("failed to hash config: {err}")))?;
    Ok(hex_encode(Sha256::digest(json)))
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, PretrainError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            PretrainError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            PretrainError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn checkpoint_directories(base: &Path) -> Result<Vec<PathBuf>, PretrainError> {
    let mut dirs = Vec::new();
    if !base.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(base).map_err(|err| {
        PretrainError::runtime(format!(
            "failed to read checkpoint directory {}: {err}",
            base.display()
        ))
    })? {
        let entry = entry.map_err(|err| {
            PretrainError::runtime(format!("failed to read checkpoint entry: {err}"))
        })?;
        let file_type = entry.file_type().map_err(|err| {
            PretrainError::runtime(format!(
                "failed to inspect checkpoint entry {}: {err}",
                entry.path().display()
            ))
        })?;
        if file_type.is_dir() && entry.file_name().to_string_lossy().starts_with(DIR_PREFIX) {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

fn load_manifest(directory: &Path) -> Result<CheckpointManifest, PretrainError> {
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(PretrainError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    read_json(&manifest_path)
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), PretrainError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(PretrainError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, PretrainError> {
    let mut file = File::open(path).map_err(|err| {
        PretrainError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            PretrainError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PretrainError> {
    let mut file = File::create(path).map_err(|err| {
        PretrainError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| PretrainError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        PretrainError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| PretrainError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, PretrainError> {
    let file = File::open(path).map_err(|err| {
        PretrainError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        PretrainError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

fn prune_checkpoints(base: &Path, max_keep: Option<usize>) -> Result<(), PretrainError> {
    let Some(limit) = max_keep else {
        return Ok(());
    };
    if limit == 0 {
        return Ok(());
    }
    let mut dirs = checkpoint_directories(base)?;
    dirs.sort();
    while dirs.len() > limit {
        let victim = dirs.remove(0);
        fs::remove_dir_all(&victim).map_err(|err| {
            PretrainError::runtime(format!(
                "failed to prune checkpoint {}: {err}",
                victim.display()
            ))
        })?;
    }
    Ok(())
}

fn to_runtime_error(err: candle_core::Error) -> PretrainError {
    PretrainError::runtime(err.to_string())
}
