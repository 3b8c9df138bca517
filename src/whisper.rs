use crate::device::Device;
use crate::hub::{self, FileFilter, HubClient};
use crate::provision::Fetch;
use anyhow::{Context, Result};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// Files a CTranslate2 whisper conversion needs at load time
const MODEL_FILES: &[&str] = &[
    "config.json",
    "preprocessor_config.json",
    "model.bin",
    "tokenizer.json",
    "vocabulary.*",
];

const MODEL_BIN: &str = "model.bin";

/// Size aliases and the hub repos holding their CTranslate2 conversions
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("tiny.en", "Systran/faster-whisper-tiny.en"),
    ("tiny", "Systran/faster-whisper-tiny"),
    ("base.en", "Systran/faster-whisper-base.en"),
    ("base", "Systran/faster-whisper-base"),
    ("small.en", "Systran/faster-whisper-small.en"),
    ("small", "Systran/faster-whisper-small"),
    ("medium.en", "Systran/faster-whisper-medium.en"),
    ("medium", "Systran/faster-whisper-medium"),
    ("large-v1", "Systran/faster-whisper-large-v1"),
    ("large-v2", "Systran/faster-whisper-large-v2"),
    ("large-v3", "Systran/faster-whisper-large-v3"),
    ("large", "Systran/faster-whisper-large-v3"),
    ("distil-large-v2", "Systran/faster-distil-whisper-large-v2"),
    ("distil-medium.en", "Systran/faster-distil-whisper-medium.en"),
    ("distil-small.en", "Systran/faster-distil-whisper-small.en"),
    ("distil-large-v3", "Systran/faster-distil-whisper-large-v3"),
    ("large-v3-turbo", "mobiuslabsgmbh/faster-whisper-large-v3-turbo"),
    ("turbo", "mobiuslabsgmbh/faster-whisper-large-v3-turbo"),
];

/// Errors specific to resolving and validating a whisper model
#[derive(Debug, Error)]
pub enum WhisperError {
    /// Identifier is neither a known size, a repo id nor a local directory
    #[error("invalid model size '{name}', expected one of: {}", known_sizes().join(", "))]
    InvalidModelSize {
        /// Identifier as configured
        name: String,
    },

    /// The model directory lacks the converted weights
    #[error("no model.bin in whisper model directory {}", .dir.display())]
    MissingModelBin {
        /// Directory that was checked
        dir: PathBuf,
    },

    /// Compute type the target device can't run
    #[error("compute type {compute_type} is not supported on {device}")]
    UnsupportedComputeType {
        /// Requested device
        device: Device,
        /// Requested precision
        compute_type: ComputeType,
    },
}

/// Numeric precision the model runs at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeType {
    /// 8-bit integer quantization
    Int8,
    /// 8-bit weights, 16-bit float activations
    Int8Float16,
    /// Half precision
    Float16,
    /// Full precision
    Float32,
}

impl ComputeType {
    const fn name(self) -> &'static str {
        match self {
            Self::Int8 => "int8",
            Self::Int8Float16 => "int8_float16",
            Self::Float16 => "float16",
            Self::Float32 => "float32",
        }
    }

    /// Half-precision activations need GPU support
    const fn needs_half_precision(self) -> bool {
        matches!(self, Self::Float16 | Self::Int8Float16)
    }
}

impl fmt::Display for ComputeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where the model files come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Directory that already holds a converted model
    Local(PathBuf),
    /// Hub repository id
    Hub(String),
}

/// Resolve a configured identifier into a model source
///
/// # Errors
/// Returns [`WhisperError::InvalidModelSize`] for unknown bare names
pub fn resolve_model(identifier: &str) -> Result<ModelSource, WhisperError> {
    if let Some(dir) = hub::local_model_dir(identifier) {
        return Ok(ModelSource::Local(dir));
    }

    if let Some((_, repo)) = MODEL_ALIASES.iter().find(|(alias, _)| *alias == identifier) {
        return Ok(ModelSource::Hub((*repo).to_owned()));
    }

    if identifier.contains('/') {
        return Ok(ModelSource::Hub(identifier.to_owned()));
    }

    Err(WhisperError::InvalidModelSize {
        name: identifier.to_owned(),
    })
}

fn known_sizes() -> Vec<&'static str> {
    MODEL_ALIASES.iter().map(|(alias, _)| *alias).collect()
}

/// Reject device/precision pairs the runtime would refuse to load
///
/// # Errors
/// Returns [`WhisperError::UnsupportedComputeType`] for half precision on CPU
pub fn validate_options(device: Device, compute_type: ComputeType) -> Result<(), WhisperError> {
    match device {
        Device::Cpu if compute_type.needs_half_precision() => {
            Err(WhisperError::UnsupportedComputeType {
                device,
                compute_type,
            })
        }
        Device::Cpu => Ok(()),
    }
}

/// Caches a CTranslate2 whisper model into its download root
pub struct WhisperFetcher {
    model: String,
    hub: HubClient,
    device: Device,
    compute_type: ComputeType,
}

impl WhisperFetcher {
    /// Create a fetcher writing into `hub`'s cache directory
    pub const fn new(
        model: String,
        hub: HubClient,
        device: Device,
        compute_type: ComputeType,
    ) -> Self {
        Self {
            model,
            hub,
            device,
            compute_type,
        }
    }
}

impl Fetch for WhisperFetcher {
    fn fetch(&self) -> Result<Vec<PathBuf>> {
        validate_options(self.device, self.compute_type)?;

        tracing::info!(
            model = %self.model,
            device = %self.device,
            compute_type = %self.compute_type,
            download_root = %self.hub.cache_dir().display(),
            "resolving whisper model"
        );

        let repo_id = match resolve_model(&self.model)? {
            ModelSource::Local(dir) => {
                if !dir.join(MODEL_BIN).is_file() {
                    return Err(WhisperError::MissingModelBin { dir }.into());
                }
                tracing::info!(path = %dir.display(), "using local whisper model, skipping download");
                return Ok(vec![dir]);
            }
            ModelSource::Hub(repo_id) => repo_id,
        };

        fs::create_dir_all(self.hub.cache_dir()).with_context(|| {
            format!(
                "failed to create whisper model directory {}",
                self.hub.cache_dir().display()
            )
        })?;

        let listing = self.hub.listing(&repo_id)?;
        let snapshot = self.hub.fetch(&listing, &FileFilter::new(MODEL_FILES, &[])?)?;

        if !snapshot.contains(MODEL_BIN) {
            return Err(WhisperError::MissingModelBin { dir: snapshot.dir }.into());
        }

        tracing::info!(
            repo = %snapshot.repo_id,
            revision = %snapshot.revision,
            path = %snapshot.dir.display(),
            files = snapshot.files.len(),
            "whisper model cached"
        );

        Ok(vec![snapshot.dir])
    }
}
