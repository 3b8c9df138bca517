use std::path::PathBuf;
use thiserror::Error;

/// Identifier of the sentence-embedding model to cache
pub const EMBEDDING_MODEL_VAR: &str = "RAG_EMBEDDING_MODEL";
/// Identifier of the whisper model to cache
pub const WHISPER_MODEL_VAR: &str = "WHISPER_MODEL";
/// Directory the whisper model is downloaded into
pub const WHISPER_MODEL_DIR_VAR: &str = "WHISPER_MODEL_DIR";
/// Name of the tiktoken encoding to cache
pub const TIKTOKEN_ENCODING_VAR: &str = "TIKTOKEN_ENCODING_NAME";

const LOG_FILE_VAR: &str = "FETCH_MODELS_LOG_FILE";

/// Errors raised while reading configuration from the environment
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required variable is absent
    #[error("environment variable {0} is not set")]
    Missing(&'static str),

    /// A required variable is present but blank
    #[error("environment variable {0} is not set (empty value)")]
    Empty(&'static str),
}

/// Everything the provisioner needs, resolved once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Step 1 model
    pub embedding: EmbeddingConfig,
    /// Step 2 model
    pub whisper: WhisperConfig,
    /// Step 3 encoding
    pub tiktoken: TiktokenConfig,
    /// Hub access shared by steps 1 and 2
    pub hub: HubConfig,
    /// Log output
    pub telemetry: TelemetryConfig,
}

/// Sentence-embedding model settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingConfig {
    /// Hub repo id, bare sentence-transformers name or local directory
    pub model: String,
    /// Hub cache the model snapshot is stored in
    pub cache_dir: PathBuf,
}

/// Whisper model settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhisperConfig {
    /// Size alias, hub repo id or local directory
    pub model: String,
    /// Hub cache root for the whisper model
    pub download_root: PathBuf,
}

/// Tokenizer encoding settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TiktokenConfig {
    /// Encoding name, e.g. `cl100k_base`
    pub encoding: String,
    /// `None` when caching is disabled with an empty `TIKTOKEN_CACHE_DIR`
    pub cache_dir: Option<PathBuf>,
}

/// Credentials and endpoint for the Hugging Face hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// `HF_TOKEN`; when unset the token saved by `huggingface-cli login` is used
    pub token: Option<String>,
    /// `HF_ENDPOINT` mirror replacing `https://huggingface.co`
    pub endpoint: Option<String>,
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Append logs to this file instead of stderr
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load config from the process environment
    ///
    /// # Errors
    /// Returns [`ConfigError`] if a required variable is missing or empty
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load config through an arbitrary variable lookup
    ///
    /// Required variables are all checked before anything else is resolved,
    /// so a misconfigured run fails without touching the network.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if a required variable is missing or empty
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let embedding_model = required(&lookup, EMBEDDING_MODEL_VAR)?;
        let whisper_model = required(&lookup, WHISPER_MODEL_VAR)?;
        let whisper_dir = required(&lookup, WHISPER_MODEL_DIR_VAR)?;
        let encoding = required(&lookup, TIKTOKEN_ENCODING_VAR)?;

        let home = lookup("HOME")
            .filter(|home| !home.is_empty())
            .map(PathBuf::from)
            .or_else(dirs::home_dir);

        Ok(Self {
            embedding: EmbeddingConfig {
                model: embedding_model,
                cache_dir: embedding_cache_dir(&lookup, home.as_ref()),
            },
            whisper: WhisperConfig {
                model: whisper_model,
                download_root: expand_path(&whisper_dir, home.as_ref()),
            },
            tiktoken: TiktokenConfig {
                encoding,
                cache_dir: tiktoken_cache_dir(&lookup, home.as_ref()),
            },
            hub: HubConfig {
                token: non_empty(&lookup, "HF_TOKEN"),
                endpoint: non_empty(&lookup, "HF_ENDPOINT")
                    .map(|endpoint| endpoint.trim_end_matches('/').to_owned()),
            },
            telemetry: TelemetryConfig {
                log_file: non_empty(&lookup, LOG_FILE_VAR)
                    .map(|path| expand_path(&path, home.as_ref())),
            },
        })
    }
}

fn required<F>(lookup: &F, name: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = lookup(name).ok_or(ConfigError::Missing(name))?;
    if value.trim().is_empty() {
        return Err(ConfigError::Empty(name));
    }
    Ok(value)
}

fn non_empty<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name).filter(|value| !value.trim().is_empty())
}

/// Root of the Hugging Face hub cache: `HF_HUB_CACHE`, else `$HF_HOME/hub`,
/// else `~/.cache/huggingface/hub`
fn hub_cache_dir<F>(lookup: &F, home: Option<&PathBuf>) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(cache) = non_empty(lookup, "HF_HUB_CACHE") {
        return expand_path(&cache, home);
    }
    if let Some(hf_home) = non_empty(lookup, "HF_HOME") {
        return expand_path(&hf_home, home).join("hub");
    }
    home.map_or_else(|| PathBuf::from(".cache"), |home| home.join(".cache"))
        .join("huggingface")
        .join("hub")
}

fn embedding_cache_dir<F>(lookup: &F, home: Option<&PathBuf>) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(lookup, "SENTENCE_TRANSFORMERS_HOME").map_or_else(
        || hub_cache_dir(lookup, home),
        |dir| expand_path(&dir, home),
    )
}

/// tiktoken's lookup order; an explicitly empty `TIKTOKEN_CACHE_DIR`
/// turns caching off
fn tiktoken_cache_dir<F>(lookup: &F, home: Option<&PathBuf>) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(dir) = lookup("TIKTOKEN_CACHE_DIR") {
        if dir.is_empty() {
            return None;
        }
        return Some(expand_path(&dir, home));
    }
    if let Some(dir) = non_empty(lookup, "DATA_GYM_CACHE_DIR") {
        return Some(expand_path(&dir, home));
    }
    Some(std::env::temp_dir().join("data-gym-cache"))
}

/// Expand a leading `~/` to the home directory
pub fn expand_path(path: &str, home: Option<&PathBuf>) -> PathBuf {
    match (path.strip_prefix("~/"), home) {
        (Some(stripped), Some(home)) => home.join(stripped),
        _ => PathBuf::from(path),
    }
}
