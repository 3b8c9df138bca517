use crate::device::Device;
use crate::hub::{self, FileFilter, HubClient, RepoListing, Snapshot};
use crate::provision::Fetch;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Namespace bare sentence-transformers model names live under
const DEFAULT_NAMESPACE: &str = "sentence-transformers";

/// Weight formats sentence-transformers never loads on the PyTorch path
const IGNORED_FILES: &[&str] = &[
    ".gitattributes",
    "*.onnx",
    "onnx/*",
    "openvino/*",
    "coreml/*",
    "*.h5",
    "*.msgpack",
    "*.tflite",
    "flax_model*",
    "tf_model*",
    "rust_model.ot",
];

/// Errors specific to embedding models
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// The model's config maps classes to python modules but remote code is not trusted
    #[error(
        "{repo} contains custom code ({modules}) which must be trusted to load the model"
    )]
    RemoteCodeNotTrusted {
        /// Repository id
        repo: String,
        /// Comma separated module files
        modules: String,
    },
}

/// A python module referenced from `config.json`'s `auto_map`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RemoteModule {
    /// Repo holding the module, `None` for the model's own repo
    pub repo: Option<String>,
    /// Module file name, e.g. `modeling_bert.py`
    pub file: String,
}

#[derive(Debug, Deserialize)]
struct ModelConfig {
    #[serde(default)]
    auto_map: BTreeMap<String, serde_json::Value>,
}

/// Repos to try for a configured identifier, in order
pub fn candidate_repos(identifier: &str) -> Vec<String> {
    if identifier.contains('/') {
        vec![identifier.to_owned()]
    } else {
        vec![
            identifier.to_owned(),
            format!("{DEFAULT_NAMESPACE}/{identifier}"),
        ]
    }
}

/// Filter selecting the files sentence-transformers loads from `files`
///
/// Pickled `.bin` weights are skipped only in directories that also carry
/// safetensors weights; a module directory such as `2_Dense/` with nothing
/// but `pytorch_model.bin` keeps it.
///
/// # Errors
/// Returns error if a pattern fails to compile
pub fn file_filter(files: &[String], trust_remote_code: bool) -> Result<FileFilter> {
    let mut filter = FileFilter::new(&[], IGNORED_FILES)?;

    for dir in safetensors_dirs(files) {
        filter = filter
            .ignoring_in_dir(dir, "*.bin")?
            .ignoring_in_dir(dir, "pytorch_model*.bin.index.json")?;
    }

    if !trust_remote_code {
        filter = filter.ignoring("*.py")?;
    }

    Ok(filter)
}

/// Repo directories holding safetensors weights, `""` for the root
fn safetensors_dirs(files: &[String]) -> BTreeSet<&str> {
    files
        .iter()
        .map(|f| Path::new(f.as_str()))
        .filter(|path| {
            path.extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("safetensors"))
        })
        .map(|path| path.parent().and_then(Path::to_str).unwrap_or_default())
        .collect()
}

/// Parse `auto_map` entries out of a `config.json` body
///
/// Entries look like `module.Class` or `org/repo--module.Class`; tokenizer
/// entries are `[slow, fast]` pairs where either side may be null.
///
/// # Errors
/// Returns error if the body is not valid JSON
pub fn remote_modules(config_json: &str) -> Result<Vec<RemoteModule>> {
    let config: ModelConfig =
        serde_json::from_str(config_json).context("failed to parse model config.json")?;

    let mut modules: Vec<RemoteModule> = config
        .auto_map
        .values()
        .flat_map(|value| match value {
            serde_json::Value::String(s) => vec![s.as_str()],
            serde_json::Value::Array(items) => {
                items.iter().filter_map(serde_json::Value::as_str).collect()
            }
            _ => Vec::new(),
        })
        .filter_map(parse_class_reference)
        .collect();

    modules.sort();
    modules.dedup();
    Ok(modules)
}

fn parse_class_reference(reference: &str) -> Option<RemoteModule> {
    let (repo, path) = match reference.split_once("--") {
        Some((repo, path)) => (Some(repo.to_owned()), path),
        None => (None, reference),
    };
    let (module, _class) = path.rsplit_once('.')?;
    Some(RemoteModule {
        repo,
        file: format!("{}.py", module.replace('.', "/")),
    })
}

/// Caches a sentence-transformers model into the hub cache
pub struct EmbeddingFetcher {
    model: String,
    hub: HubClient,
    device: Device,
    trust_remote_code: bool,
}

impl EmbeddingFetcher {
    /// Create a fetcher for `model`
    pub const fn new(model: String, hub: HubClient, device: Device, trust_remote_code: bool) -> Self {
        Self {
            model,
            hub,
            device,
            trust_remote_code,
        }
    }

    /// First candidate repo that exists on the hub
    fn resolve_listing(&self) -> Result<RepoListing> {
        let mut last_err = None;
        for repo_id in candidate_repos(&self.model) {
            match self.hub.listing(&repo_id) {
                Ok(listing) => return Ok(listing),
                Err(e) => {
                    tracing::debug!(repo = %repo_id, error = %e, "candidate repository not found");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no repository for {}", self.model)))
    }

    /// Fetch python modules `config.json` points at
    fn fetch_remote_code(&self, snapshot: &Snapshot) -> Result<Vec<PathBuf>> {
        let config_path = snapshot.dir.join("config.json");
        if !config_path.is_file() {
            return Ok(Vec::new());
        }

        let body = fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let modules = remote_modules(&body)?;
        if modules.is_empty() {
            return Ok(Vec::new());
        }

        if !self.trust_remote_code {
            let names: Vec<&str> = modules.iter().map(|m| m.file.as_str()).collect();
            return Err(EmbeddingError::RemoteCodeNotTrusted {
                repo: snapshot.repo_id.clone(),
                modules: names.join(", "),
            }
            .into());
        }

        modules
            .iter()
            .map(|module| {
                let repo = module.repo.as_deref().unwrap_or(&snapshot.repo_id);
                tracing::info!(repo, module = %module.file, "fetching custom model code");
                self.hub.file(repo, &module.file)
            })
            .collect()
    }
}

impl Fetch for EmbeddingFetcher {
    fn fetch(&self) -> Result<Vec<PathBuf>> {
        tracing::info!(
            model = %self.model,
            device = %self.device,
            trust_remote_code = self.trust_remote_code,
            cache = %self.hub.cache_dir().display(),
            "resolving embedding model"
        );

        if let Some(dir) = hub::local_model_dir(&self.model) {
            tracing::info!(path = %dir.display(), "using local embedding model, skipping download");
            return Ok(vec![dir]);
        }

        let listing = self.resolve_listing()?;
        let filter = file_filter(&listing.files, self.trust_remote_code)?;
        let snapshot = self.hub.fetch(&listing, &filter)?;
        let remote_code = self.fetch_remote_code(&snapshot)?;

        tracing::info!(
            repo = %snapshot.repo_id,
            revision = %snapshot.revision,
            path = %snapshot.dir.display(),
            files = snapshot.files.len(),
            remote_modules = remote_code.len(),
            "embedding model cached"
        );

        // Same-repo modules already live inside the snapshot directory
        let mut paths: Vec<PathBuf> = remote_code
            .into_iter()
            .filter(|p| !p.starts_with(&snapshot.dir))
            .collect();
        paths.insert(0, snapshot.dir);
        Ok(paths)
    }
}
