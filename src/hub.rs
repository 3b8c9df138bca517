use anyhow::{Context, Result};
use glob::{MatchOptions, Pattern};
use hf_hub::api::sync::{Api, ApiBuilder};
use hf_hub::{Repo, RepoType};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

/// Blocking client for the Hugging Face hub, rooted at one cache directory
pub struct HubClient {
    api: Api,
    cache_dir: PathBuf,
}

/// Metadata of a model repository at its current `main` revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoListing {
    /// `org/name` repository id
    pub repo_id: String,
    /// Commit sha the listing was taken at
    pub sha: String,
    /// Repo-relative file names
    pub files: Vec<String>,
}

/// Files of one repo revision as laid out in the hub cache
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// `org/name` repository id
    pub repo_id: String,
    /// Commit sha the files were taken from
    pub revision: String,
    /// `<cache>/models--<org>--<name>/snapshots/<sha>`
    pub dir: PathBuf,
    /// Cached paths of the downloaded files
    pub files: Vec<PathBuf>,
}

impl Snapshot {
    /// Whether the snapshot contains `filename` (repo-relative)
    pub fn contains(&self, filename: &str) -> bool {
        self.dir.join(filename).exists()
    }
}

/// Glob-based selection of repo files
///
/// A file is accepted when it matches any allow pattern (or there are none)
/// and matches no ignore pattern. Plain patterns let `*` cross `/`; patterns
/// added with [`FileFilter::ignoring_in_dir`] stay inside one directory.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    allow: Vec<Pattern>,
    ignore: Vec<Pattern>,
    ignore_in_dir: Vec<Pattern>,
}

const SINGLE_DIR: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl FileFilter {
    /// Build a filter from glob patterns
    ///
    /// # Errors
    /// Returns error if a pattern is not a valid glob
    pub fn new(allow: &[&str], ignore: &[&str]) -> Result<Self> {
        Ok(Self {
            allow: compile(allow)?,
            ignore: compile(ignore)?,
            ignore_in_dir: Vec::new(),
        })
    }

    /// Add an ignore pattern
    ///
    /// # Errors
    /// Returns error if the pattern is not a valid glob
    pub fn ignoring(mut self, pattern: &str) -> Result<Self> {
        self.ignore.extend(compile(&[pattern])?);
        Ok(self)
    }

    /// Ignore files matching `file_pattern` directly inside `dir`
    ///
    /// An empty `dir` means the repo root; subdirectories are never matched.
    ///
    /// # Errors
    /// Returns error if the pattern is not a valid glob
    pub fn ignoring_in_dir(mut self, dir: &str, file_pattern: &str) -> Result<Self> {
        let pattern = if dir.is_empty() {
            file_pattern.to_owned()
        } else {
            format!("{}/{file_pattern}", Pattern::escape(dir))
        };
        self.ignore_in_dir.extend(compile(&[pattern.as_str()])?);
        Ok(self)
    }

    /// Whether `path` passes the filter
    pub fn accepts(&self, path: &str) -> bool {
        let allowed = self.allow.is_empty() || self.allow.iter().any(|p| p.matches(path));
        allowed
            && !self.ignore.iter().any(|p| p.matches(path))
            && !self
                .ignore_in_dir
                .iter()
                .any(|p| p.matches_with(path, SINGLE_DIR))
    }
}

fn compile(patterns: &[&str]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| Pattern::new(p).with_context(|| format!("invalid file pattern {p:?}")))
        .collect()
}

impl HubClient {
    /// Create a client storing files under `cache_dir`
    ///
    /// # Errors
    /// Returns error if the underlying hub API can't be built
    pub fn new(cache_dir: PathBuf, token: Option<String>) -> Result<Self> {
        Self::build(cache_dir, token, None)
    }

    /// Create a client talking to a hub mirror at `endpoint` instead of huggingface.co
    ///
    /// # Errors
    /// Returns error if the underlying hub API can't be built
    pub fn with_endpoint(cache_dir: PathBuf, token: Option<String>, endpoint: String) -> Result<Self> {
        Self::build(cache_dir, token, Some(endpoint))
    }

    fn build(cache_dir: PathBuf, token: Option<String>, endpoint: Option<String>) -> Result<Self> {
        let mut builder = ApiBuilder::new()
            .with_cache_dir(cache_dir.clone())
            .with_progress(std::io::stderr().is_terminal());

        // Without an explicit token the builder keeps the one stored by `huggingface-cli login`
        if token.is_some() {
            builder = builder.with_token(token);
        }
        if let Some(endpoint) = endpoint {
            builder = builder.with_endpoint(endpoint);
        }

        let api = builder.build().context("failed to build hugging face hub client")?;

        Ok(Self { api, cache_dir })
    }

    /// Cache root this client writes into
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// List the files of a model repo
    ///
    /// # Errors
    /// Returns error if the repo doesn't exist, is gated, or the hub is unreachable
    pub fn listing(&self, repo_id: &str) -> Result<RepoListing> {
        let info = self
            .api
            .repo(Repo::new(repo_id.to_owned(), RepoType::Model))
            .info()
            .with_context(|| format!("failed to look up repository {repo_id}"))?;

        tracing::debug!(
            repo = repo_id,
            sha = %info.sha,
            files = info.siblings.len(),
            "repository listed"
        );

        Ok(RepoListing {
            repo_id: repo_id.to_owned(),
            sha: info.sha,
            files: info.siblings.into_iter().map(|s| s.rfilename).collect(),
        })
    }

    /// Download every listed file accepted by `filter`
    ///
    /// Files already present in the cache are not downloaded again.
    ///
    /// # Errors
    /// Returns error if the filter selects nothing or any download fails
    pub fn fetch(&self, listing: &RepoListing, filter: &FileFilter) -> Result<Snapshot> {
        let selected: Vec<&str> = listing
            .files
            .iter()
            .map(String::as_str)
            .filter(|f| filter.accepts(f))
            .collect();

        if selected.is_empty() {
            anyhow::bail!(
                "no matching files in repository {} ({} files listed)",
                listing.repo_id,
                listing.files.len()
            );
        }

        tracing::info!(
            repo = %listing.repo_id,
            sha = %listing.sha,
            files = selected.len(),
            cache = %self.cache_dir.display(),
            "fetching repository snapshot"
        );

        let files = selected
            .into_iter()
            .map(|f| self.file(&listing.repo_id, f))
            .collect::<Result<Vec<_>>>()?;

        Ok(Snapshot {
            repo_id: listing.repo_id.clone(),
            revision: listing.sha.clone(),
            dir: snapshot_dir(&self.cache_dir, &listing.repo_id, &listing.sha),
            files,
        })
    }

    /// Download a single file, or return its cached path
    ///
    /// # Errors
    /// Returns error if the file can't be downloaded
    pub fn file(&self, repo_id: &str, filename: &str) -> Result<PathBuf> {
        let path = self
            .api
            .model(repo_id.to_owned())
            .get(filename)
            .with_context(|| format!("failed to download {filename} from {repo_id}"))?;

        tracing::debug!(repo = repo_id, file = filename, path = %path.display(), "file cached");

        Ok(path)
    }
}

/// Cache folder name of a model repo, e.g. `models--BAAI--bge-m3`
pub fn repo_folder_name(repo_id: &str) -> String {
    format!("models--{}", repo_id.replace('/', "--"))
}

/// Snapshot directory of `repo_id` at `sha` under a hub cache root
pub fn snapshot_dir(cache_dir: &Path, repo_id: &str, sha: &str) -> PathBuf {
    cache_dir
        .join(repo_folder_name(repo_id))
        .join("snapshots")
        .join(sha)
}

/// Model identifiers may name a directory that already holds the model
pub fn local_model_dir(identifier: &str) -> Option<PathBuf> {
    let path = Path::new(identifier);
    path.is_dir().then(|| path.to_path_buf())
}
