use crate::provision::Fetch;
use anyhow::{Context, Result};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A downloadable file backing an encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blob {
    /// Public download URL
    pub url: &'static str,
    /// Expected sha256 of the body, lowercase hex
    pub sha256: &'static str,
}

/// A named tiktoken encoding and the blobs it is built from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoding {
    /// Name as passed to `tiktoken.get_encoding`
    pub name: &'static str,
    /// Rank files the encoding loads
    pub blobs: &'static [Blob],
}

const GPT2_BLOBS: &[Blob] = &[
    Blob {
        url: "https://openaipublic.blob.core.windows.net/gpt-2/encodings/main/vocab.bpe",
        sha256: "1ce1664773c50f3e0cc8842619a93edc4624525b2b6b1b3a7a3c2c5e4e8b2b27",
    },
    Blob {
        url: "https://openaipublic.blob.core.windows.net/gpt-2/encodings/main/encoder.json",
        sha256: "196139668be63f3b5d6574427317ae82f612a97c5d1cdaf36ed2256dbf636783",
    },
];

const R50K_BLOBS: &[Blob] = &[Blob {
    url: "https://openaipublic.blob.core.windows.net/encodings/r50k_base.tiktoken",
    sha256: "306cd27f03c1a714eca7108e03d66b7dc042abe8c258b44c199a7ed9838dd930",
}];

const P50K_BLOBS: &[Blob] = &[Blob {
    url: "https://openaipublic.blob.core.windows.net/encodings/p50k_base.tiktoken",
    sha256: "94b5ca7dff4d00767bc256fdd1b27e5b17361d7b8a5f968547f9f23eb70d2069",
}];

const CL100K_BLOBS: &[Blob] = &[Blob {
    url: "https://openaipublic.blob.core.windows.net/encodings/cl100k_base.tiktoken",
    sha256: "223921b76ee99bde995b7ff738513eef100fb51d18c93597a113bcffe865b2a7",
}];

const O200K_BLOBS: &[Blob] = &[Blob {
    url: "https://openaipublic.blob.core.windows.net/encodings/o200k_base.tiktoken",
    sha256: "446a9538cb6c348e3516120d7c08b09f57c36495e2acfffe59a5bf8b0cfb1a2d",
}];

/// Encodings shipped by tiktoken; edit/harmony variants share their base's ranks
pub const ENCODINGS: &[Encoding] = &[
    Encoding {
        name: "gpt2",
        blobs: GPT2_BLOBS,
    },
    Encoding {
        name: "r50k_base",
        blobs: R50K_BLOBS,
    },
    Encoding {
        name: "p50k_base",
        blobs: P50K_BLOBS,
    },
    Encoding {
        name: "p50k_edit",
        blobs: P50K_BLOBS,
    },
    Encoding {
        name: "cl100k_base",
        blobs: CL100K_BLOBS,
    },
    Encoding {
        name: "o200k_base",
        blobs: O200K_BLOBS,
    },
    Encoding {
        name: "o200k_harmony",
        blobs: O200K_BLOBS,
    },
];

/// Errors specific to encoding blobs
#[derive(Debug, Error)]
pub enum EncodingError {
    /// Name not in the registry
    #[error("unknown encoding {name}, expected one of: {}", known_encodings().join(", "))]
    UnknownEncoding {
        /// Name as configured
        name: String,
    },

    /// Downloaded body doesn't hash to the expected value
    #[error("hash mismatch for data downloaded from {url} (expected {expected}, got {actual})")]
    HashMismatch {
        /// Source URL
        url: String,
        /// Expected sha256
        expected: String,
        /// Computed sha256
        actual: String,
    },
}

/// Look up an encoding by name
///
/// # Errors
/// Returns [`EncodingError::UnknownEncoding`] if the name is not registered
pub fn lookup(name: &str) -> Result<&'static Encoding, EncodingError> {
    ENCODINGS
        .iter()
        .find(|e| e.name == name)
        .ok_or_else(|| EncodingError::UnknownEncoding {
            name: name.to_owned(),
        })
}

fn known_encodings() -> Vec<&'static str> {
    ENCODINGS.iter().map(|e| e.name).collect()
}

/// Cache file name tiktoken uses for a blob URL
pub fn cache_key(url: &str) -> String {
    hex::encode(Sha1::digest(url.as_bytes()))
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Blob store laid out the way tiktoken's own cache is
pub struct BlobCache {
    /// `None` disables persistence
    dir: Option<PathBuf>,
    client: reqwest::blocking::Client,
}

impl BlobCache {
    /// Create a cache over `dir`
    ///
    /// # Errors
    /// Returns error if the HTTP client can't be built
    pub fn new(dir: Option<PathBuf>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { dir, client })
    }

    /// Ensure the blob at `url` is cached and intact, returning its path
    ///
    /// Returns `None` when caching is disabled; the blob is still downloaded
    /// and verified.
    ///
    /// # Errors
    /// Returns error if the download fails, the hash doesn't match, or the cache can't be written
    pub fn fetch(&self, url: &str, sha256: &str) -> Result<Option<PathBuf>> {
        let Some(dir) = &self.dir else {
            tracing::warn!(url, "tiktoken cache disabled, blob will not be persisted");
            self.download(url, sha256)?;
            return Ok(None);
        };

        let path = dir.join(cache_key(url));
        if is_cached(&path, sha256)? {
            tracing::info!(url, path = %path.display(), "blob already cached, skipping download");
            return Ok(Some(path));
        }

        let bytes = self.download(url, sha256)?;
        write_atomic(dir, &path, &bytes)?;

        tracing::info!(
            url,
            path = %path.display(),
            size = bytes.len(),
            "blob cached"
        );

        Ok(Some(path))
    }

    fn download(&self, url: &str, sha256: &str) -> Result<Vec<u8>> {
        tracing::info!(url, "downloading blob");

        let response = self
            .client
            .get(url)
            .send()
            .with_context(|| format!("failed to download {url}"))?;

        if !response.status().is_success() {
            anyhow::bail!("download failed with status {}: {}", response.status(), url);
        }

        let bytes = response.bytes().context("failed to read response bytes")?;

        let actual = sha256_hex(&bytes);
        if !actual.eq_ignore_ascii_case(sha256) {
            return Err(EncodingError::HashMismatch {
                url: url.to_owned(),
                expected: sha256.to_owned(),
                actual,
            }
            .into());
        }

        Ok(bytes.to_vec())
    }
}

/// A cached blob only counts if it still hashes correctly; stale copies are removed
fn is_cached(path: &Path, sha256: &str) -> Result<bool> {
    if !path.is_file() {
        return Ok(false);
    }

    let data = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if sha256_hex(&data).eq_ignore_ascii_case(sha256) {
        return Ok(true);
    }

    tracing::warn!(path = %path.display(), "cached blob failed hash check, downloading again");
    fs::remove_file(path)
        .with_context(|| format!("failed to remove stale blob {}", path.display()))?;
    Ok(false)
}

fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create cache directory {}", dir.display()))?;

    // Write to temporary file first so concurrent readers never see a partial blob
    let temp_path = path.with_extension(format!("{}.tmp", std::process::id()));

    let mut file = fs::File::create(&temp_path)
        .with_context(|| format!("failed to create temp file at {}", temp_path.display()))?;
    let written = file
        .write_all(bytes)
        .context("failed to write blob to temp file");
    drop(file);

    let result = written.and_then(|()| {
        fs::rename(&temp_path, path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                temp_path.display(),
                path.display()
            )
        })
    });

    if result.is_err() {
        if let Err(e) = fs::remove_file(&temp_path) {
            tracing::warn!(path = %temp_path.display(), error = %e, "failed to remove temp file");
        }
    }

    result
}

/// Caches the rank files of one tiktoken encoding
pub struct EncodingFetcher {
    name: String,
    cache: BlobCache,
}

impl EncodingFetcher {
    /// Create a fetcher for the encoding called `name`
    pub const fn new(name: String, cache: BlobCache) -> Self {
        Self { name, cache }
    }
}

impl Fetch for EncodingFetcher {
    fn fetch(&self) -> Result<Vec<PathBuf>> {
        let encoding = lookup(&self.name)?;

        tracing::info!(
            encoding = encoding.name,
            blobs = encoding.blobs.len(),
            "resolving tiktoken encoding"
        );

        let mut paths = Vec::with_capacity(encoding.blobs.len());
        for blob in encoding.blobs {
            if let Some(path) = self.cache.fetch(blob.url, blob.sha256)? {
                paths.push(path);
            }
        }

        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UNREACHABLE_URL: &str = "http://127.0.0.1:9/encodings/test.tiktoken";

    #[test]
    fn test_lookup_known_encodings() {
        assert_eq!(lookup("cl100k_base").unwrap().blobs, CL100K_BLOBS);
        assert_eq!(lookup("p50k_edit").unwrap().blobs, P50K_BLOBS);
        assert_eq!(lookup("o200k_harmony").unwrap().blobs, O200K_BLOBS);
        assert_eq!(lookup("gpt2").unwrap().blobs.len(), 2);
    }

    #[test]
    fn test_lookup_unknown_encoding() {
        let err = lookup("cl200k_base").unwrap_err();
        assert!(err
            .to_string()
            .starts_with("unknown encoding cl200k_base, expected one of: gpt2, r50k_base"));
    }

    #[test]
    fn test_cache_key_matches_tiktoken() {
        assert_eq!(
            cache_key("https://openaipublic.blob.core.windows.net/encodings/cl100k_base.tiktoken"),
            "9b5ad71b2ce5302211f9c61530b329a4922fc6a4"
        );
    }

    #[test]
    fn test_cached_blob_reused_without_network() {
        let dir = tempfile::tempdir().unwrap();
        let body = b"IQ== 0\nIg== 1\n";
        let sha = sha256_hex(body);
        let path = dir.path().join(cache_key(UNREACHABLE_URL));
        fs::write(&path, body).unwrap();

        let cache = BlobCache::new(Some(dir.path().to_path_buf())).unwrap();
        let result = cache.fetch(UNREACHABLE_URL, &sha).unwrap();

        assert_eq!(result, Some(path));
    }

    #[test]
    fn test_stale_blob_removed_and_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(cache_key(UNREACHABLE_URL));
        fs::write(&path, b"corrupted").unwrap();

        let cache = BlobCache::new(Some(dir.path().to_path_buf())).unwrap();
        let result = cache.fetch(UNREACHABLE_URL, &sha256_hex(b"expected"));

        // Refetch hits the unreachable URL
        assert!(result.is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_write_atomic_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("data-gym-cache");
        let path = cache_dir.join("blob");

        write_atomic(&cache_dir, &path, b"data").unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"data");
        let leftovers = fs::read_dir(&cache_dir).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_write_atomic_failure_removes_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        fs::create_dir(&path).unwrap();

        assert!(write_atomic(dir.path(), &path, b"data").is_err());

        let entries: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("blob")]);
        assert!(path.is_dir());
    }

    #[test]
    fn test_download_persists_verified_blob() {
        let mut server = mockito::Server::new();
        let body = "IQ== 0\nIg== 1\n";
        let blob = server
            .mock("GET", "/encodings/test.tiktoken")
            .with_status(200)
            .with_body(body)
            .create();
        let url = format!("{}/encodings/test.tiktoken", server.url());

        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("data-gym-cache");
        let cache = BlobCache::new(Some(cache_dir.clone())).unwrap();

        let path = cache.fetch(&url, &sha256_hex(body.as_bytes())).unwrap();

        blob.assert();
        let expected = cache_dir.join(cache_key(&url));
        assert_eq!(path, Some(expected.clone()));
        assert_eq!(fs::read(&expected).unwrap(), body.as_bytes());
    }

    #[test]
    fn test_download_error_status_persists_nothing() {
        let mut server = mockito::Server::new();
        let _missing = server
            .mock("GET", "/encodings/test.tiktoken")
            .with_status(404)
            .with_body("not found")
            .create();
        let url = format!("{}/encodings/test.tiktoken", server.url());

        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("data-gym-cache");
        let cache = BlobCache::new(Some(cache_dir.clone())).unwrap();

        let err = cache.fetch(&url, &sha256_hex(b"anything")).unwrap_err();

        assert!(err
            .to_string()
            .starts_with("download failed with status 404 Not Found"));
        assert!(!cache_dir.join(cache_key(&url)).exists());
    }

    #[test]
    fn test_download_hash_mismatch_persists_nothing() {
        let mut server = mockito::Server::new();
        let _tampered = server
            .mock("GET", "/encodings/test.tiktoken")
            .with_status(200)
            .with_body("tampered")
            .create();
        let url = format!("{}/encodings/test.tiktoken", server.url());

        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("data-gym-cache");
        let cache = BlobCache::new(Some(cache_dir.clone())).unwrap();

        let err = cache.fetch(&url, &sha256_hex(b"expected")).unwrap_err();

        assert!(matches!(
            err.downcast_ref::<EncodingError>(),
            Some(EncodingError::HashMismatch { actual, .. }) if *actual == sha256_hex(b"tampered")
        ));
        assert!(!cache_dir.join(cache_key(&url)).exists());
    }

    #[test]
    fn test_disabled_cache_still_verifies_download() {
        let mut server = mockito::Server::new();
        let _blob = server
            .mock("GET", "/encodings/test.tiktoken")
            .with_status(200)
            .with_body("IQ== 0\n")
            .create();
        let url = format!("{}/encodings/test.tiktoken", server.url());

        let cache = BlobCache::new(None).unwrap();

        assert_eq!(cache.fetch(&url, &sha256_hex(b"IQ== 0\n")).unwrap(), None);
        assert!(cache.fetch(&url, &sha256_hex(b"other")).is_err());
    }

    #[test]
    fn test_unknown_encoding_fails_before_download() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let fetcher = EncodingFetcher::new(
            "nonexistent".to_owned(),
            BlobCache::new(Some(cache_dir.clone())).unwrap(),
        );

        let err = fetcher.fetch().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EncodingError>(),
            Some(EncodingError::UnknownEncoding { .. })
        ));
        assert!(!cache_dir.exists());
    }

    #[test]
    #[ignore = "requires network access"]
    fn test_fetch_cl100k_base() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = EncodingFetcher::new(
            "cl100k_base".to_owned(),
            BlobCache::new(Some(dir.path().to_path_buf())).unwrap(),
        );

        let paths = fetcher.fetch().unwrap();
        assert_eq!(
            paths,
            vec![dir.path().join("9b5ad71b2ce5302211f9c61530b329a4922fc6a4")]
        );

        // Second run is served from the cache
        assert_eq!(fetcher.fetch().unwrap(), paths);
    }
}
