use crate::config::{Config, HubConfig};
use crate::device::Device;
use crate::embedding::EmbeddingFetcher;
use crate::encoding::{BlobCache, EncodingFetcher};
use crate::hub::HubClient;
use crate::whisper::{ComputeType, WhisperFetcher};
use anyhow::{Context, Result};
use std::fmt;
use std::io::Write;
use std::path::PathBuf;

/// Something that makes one artifact available locally
///
/// Implementations block until the artifact is cached and return the
/// locations they ensured.
#[cfg_attr(test, mockall::automock)]
pub trait Fetch {
    /// Download the artifact unless it is already cached
    ///
    /// # Errors
    /// Returns error if the artifact can't be resolved, downloaded or stored
    fn fetch(&self) -> Result<Vec<PathBuf>>;
}

/// The three provisioning steps, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Sentence-embedding model
    Embedding,
    /// Speech-to-text model
    Whisper,
    /// Tokenizer encoding table
    Tiktoken,
}

impl Stage {
    /// Line printed to stdout before the step starts
    pub const fn progress_message(self) -> &'static str {
        match self {
            Self::Embedding => "Fetching embedding model",
            Self::Whisper => "Fetching whisper model",
            Self::Tiktoken => "Fetching tiktoken model",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Embedding => "embedding",
            Self::Whisper => "whisper",
            Self::Tiktoken => "tiktoken",
        })
    }
}

/// What a successful run cached, in execution order
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Report {
    /// Each finished stage with the paths it ensured
    pub stages: Vec<(Stage, Vec<PathBuf>)>,
}

/// Runs the embedding, whisper and tiktoken fetches one after another
pub struct Provisioner {
    embedding: Box<dyn Fetch>,
    whisper: Box<dyn Fetch>,
    tiktoken: Box<dyn Fetch>,
}

impl Provisioner {
    /// Create a provisioner from its three steps
    pub fn new(
        embedding: Box<dyn Fetch>,
        whisper: Box<dyn Fetch>,
        tiktoken: Box<dyn Fetch>,
    ) -> Self {
        Self {
            embedding,
            whisper,
            tiktoken,
        }
    }

    /// Wire the real fetchers: CPU embedding model with remote code trusted,
    /// int8 whisper model on CPU, tiktoken encoding
    ///
    /// Nothing here touches the network.
    ///
    /// # Errors
    /// Returns error if a client can't be constructed
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedding_hub = hub_client(config.embedding.cache_dir.clone(), &config.hub)?;
        let whisper_hub = hub_client(config.whisper.download_root.clone(), &config.hub)?;

        Ok(Self::new(
            Box::new(EmbeddingFetcher::new(
                config.embedding.model.clone(),
                embedding_hub,
                Device::Cpu,
                true,
            )),
            Box::new(WhisperFetcher::new(
                config.whisper.model.clone(),
                whisper_hub,
                Device::Cpu,
                ComputeType::Int8,
            )),
            Box::new(EncodingFetcher::new(
                config.tiktoken.encoding.clone(),
                BlobCache::new(config.tiktoken.cache_dir.clone())?,
            )),
        ))
    }

    fn stages(&self) -> [(Stage, &dyn Fetch); 3] {
        [
            (Stage::Embedding, self.embedding.as_ref()),
            (Stage::Whisper, self.whisper.as_ref()),
            (Stage::Tiktoken, self.tiktoken.as_ref()),
        ]
    }

    /// Run every step in order, announcing each on `out`
    ///
    /// Stops at the first failure; artifacts cached by earlier steps stay cached.
    ///
    /// # Errors
    /// Returns the first step's error, or an error writing to `out`
    pub fn run<W: Write>(&self, out: &mut W) -> Result<Report> {
        let mut report = Report::default();

        for (stage, fetcher) in self.stages() {
            writeln!(out, "{}", stage.progress_message()).context("failed to write progress")?;
            out.flush().context("failed to flush progress")?;

            let paths = fetcher
                .fetch()
                .with_context(|| format!("failed to fetch {stage} model"))?;

            for path in &paths {
                tracing::info!(stage = %stage, path = %path.display(), "artifact ready");
            }
            report.stages.push((stage, paths));
        }

        Ok(report)
    }
}

fn hub_client(cache_dir: PathBuf, hub: &HubConfig) -> Result<HubClient> {
    match &hub.endpoint {
        Some(endpoint) => HubClient::with_endpoint(cache_dir, hub.token.clone(), endpoint.clone()),
        None => HubClient::new(cache_dir, hub.token.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    fn succeeding(path: &'static str) -> MockFetch {
        let mut mock = MockFetch::new();
        mock.expect_fetch()
            .times(1)
            .returning(move || Ok(vec![PathBuf::from(path)]));
        mock
    }

    fn output(buf: &[u8]) -> String {
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn test_run_prints_stages_in_order() {
        let provisioner = Provisioner::new(
            Box::new(succeeding("/cache/embedding")),
            Box::new(succeeding("/cache/whisper")),
            Box::new(succeeding("/cache/tiktoken")),
        );

        let mut out = Vec::new();
        let report = provisioner.run(&mut out).unwrap();

        assert_eq!(
            output(&out),
            "Fetching embedding model\nFetching whisper model\nFetching tiktoken model\n"
        );
        assert_eq!(
            report.stages,
            vec![
                (Stage::Embedding, vec![PathBuf::from("/cache/embedding")]),
                (Stage::Whisper, vec![PathBuf::from("/cache/whisper")]),
                (Stage::Tiktoken, vec![PathBuf::from("/cache/tiktoken")]),
            ]
        );
    }

    #[test]
    fn test_fetches_run_sequentially() {
        let mut seq = Sequence::new();
        let mut embedding = MockFetch::new();
        let mut whisper = MockFetch::new();
        let mut tiktoken = MockFetch::new();

        embedding
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(Vec::new()));
        whisper
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(Vec::new()));
        tiktoken
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(Vec::new()));

        let provisioner = Provisioner::new(Box::new(embedding), Box::new(whisper), Box::new(tiktoken));
        provisioner.run(&mut Vec::new()).unwrap();
    }

    #[test]
    fn test_whisper_failure_stops_run() {
        let mut whisper = MockFetch::new();
        whisper
            .expect_fetch()
            .times(1)
            .returning(|| Err(anyhow::anyhow!("invalid model size 'gigantic'")));
        let mut tiktoken = MockFetch::new();
        tiktoken.expect_fetch().times(0);

        let provisioner = Provisioner::new(
            Box::new(succeeding("/cache/embedding")),
            Box::new(whisper),
            Box::new(tiktoken),
        );

        let mut out = Vec::new();
        let err = provisioner.run(&mut out).unwrap_err();

        // Embedding completed and the tiktoken step was never announced
        assert_eq!(
            output(&out),
            "Fetching embedding model\nFetching whisper model\n"
        );
        assert_eq!(err.to_string(), "failed to fetch whisper model");
        assert_eq!(
            err.root_cause().to_string(),
            "invalid model size 'gigantic'"
        );
    }

    #[test]
    fn test_embedding_failure_stops_run() {
        let mut embedding = MockFetch::new();
        embedding
            .expect_fetch()
            .times(1)
            .returning(|| Err(anyhow::anyhow!("network unreachable")));
        let mut whisper = MockFetch::new();
        whisper.expect_fetch().times(0);
        let mut tiktoken = MockFetch::new();
        tiktoken.expect_fetch().times(0);

        let provisioner = Provisioner::new(Box::new(embedding), Box::new(whisper), Box::new(tiktoken));

        let mut out = Vec::new();
        assert!(provisioner.run(&mut out).is_err());
        assert_eq!(output(&out), "Fetching embedding model\n");
    }

    #[test]
    fn test_from_config_with_hub_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        let config = Config::from_lookup(|key| match key {
            "RAG_EMBEDDING_MODEL" => Some("all-MiniLM-L6-v2".to_owned()),
            "WHISPER_MODEL" => Some("tiny".to_owned()),
            "WHISPER_MODEL_DIR" => Some(format!("{root}/whisper")),
            "TIKTOKEN_ENCODING_NAME" => Some("cl100k_base".to_owned()),
            "HF_HOME" => Some(format!("{root}/hf")),
            "HF_ENDPOINT" => Some("http://127.0.0.1:9".to_owned()),
            _ => None,
        })
        .unwrap();

        assert!(Provisioner::from_config(&config).is_ok());
        // Wiring alone never touches the caches
        assert!(!dir.path().join("whisper").exists());
        assert!(!dir.path().join("hf").exists());
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Embedding.to_string(), "embedding");
        assert_eq!(Stage::Whisper.progress_message(), "Fetching whisper model");
    }
}
