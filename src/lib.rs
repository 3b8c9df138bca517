//! fetch-models - pre-fetch the models a RAG backend needs offline
//!
//! Caches a sentence-embedding model, a faster-whisper model and a tiktoken
//! encoding into the on-disk layouts their consumers read from.

/// Environment configuration
pub mod config;
/// Inference device models are prepared for
pub mod device;
/// Sentence-embedding model fetch
pub mod embedding;
/// Tiktoken encoding blobs
pub mod encoding;
/// Hugging Face hub client
pub mod hub;
/// Fixed-order provisioning run
pub mod provision;
/// Logging setup
pub mod telemetry;
/// Faster-whisper model fetch
pub mod whisper;
