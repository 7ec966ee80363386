//! Colloquy Core - shared library for the Colloquy meeting-intelligence
//! pipeline.
//!
//! This crate implements the streaming transcription and decision pipeline:
//! a WebSocket audio gateway, a Redis-Streams transcription collector, and
//! a pub/sub decision listener. It is designed to run as one headless
//! server process or split across processes per subsystem.
//!
//! # Architecture
//!
//! - [`gateway`]: WebSocket ingestion, per-session buffers, ASR dispatch
//! - [`asr`]: pluggable transcription backends (remote HTTP, cloud
//!   streaming, optional local model)
//! - [`segment`]: canonical segments and hypothesis stabilisation
//! - [`speaker`]: mic-activity speaker attribution
//! - [`collector`]: consumer group, merge engine, immutability promoter
//! - [`decisions`]: per-meeting LLM window engine, dedup, SSE surface
//! - [`tracker`]: runtime-mutable extraction configuration
//! - [`storage`] / [`persist`] / [`webhook`]: external adapters
//! - [`error`]: centralized error types
//!
//! State ownership follows one rule: every piece of mutable state has a
//! single owner, readers take snapshots, and nothing holds a sync lock
//! across a suspension point.

#![warn(clippy::all)]

pub mod asr;
pub mod audio;
pub mod collector;
pub mod config;
pub mod decisions;
pub mod error;
pub mod gateway;
pub mod limits;
pub mod llm;
pub mod persist;
pub mod segment;
pub mod speaker;
pub mod storage;
pub mod tracker;
pub mod webhook;
pub mod wire;

// Re-export commonly used types at the crate root
pub use config::{
    AsrBackendKind, CollectorConfig, DecisionConfig, GatewayConfig, LlmConfig, StorageConfig,
};
pub use error::{ColloquyError, ColloquyResult};
pub use segment::Segment;
pub use tracker::{TrackerConfig, TrackerStore};
