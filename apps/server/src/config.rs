//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! Every tunable documented in the deployment guide has an env counterpart;
//! the YAML file is optional and mostly useful for development.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use colloquy_core::asr::TranscriberServiceConfig;
use colloquy_core::config::{StorageBackendKind, StorageConfig};
use colloquy_core::{
    AsrBackendKind, CollectorConfig, DecisionConfig, GatewayConfig, LlmConfig,
};
use serde::Deserialize;

/// Full server configuration; one process can run any subset of the
/// subsystems.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Subsystem toggles.
    pub enable_gateway: bool,
    pub enable_collector: bool,
    pub enable_decisions: bool,
    /// The serving side of the remote backend; off unless this process
    /// hosts the model.
    pub enable_transcriber_service: bool,

    /// Redis instance shared by all subsystems.
    /// Override: `REDIS_URL`
    pub redis_url: String,
    /// Override: `REDIS_STREAM_NAME`
    pub redis_stream_name: String,
    /// Override: `REDIS_CONSUMER_GROUP`
    pub redis_consumer_group: String,
    /// Override: `PENDING_MSG_TIMEOUT_MS`
    pub pending_msg_timeout_ms: u64,
    /// Override: `IMMUTABILITY_THRESHOLD` (seconds)
    pub immutability_threshold: u64,
    /// Override: `BACKGROUND_TASK_INTERVAL` (seconds)
    pub background_task_interval: u64,
    /// Override: `DATABASE_URL`
    pub database_url: String,

    /// Override: `GATEWAY_BIND`
    pub gateway_bind: SocketAddr,
    /// Override: `MAX_CLIENTS`
    pub max_clients: usize,
    /// Override: `MAX_CONNECTION_TIME` (seconds)
    pub max_connection_time: u64,
    /// Override: `TRANSCRIBER_BACKEND` (remote | cloud | local)
    pub transcriber_backend: String,
    /// Override: `TRANSCRIBER_URL`
    pub transcriber_url: String,
    /// Override: `TRANSCRIBER_API_KEY`
    pub transcriber_api_key: Option<String>,
    pub transcriber_model: String,

    /// Override: `HTTP_PORT`
    pub http_port: u16,
    /// Override: `WINDOW_SEGMENTS`
    pub window_segments: usize,
    /// Override: `OFFSET_SEGMENTS`
    pub offset_segments: usize,
    /// Override: `DEBOUNCE_MS`
    pub debounce_ms: u64,
    /// Override: `DECISIONS_TTL` (seconds)
    pub decisions_ttl: u64,
    /// Override: `DEDUP_JACCARD_THRESHOLD`
    pub dedup_jaccard_threshold: f64,
    /// Override: `DEDUP_CONTAINMENT_THRESHOLD`
    pub dedup_containment_threshold: f64,
    /// Override: `DECISION_CONFIDENCE_FLOOR`
    pub decision_confidence_floor: f64,
    /// Override: `LLM_DEDUP_ENABLED`
    pub llm_dedup_enabled: bool,

    /// Override: `LLM_MODEL`
    pub llm_model: String,
    /// Override: `LLM_BASE_URL`
    pub llm_base_url: Option<String>,
    /// Override: `OPENAI_API_KEY`
    pub openai_api_key: String,

    /// Override: `MAX_CONCURRENT_TRANSCRIPTIONS`
    pub max_concurrent_transcriptions: usize,
    /// Override: `MAX_QUEUE_SIZE`
    pub max_queue_size: usize,
    /// Override: `FAIL_FAST_WHEN_BUSY`
    pub fail_fast_when_busy: bool,
    /// Override: `BUSY_RETRY_AFTER_S`
    pub busy_retry_after_s: u64,
    pub transcriber_service_port: u16,

    /// Override: `STORAGE_BACKEND` (local | s3)
    pub storage_backend: String,
    /// Override: `STORAGE_LOCAL_ROOT`
    pub storage_local_root: String,
    /// Override: `S3_ENDPOINT`
    pub s3_endpoint: String,
    /// Override: `S3_BUCKET`
    pub s3_bucket: String,
    /// Override: `S3_ACCESS_KEY`
    pub s3_access_key: String,
    /// Override: `S3_SECRET_KEY`
    pub s3_secret_key: String,
    /// Override: `S3_REGION`
    pub s3_region: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let gateway = GatewayConfig::default();
        let collector = CollectorConfig::default();
        let decisions = DecisionConfig::default();
        let llm = LlmConfig::default();
        let service = TranscriberServiceConfig::default();
        let storage = StorageConfig::default();
        Self {
            enable_gateway: true,
            enable_collector: true,
            enable_decisions: true,
            enable_transcriber_service: false,

            redis_url: collector.redis_url.clone(),
            redis_stream_name: collector.stream_name.clone(),
            redis_consumer_group: collector.consumer_group.clone(),
            pending_msg_timeout_ms: collector.pending_msg_timeout_ms,
            immutability_threshold: collector.immutability_threshold_secs,
            background_task_interval: collector.background_task_interval_secs,
            database_url: collector.database_url,

            gateway_bind: gateway.bind,
            max_clients: gateway.max_clients,
            max_connection_time: gateway.max_connection_time_secs,
            transcriber_backend: "remote".into(),
            transcriber_url: gateway.transcriber_url,
            transcriber_api_key: None,
            transcriber_model: gateway.transcriber_model,

            http_port: decisions.http_port,
            window_segments: decisions.window_segments,
            offset_segments: decisions.offset_segments,
            debounce_ms: decisions.debounce_ms,
            decisions_ttl: decisions.decisions_ttl_secs,
            dedup_jaccard_threshold: decisions.jaccard_threshold,
            dedup_containment_threshold: decisions.containment_threshold,
            decision_confidence_floor: decisions.confidence_floor,
            llm_dedup_enabled: decisions.llm_dedup_enabled,

            llm_model: llm.model,
            llm_base_url: None,
            openai_api_key: String::new(),

            max_concurrent_transcriptions: service.max_concurrent,
            max_queue_size: service.max_queue,
            fail_fast_when_busy: service.fail_fast_when_busy,
            busy_retry_after_s: service.busy_retry_after_s,
            transcriber_service_port: service.port,

            storage_backend: "local".into(),
            storage_local_root: storage.local_root,
            s3_endpoint: storage.s3_endpoint,
            s3_bucket: storage.s3_bucket,
            s3_access_key: storage.s3_access_key,
            s3_secret_key: storage.s3_secret_key,
            s3_region: storage.s3_region,
        }
    }
}

fn env_override<T: std::str::FromStr>(target: &mut T, name: &str) {
    if let Ok(value) = std::env::var(name) {
        if let Ok(parsed) = value.parse() {
            *target = parsed;
        } else {
            log::warn!("Ignoring unparseable {name}={value}");
        }
    }
}

fn env_override_opt(target: &mut Option<String>, name: &str) {
    if let Ok(value) = std::env::var(name) {
        if value.is_empty() {
            *target = None;
        } else {
            *target = Some(value);
        }
    }
}

impl ServerConfig {
    /// Loads configuration from an optional YAML file, then applies
    /// environment overrides, then validates.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: Self = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        env_override(&mut self.redis_url, "REDIS_URL");
        env_override(&mut self.redis_stream_name, "REDIS_STREAM_NAME");
        env_override(&mut self.redis_consumer_group, "REDIS_CONSUMER_GROUP");
        env_override(&mut self.pending_msg_timeout_ms, "PENDING_MSG_TIMEOUT_MS");
        env_override(&mut self.immutability_threshold, "IMMUTABILITY_THRESHOLD");
        env_override(&mut self.background_task_interval, "BACKGROUND_TASK_INTERVAL");
        env_override(&mut self.database_url, "DATABASE_URL");

        env_override(&mut self.gateway_bind, "GATEWAY_BIND");
        env_override(&mut self.max_clients, "MAX_CLIENTS");
        env_override(&mut self.max_connection_time, "MAX_CONNECTION_TIME");
        env_override(&mut self.transcriber_backend, "TRANSCRIBER_BACKEND");
        env_override(&mut self.transcriber_url, "TRANSCRIBER_URL");
        env_override_opt(&mut self.transcriber_api_key, "TRANSCRIBER_API_KEY");
        env_override(&mut self.transcriber_model, "TRANSCRIBER_MODEL");

        env_override(&mut self.http_port, "HTTP_PORT");
        env_override(&mut self.window_segments, "WINDOW_SEGMENTS");
        env_override(&mut self.offset_segments, "OFFSET_SEGMENTS");
        env_override(&mut self.debounce_ms, "DEBOUNCE_MS");
        env_override(&mut self.decisions_ttl, "DECISIONS_TTL");
        env_override(&mut self.dedup_jaccard_threshold, "DEDUP_JACCARD_THRESHOLD");
        env_override(
            &mut self.dedup_containment_threshold,
            "DEDUP_CONTAINMENT_THRESHOLD",
        );
        env_override(
            &mut self.decision_confidence_floor,
            "DECISION_CONFIDENCE_FLOOR",
        );
        env_override(&mut self.llm_dedup_enabled, "LLM_DEDUP_ENABLED");

        env_override(&mut self.llm_model, "LLM_MODEL");
        env_override_opt(&mut self.llm_base_url, "LLM_BASE_URL");
        env_override(&mut self.openai_api_key, "OPENAI_API_KEY");

        env_override(
            &mut self.max_concurrent_transcriptions,
            "MAX_CONCURRENT_TRANSCRIPTIONS",
        );
        env_override(&mut self.max_queue_size, "MAX_QUEUE_SIZE");
        env_override(&mut self.fail_fast_when_busy, "FAIL_FAST_WHEN_BUSY");
        env_override(&mut self.busy_retry_after_s, "BUSY_RETRY_AFTER_S");

        env_override(&mut self.storage_backend, "STORAGE_BACKEND");
        env_override(&mut self.storage_local_root, "STORAGE_LOCAL_ROOT");
        env_override(&mut self.s3_endpoint, "S3_ENDPOINT");
        env_override(&mut self.s3_bucket, "S3_BUCKET");
        env_override(&mut self.s3_access_key, "S3_ACCESS_KEY");
        env_override(&mut self.s3_secret_key, "S3_SECRET_KEY");
        env_override(&mut self.s3_region, "S3_REGION");
    }

    /// Startup validation; failures here exit the process non-zero.
    fn validate(&self) -> Result<()> {
        if !self.enable_gateway
            && !self.enable_collector
            && !self.enable_decisions
            && !self.enable_transcriber_service
        {
            bail!("no subsystem enabled; nothing to run");
        }
        self.transcriber_backend
            .parse::<AsrBackendKind>()
            .map_err(anyhow::Error::msg)?;
        self.storage_backend
            .parse::<StorageBackendKind>()
            .map_err(anyhow::Error::msg)?;
        if self.enable_decisions && self.openai_api_key.is_empty() {
            bail!("decision listener enabled but OPENAI_API_KEY is not set");
        }
        if self.window_segments == 0 {
            bail!("WINDOW_SEGMENTS must be at least 1");
        }
        Ok(())
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            bind: self.gateway_bind,
            redis_url: self.redis_url.clone(),
            stream_name: self.redis_stream_name.clone(),
            max_clients: self.max_clients,
            max_connection_time_secs: self.max_connection_time,
            backend: self
                .transcriber_backend
                .parse()
                .expect("validated at startup"),
            transcriber_url: self.transcriber_url.clone(),
            transcriber_api_key: self.transcriber_api_key.clone(),
            transcriber_model: self.transcriber_model.clone(),
        }
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            redis_url: self.redis_url.clone(),
            stream_name: self.redis_stream_name.clone(),
            consumer_group: self.redis_consumer_group.clone(),
            pending_msg_timeout_ms: self.pending_msg_timeout_ms,
            immutability_threshold_secs: self.immutability_threshold,
            background_task_interval_secs: self.background_task_interval,
            database_url: self.database_url.clone(),
            ..CollectorConfig::default()
        }
    }

    pub fn decision_config(&self) -> DecisionConfig {
        DecisionConfig {
            redis_url: self.redis_url.clone(),
            http_port: self.http_port,
            window_segments: self.window_segments,
            offset_segments: self.offset_segments,
            debounce_ms: self.debounce_ms,
            decisions_ttl_secs: self.decisions_ttl,
            jaccard_threshold: self.dedup_jaccard_threshold,
            containment_threshold: self.dedup_containment_threshold,
            confidence_floor: self.decision_confidence_floor,
            llm_dedup_enabled: self.llm_dedup_enabled,
        }
    }

    pub fn llm_config(&self) -> LlmConfig {
        LlmConfig {
            model: self.llm_model.clone(),
            base_url: self.llm_base_url.clone(),
            api_key: self.openai_api_key.clone(),
            ..LlmConfig::default()
        }
    }

    pub fn transcriber_service_config(&self) -> TranscriberServiceConfig {
        TranscriberServiceConfig {
            port: self.transcriber_service_port,
            max_concurrent: self.max_concurrent_transcriptions,
            max_queue: self.max_queue_size,
            fail_fast_when_busy: self.fail_fast_when_busy,
            busy_retry_after_s: self.busy_retry_after_s,
            api_token: self.transcriber_api_key.clone(),
        }
    }
}
