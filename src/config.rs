//! # Configuration Management
//!
//! Loads relay configuration from layered sources:
//! - Built-in defaults (every field has one)
//! - An optional `config.toml` (or any `config.*` format) in the working directory
//! - Environment variables with the `APP_` prefix and `__` between nested keys
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_DUPLEX__FRAME_SIZE`, ...)
//! 3. Configuration file
//! 4. Default values

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

use crate::pipeline::sentence::{ChunkPolicy, DEFAULT_PUNCTUATION};

/// Complete relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub duplex: DuplexConfig,
    pub pipeline: PipelineConfig,
    pub collaborators: CollaboratorsConfig,
    pub fillers: FillersConfig,
    pub performance: PerformanceConfig,
}

/// HTTP listener and WebSocket keep-alive settings.
///
/// ## Fields:
/// - `host`, `port`: bind address
/// - `heartbeat_interval_secs`: how often the server pings each socket
/// - `client_timeout_secs`: silence after which a socket is dropped
/// - `max_frame_bytes`: largest inbound WebSocket frame; a whole base64 `wav` chunk
///   must fit in one
/// - `inbound_queue_frames`: client frames allowed to wait for the engine before the
///   connection is closed with an internal error
/// - `audio_call_ttl_secs`: how long an unclaimed `/audio/{call_id}` result is kept
/// - `audio_wait_ms`: how long `GET /audio/{call_id}` waits before answering 202
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub max_frame_bytes: usize,
    pub inbound_queue_frames: usize,
    pub audio_call_ttl_secs: u64,
    pub audio_wait_ms: u64,
}

/// Duplex session settings.
///
/// `frame_size` is in samples and must match what the speech-to-speech model expects.
/// `channel_capacity` bounds the queues between the session loops and the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplexConfig {
    pub frame_size: usize,
    pub sample_rate: u32,
    pub channel_capacity: usize,
}

/// Discrete turn settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Which boundaries end a spoken sentence
    pub chunking: ChunkPolicy,
    pub punctuation: Vec<String>,
    pub max_words: usize,
    /// How often the head of the synthesis queue is checked while the reply streams
    pub poll_interval_ms: u64,
}

/// One remote collaborator.
///
/// An empty `warm_url` makes warm-up a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub url: String,
    pub warm_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaboratorsConfig {
    pub transcriber: EndpointConfig,
    pub generator: EndpointConfig,
    pub synthesizer: EndpointConfig,
    pub connect_timeout_secs: u64,
    /// Outstanding calls allowed per collaborator; 0 means unlimited
    pub max_in_flight: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FillersConfig {
    pub prefill_on_prewarm: bool,
    pub sentences: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    /// Open WebSocket connections (both endpoints together)
    pub max_concurrent_sessions: usize,
}

fn endpoint(port: u16, path: &str) -> EndpointConfig {
    EndpointConfig {
        url: format!("http://127.0.0.1:{}/{}", port, path),
        warm_url: format!("http://127.0.0.1:{}/warm", port),
        request_timeout_secs: 60,
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                heartbeat_interval_secs: 5,
                client_timeout_secs: 30,
                max_frame_bytes: 16 * 1024 * 1024,
                inbound_queue_frames: 256,
                audio_call_ttl_secs: 300,
                audio_wait_ms: 30_000,
            },
            duplex: DuplexConfig {
                frame_size: 1920, // 80ms at 24kHz
                sample_rate: 24000,
                channel_capacity: 32,
            },
            pipeline: PipelineConfig {
                chunking: ChunkPolicy::PunctuationOrWordCap,
                punctuation: DEFAULT_PUNCTUATION.iter().map(|p| p.to_string()).collect(),
                max_words: 30,
                poll_interval_ms: 10,
            },
            collaborators: CollaboratorsConfig {
                transcriber: endpoint(9001, "transcribe"),
                generator: endpoint(9002, "generate"),
                synthesizer: endpoint(9003, "synthesize"),
                connect_timeout_secs: 5,
                max_in_flight: 0,
            },
            fillers: FillersConfig {
                prefill_on_prewarm: false,
                sentences: vec![
                    "Let me think about that.".to_string(),
                    "Sure.".to_string(),
                    "Okay.".to_string(),
                ],
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 16,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`
    /// - `APP_PIPELINE__CHUNKING=punctuation`
    /// - `APP_COLLABORATORS__GENERATOR__URL=http://llm:8000/generate`
    /// - `PORT=3000`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values the engines cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.max_frame_bytes < 1024 {
            return Err(anyhow::anyhow!("Max frame size must be at least 1024 bytes"));
        }

        if self.server.inbound_queue_frames == 0 {
            return Err(anyhow::anyhow!("Inbound queue must hold at least one frame"));
        }

        if self.server.audio_call_ttl_secs == 0 {
            return Err(anyhow::anyhow!("Audio call TTL must be greater than 0"));
        }

        if self.server.audio_wait_ms == 0 {
            return Err(anyhow::anyhow!("Audio wait must be greater than 0"));
        }

        if self.duplex.frame_size == 0 {
            return Err(anyhow::anyhow!("Duplex frame size must be greater than 0"));
        }

        if self.duplex.sample_rate == 0 {
            return Err(anyhow::anyhow!("Duplex sample rate must be greater than 0"));
        }

        if self.duplex.channel_capacity == 0 {
            return Err(anyhow::anyhow!("Duplex channel capacity must be greater than 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        let pipeline = &self.pipeline;
        let uses_punctuation = matches!(
            pipeline.chunking,
            ChunkPolicy::Punctuation | ChunkPolicy::PunctuationOrWordCap
        );
        if uses_punctuation && pipeline.punctuation.iter().all(|p| p.is_empty()) {
            return Err(anyhow::anyhow!(
                "Punctuation set cannot be empty when chunking on punctuation"
            ));
        }

        let uses_word_cap = matches!(
            pipeline.chunking,
            ChunkPolicy::WordCap | ChunkPolicy::PunctuationOrWordCap
        );
        if uses_word_cap && pipeline.max_words == 0 {
            return Err(anyhow::anyhow!(
                "Word cap must be greater than 0 when chunking on word count"
            ));
        }

        if pipeline.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("Poll interval must be greater than 0"));
        }

        Ok(())
    }
}
