//! # Inference Collaborators
//!
//! Interfaces to the external engines the relay drives: transcription, text
//! generation, speech synthesis, and the stateful speech-to-speech model behind the
//! duplex session. The relay never implements model weights; it only schedules calls
//! to these opaque collaborators.
//!
//! ## Key Components:
//! - **Transcriber / Generator / Synthesizer**: discrete-turn collaborators
//! - **SpeechToSpeech / ModelStream**: duplex model with fresh state per connection
//! - **Collaborators**: the set of adapters a server instance runs with
//! - **CollaboratorRegistry**: readiness, warm-up, outstanding-call tracking
//!
//! ## Calling Conventions:
//! Every collaborator has `warm()` and a direct async call. The "spawn now, resolve
//! later" form is `ParallelDispatcher::spawn`, which returns a `PendingCall`.
//!
//! ## Adapters:
//! - **remote**: HTTP backends reached with `reqwest`
//! - **loopback**: an echoing speech-to-speech model for running without an accelerator

pub mod loopback;
pub mod registry;
pub mod remote;
pub mod text_stream;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::audio::codec::{AudioCodec, PcmS16Codec};
use crate::audio::frame_buffer::AudioFrame;
use crate::config::AppConfig;
use crate::pipeline::history::HistoryEntry;

pub use registry::{CollaboratorRegistry, CollaboratorStatus, InFlightGuard};

/// Failure raised by a collaborator call.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("collaborator returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid collaborator response: {0}")]
    InvalidResponse(String),

    #[error("inference failed: {0}")]
    Inference(String),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(err: reqwest::Error) -> Self {
        CollaboratorError::Transport(err.to_string())
    }
}

/// Lazy stream of generated words or tokens.
pub type TokenStream = BoxStream<'static, Result<String, CollaboratorError>>;

/// Identifies a collaborator in logs, metrics, and readiness reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorKind {
    Transcriber,
    Generator,
    Synthesizer,
    Duplex,
}

impl CollaboratorKind {
    pub const ALL: [CollaboratorKind; 4] = [
        CollaboratorKind::Transcriber,
        CollaboratorKind::Generator,
        CollaboratorKind::Synthesizer,
        CollaboratorKind::Duplex,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CollaboratorKind::Transcriber => "transcriber",
            CollaboratorKind::Generator => "generator",
            CollaboratorKind::Synthesizer => "synthesizer",
            CollaboratorKind::Duplex => "duplex",
        }
    }
}

impl fmt::Display for CollaboratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Speech to text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn warm(&self) -> Result<(), CollaboratorError>;

    /// Transcribe one encoded audio chunk (e.g. a WAV file).
    async fn transcribe(&self, audio: Vec<u8>) -> Result<String, CollaboratorError>;
}

/// Conversational text generation.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn warm(&self) -> Result<(), CollaboratorError>;

    /// Start generating a reply to `prompt`, returning a lazy stream of words.
    async fn generate(
        &self,
        prompt: &str,
        history: &[HistoryEntry],
    ) -> Result<TokenStream, CollaboratorError>;
}

/// Text to speech.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn warm(&self) -> Result<(), CollaboratorError>;

    /// Synthesize `text`, returning encoded audio bytes.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, CollaboratorError>;
}

/// One typed output of a duplex inference step.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelOutput {
    Audio(Vec<f32>),
    Text(String),
}

/// Stateful speech-to-speech model.
#[async_trait]
pub trait SpeechToSpeech: Send + Sync {
    async fn warm(&self) -> Result<(), CollaboratorError>;

    /// Number of samples the model consumes per step.
    fn frame_size(&self) -> usize;

    fn sample_rate(&self) -> u32;

    /// Open a stream with freshly reset model state. One stream per connection.
    async fn open_stream(&self) -> Result<Box<dyn ModelStream>, CollaboratorError>;
}

/// Per-connection model state.
#[async_trait]
pub trait ModelStream: Send {
    /// Run one inference step. Silence may yield no outputs at all.
    async fn step(&mut self, frame: &AudioFrame) -> Result<Vec<ModelOutput>, CollaboratorError>;
}

/// The adapters one server instance runs with. Cloning is cheap.
#[derive(Clone)]
pub struct Collaborators {
    pub transcriber: Arc<dyn Transcriber>,
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn Synthesizer>,
    pub duplex: Arc<dyn SpeechToSpeech>,
    pub codec: Arc<dyn AudioCodec>,
}

impl Collaborators {
    /// Build the configured adapters.
    ///
    /// ## Returns:
    /// - **Ok**: remote adapters for the turn pipeline, loopback model and PCM codec
    ///   for the duplex session
    /// - **Err**: the HTTP client could not be built
    pub fn from_config(config: &AppConfig) -> Result<Self, CollaboratorError> {
        let client = remote::build_client(&config.collaborators)?;
        let endpoints = &config.collaborators;

        Ok(Self {
            transcriber: Arc::new(remote::RemoteTranscriber::new(
                client.clone(),
                endpoints.transcriber.clone(),
            )),
            generator: Arc::new(remote::RemoteGenerator::new(
                client.clone(),
                endpoints.generator.clone(),
            )),
            synthesizer: Arc::new(remote::RemoteSynthesizer::new(
                client,
                endpoints.synthesizer.clone(),
            )),
            duplex: Arc::new(loopback::LoopbackModel::new(
                config.duplex.frame_size,
                config.duplex.sample_rate,
            )),
            codec: Arc::new(PcmS16Codec::new(config.duplex.sample_rate)),
        })
    }

    /// Issue one warm-up call to the named collaborator.
    pub async fn warm(&self, kind: CollaboratorKind) -> Result<(), CollaboratorError> {
        match kind {
            CollaboratorKind::Transcriber => self.transcriber.warm().await,
            CollaboratorKind::Generator => self.generator.warm().await,
            CollaboratorKind::Synthesizer => self.synthesizer.warm().await,
            CollaboratorKind::Duplex => self.duplex.warm().await,
        }
    }
}
