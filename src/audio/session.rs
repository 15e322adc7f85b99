//! # Duplex Session
//!
//! One full-duplex streaming connection against a stateful speech-to-speech model.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: created, nothing running
//! 2. **Streaming**: fresh codec and model state, three loops running
//! 3. **Closing**: one loop ended (disconnect, cancellation, or error); the other two
//!    are cancelled and awaited
//! 4. **Closed**: terminal; a new connection always gets a new `Session`
//!
//! ## Loops:
//! - **Ingest**: client bytes → decoder → PCM channel
//! - **Infer**: PCM channel → [`FrameBuffer`] → model step → PCM channel / text frames
//! - **Emit**: PCM channel → encoder → audio frames
//!
//! Each loop exclusively owns the codec state it touches (decoder, frame buffer and
//! model stream, encoder), so nothing is locked. Every await point also watches the
//! session's cancellation token.
//!
//! ## Failure Semantics:
//! - Client disconnect ends the session normally
//! - Codec or inference failures end it with an internal-error close and are returned
//!   to the caller after teardown; there is no retry within a connection

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::audio::codec::{AudioCodec, CodecError, StreamDecoder, StreamEncoder};
use crate::audio::frame_buffer::FrameBuffer;
use crate::inference::{
    CollaboratorError, CollaboratorKind, CollaboratorRegistry, ModelOutput, ModelStream,
    SpeechToSpeech,
};
use crate::protocol::TaggedMessage;
use crate::transport::{CloseCode, Inbound, Outbound};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Streaming,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Streaming => "streaming",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("model error: {0}")]
    Model(#[from] CollaboratorError),

    #[error("session task failed: {0}")]
    Task(String),
}

/// Why a loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The client went away
    Disconnected,
    /// The upstream channel closed
    Drained,
    /// The session was cancelled
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
struct LoopReport {
    name: &'static str,
    exit: LoopExit,
    bytes_in: u64,
    frames: u64,
    text_tokens: u64,
    audio_packets: u64,
}

impl LoopReport {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            exit: LoopExit::Drained,
            bytes_in: 0,
            frames: 0,
            text_tokens: 0,
            audio_packets: 0,
        }
    }

    fn exit(mut self, exit: LoopExit) -> Self {
        self.exit = exit;
        self
    }
}

/// Counters for one finished session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSummary {
    pub bytes_in: u64,
    pub frames: u64,
    pub text_tokens: u64,
    pub audio_packets: u64,
}

impl SessionSummary {
    fn record(&mut self, report: &LoopReport) {
        self.bytes_in += report.bytes_in;
        self.frames += report.frames;
        self.text_tokens += report.text_tokens;
        self.audio_packets += report.audio_packets;
    }
}

enum Delivery {
    Sent,
    Closed,
    Cancelled,
}

async fn deliver<T>(tx: &mpsc::Sender<T>, value: T, cancel: &CancellationToken) -> Delivery {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Delivery::Cancelled,
        sent = tx.send(value) => match sent {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Closed,
        },
    }
}

pub struct Session {
    id: String,
    model: Arc<dyn SpeechToSpeech>,
    codec: Arc<dyn AudioCodec>,
    registry: Arc<CollaboratorRegistry>,
    channel_capacity: usize,
    state: watch::Sender<SessionState>,
    cancel: CancellationToken,
    created_at: DateTime<Utc>,
}

impl Session {
    /// ## Parameters:
    /// - **id**: session identifier used in logs
    /// - **model**: shared model; the session opens its own stream from it
    /// - **codec**: shared codec factory; the session takes fresh decoder/encoder state
    /// - **registry**: counts the session as an outstanding duplex call while it runs
    /// - **channel_capacity**: bound of the PCM channels between the loops
    pub fn new(
        id: impl Into<String>,
        model: Arc<dyn SpeechToSpeech>,
        codec: Arc<dyn AudioCodec>,
        registry: Arc<CollaboratorRegistry>,
        channel_capacity: usize,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            id: id.into(),
            model,
            codec,
            registry,
            channel_capacity: channel_capacity.max(1),
            state,
            cancel: CancellationToken::new(),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Follow lifecycle transitions from outside the session.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Token that tears the session down when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn set_state(&self, state: SessionState) {
        debug!(session_id = %self.id, state = state.as_str(), "Session state changed");
        self.state.send_replace(state);
    }

    /// Stream until the client disconnects, the session is cancelled, or a loop fails.
    ///
    /// Consumes the session: a closed session cannot be restarted.
    ///
    /// ## Returns:
    /// - **Ok(summary)**: normal end; a normal close was sent
    /// - **Err**: a loop failed; an internal-error close was sent after teardown
    pub async fn run(
        self,
        inbound: mpsc::Receiver<Inbound>,
        outbound: mpsc::Sender<Outbound>,
    ) -> Result<SessionSummary, SessionError> {
        let _busy = self.registry.track(CollaboratorKind::Duplex);

        // Fresh state for this connection only.
        let decoder = self.codec.decoder();
        let encoder = self.codec.encoder();
        let stream = match self.model.open_stream().await {
            Ok(stream) => stream,
            Err(e) => {
                error!(session_id = %self.id, error = %e, "Could not open model stream");
                if outbound
                    .send(Outbound::Close(CloseCode::InternalError))
                    .await
                    .is_err()
                {
                    debug!(session_id = %self.id, "Client gone before close frame");
                }
                self.set_state(SessionState::Closed);
                return Err(e.into());
            }
        };

        let frame_size = self.model.frame_size();
        self.set_state(SessionState::Streaming);
        info!(
            session_id = %self.id,
            codec = self.codec.name(),
            frame_size,
            "Session streaming"
        );

        let (pcm_tx, pcm_rx) = mpsc::channel(self.channel_capacity);
        let (speech_tx, speech_rx) = mpsc::channel(self.channel_capacity);

        let mut loops = JoinSet::new();
        loops.spawn(ingest_loop(
            self.id.clone(),
            inbound,
            decoder,
            pcm_tx,
            self.cancel.clone(),
        ));
        loops.spawn(infer_loop(
            self.id.clone(),
            pcm_rx,
            stream,
            frame_size,
            speech_tx,
            outbound.clone(),
            self.cancel.clone(),
        ));
        loops.spawn(emit_loop(
            self.id.clone(),
            speech_rx,
            encoder,
            outbound.clone(),
            self.cancel.clone(),
        ));

        let mut summary = SessionSummary::default();
        let mut failure: Option<SessionError> = None;

        while let Some(joined) = loops.join_next().await {
            match joined {
                Ok(Ok(report)) => {
                    debug!(session_id = %self.id, name = report.name, exit = ?report.exit, "Loop finished");
                    summary.record(&report);
                }
                Ok(Err(e)) => {
                    error!(session_id = %self.id, error = %e, "Session loop failed");
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    error!(session_id = %self.id, error = %e, "Session loop panicked");
                    failure.get_or_insert(SessionError::Task(e.to_string()));
                }
            }

            // The first loop to end closes the session.
            if self.state() == SessionState::Streaming {
                self.set_state(SessionState::Closing);
                self.cancel.cancel();
            }
        }

        let close = if failure.is_some() {
            CloseCode::InternalError
        } else {
            CloseCode::Normal
        };
        if outbound.send(Outbound::Close(close)).await.is_err() {
            debug!(session_id = %self.id, "Client gone before close frame");
        }
        self.set_state(SessionState::Closed);

        let lifetime = Utc::now() - self.created_at;
        info!(
            session_id = %self.id,
            frames = summary.frames,
            bytes_in = summary.bytes_in,
            lifetime_ms = lifetime.num_milliseconds(),
            "Session closed"
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }
}

async fn ingest_loop(
    session_id: String,
    mut inbound: mpsc::Receiver<Inbound>,
    mut decoder: Box<dyn StreamDecoder>,
    pcm_tx: mpsc::Sender<Vec<f32>>,
    cancel: CancellationToken,
) -> Result<LoopReport, SessionError> {
    let mut report = LoopReport::new("ingest");
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(report.exit(LoopExit::Cancelled)),
            frame = inbound.recv() => frame,
        };

        let bytes = match frame {
            None => {
                info!(session_id = %session_id, "Client disconnected");
                return Ok(report.exit(LoopExit::Disconnected));
            }
            Some(Inbound::Text(_)) => {
                warn!(session_id = %session_id, "Ignoring text frame on duplex session");
                continue;
            }
            Some(Inbound::Binary(bytes)) if bytes.is_empty() => {
                debug!(session_id = %session_id, "Skipping empty frame");
                continue;
            }
            Some(Inbound::Binary(bytes)) => bytes,
        };

        report.bytes_in += bytes.len() as u64;
        decoder.append_bytes(&bytes)?;

        while let Some(pcm) = decoder.try_read_pcm() {
            match deliver(&pcm_tx, pcm, &cancel).await {
                Delivery::Sent => {}
                Delivery::Closed => return Ok(report.exit(LoopExit::Drained)),
                Delivery::Cancelled => return Ok(report.exit(LoopExit::Cancelled)),
            }
        }
    }
}

async fn infer_loop(
    session_id: String,
    mut pcm_rx: mpsc::Receiver<Vec<f32>>,
    mut model: Box<dyn ModelStream>,
    frame_size: usize,
    speech_tx: mpsc::Sender<Vec<f32>>,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
) -> Result<LoopReport, SessionError> {
    let mut report = LoopReport::new("infer");
    let mut frames = FrameBuffer::new(frame_size);

    loop {
        let pcm = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(report.exit(LoopExit::Cancelled)),
            pcm = pcm_rx.recv() => pcm,
        };
        let Some(pcm) = pcm else {
            return Ok(report.exit(LoopExit::Drained));
        };
        frames.push(&pcm);

        while let Some(frame) = frames.pop_frame() {
            let outputs = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(report.exit(LoopExit::Cancelled)),
                outputs = model.step(&frame) => outputs?,
            };
            report.frames += 1;
            trace!(session_id = %session_id, frame = report.frames, outputs = outputs.len(), "Frame inferred");

            for output in outputs {
                let delivery = match output {
                    ModelOutput::Audio(samples) => deliver(&speech_tx, samples, &cancel).await,
                    ModelOutput::Text(text) if text.is_empty() => continue,
                    ModelOutput::Text(text) => {
                        report.text_tokens += 1;
                        let frame = Outbound::Binary(TaggedMessage::Text(text).encode());
                        deliver(&outbound, frame, &cancel).await
                    }
                };
                match delivery {
                    Delivery::Sent => {}
                    Delivery::Closed => return Ok(report.exit(LoopExit::Disconnected)),
                    Delivery::Cancelled => return Ok(report.exit(LoopExit::Cancelled)),
                }
            }
        }
    }
}

async fn emit_loop(
    session_id: String,
    mut speech_rx: mpsc::Receiver<Vec<f32>>,
    mut encoder: Box<dyn StreamEncoder>,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
) -> Result<LoopReport, SessionError> {
    let mut report = LoopReport::new("emit");
    loop {
        let pcm = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(report.exit(LoopExit::Cancelled)),
            pcm = speech_rx.recv() => pcm,
        };
        let Some(pcm) = pcm else {
            return Ok(report.exit(LoopExit::Drained));
        };
        encoder.append_pcm(&pcm)?;

        while let Some(bytes) = encoder.try_read_bytes() {
            if bytes.is_empty() {
                continue;
            }
            let frame = Outbound::Binary(TaggedMessage::Audio(bytes).encode());
            match deliver(&outbound, frame, &cancel).await {
                Delivery::Sent => report.audio_packets += 1,
                Delivery::Closed => return Ok(report.exit(LoopExit::Disconnected)),
                Delivery::Cancelled => return Ok(report.exit(LoopExit::Cancelled)),
            }
        }
        trace!(session_id = %session_id, packets = report.audio_packets, "Audio emitted");
    }
}
