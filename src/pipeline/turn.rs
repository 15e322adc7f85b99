//! # Turn Pipeline
//!
//! Orchestrates one discrete conversational turn over a JSON-framed connection.
//!
//! ## Flow:
//! 1. **AwaitingInput**: each `wav` chunk is sent to transcription the moment it
//!    arrives; `history` entries are appended; `end` closes the input
//! 2. **Transcribing**: join the transcriptions in submission order, join with single
//!    spaces, send the `transcript`
//! 3. **Generating**: stream the reply, group it into sentences, synthesize the
//!    sentences concurrently, send `text` then `wav` per sentence in sentence order
//! 4. **Draining**: the reply is exhausted; close normally
//!
//! ## Failure Handling:
//! - A failed chunk transcription contributes an empty string
//! - A generation or synthesis failure aborts the turn with an internal-error close
//! - Unknown message types are logged and skipped
//! - A disconnect or cancellation aborts every outstanding call

use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::inference::{
    CollaboratorError, CollaboratorKind, CollaboratorRegistry, Collaborators, Generator,
    Synthesizer, Transcriber,
};
use crate::pipeline::dispatcher::{CallError, ParallelDispatcher, PendingCall};
use crate::pipeline::fillers::{CachedSynthesizer, FillerCache};
use crate::pipeline::history::{ConversationHistory, HistoryEntry};
use crate::pipeline::sentence::{ChunkPolicy, SentenceAccumulator};
use crate::protocol::{ClientMessage, ProtocolCodec, ProtocolError, ServerMessage};
use crate::transport::{CloseCode, Inbound, Outbound};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingInput,
    Transcribing,
    Generating,
    Draining,
    Done,
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("generation failed: {0}")]
    Generation(#[source] CollaboratorError),

    #[error("reply failed: {0}")]
    Reply(#[source] CallError),
}

impl TurnError {
    /// Malformed client input is a transport problem, not a server fault.
    pub fn close_code(&self) -> CloseCode {
        match self {
            TurnError::Protocol(_) => CloseCode::Normal,
            TurnError::Generation(_) | TurnError::Reply(_) => CloseCode::InternalError,
        }
    }
}

/// How a turn ended without an error.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    Completed(TurnSummary),
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnSummary {
    pub chunks: usize,
    pub transcript: String,
    pub sentences: usize,
    pub reply: String,
}

/// Tunables for one turn.
#[derive(Debug, Clone)]
pub struct TurnSettings {
    pub chunk_policy: ChunkPolicy,
    pub punctuation: Vec<String>,
    pub max_words: usize,
    /// Slice length used while waiting on a transcription, between cancellation checks.
    pub poll_interval: Duration,
}

impl TurnSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            chunk_policy: config.chunking,
            punctuation: config.punctuation.clone(),
            max_words: config.max_words,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
        }
    }

    fn accumulator(&self) -> SentenceAccumulator {
        SentenceAccumulator::new(self.chunk_policy, self.punctuation.clone(), self.max_words)
    }
}

pub struct TurnPipeline {
    id: String,
    transcriber: Arc<dyn Transcriber>,
    generator: Arc<dyn Generator>,
    synthesizer: Arc<dyn Synthesizer>,
    transcription: ParallelDispatcher,
    synthesis: ParallelDispatcher,
    registry: Arc<CollaboratorRegistry>,
    settings: TurnSettings,
    history: ConversationHistory,
    state: TurnState,
}

impl TurnPipeline {
    /// Build a turn with fresh history.
    ///
    /// Synthesis goes through the shared filler cache.
    pub fn new(
        id: impl Into<String>,
        collaborators: &Collaborators,
        registry: Arc<CollaboratorRegistry>,
        fillers: FillerCache,
        settings: TurnSettings,
    ) -> Self {
        let transcription = ParallelDispatcher::new(CollaboratorKind::Transcriber, registry.clone());
        let synthesis = ParallelDispatcher::new(CollaboratorKind::Synthesizer, registry.clone());

        Self {
            id: id.into(),
            transcriber: collaborators.transcriber.clone(),
            generator: collaborators.generator.clone(),
            synthesizer: Arc::new(CachedSynthesizer::new(
                collaborators.synthesizer.clone(),
                fillers,
            )),
            transcription,
            synthesis,
            registry,
            settings,
            history: ConversationHistory::new(),
            state: TurnState::AwaitingInput,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    /// Run the turn to completion, then send the close frame.
    ///
    /// ## Returns:
    /// - **Ok(Completed)**: every sentence was sent; closed with the normal code
    /// - **Ok(Disconnected)**: the client left or the turn was cancelled
    /// - **Err**: the turn aborted; closed with the code from [`TurnError::close_code`]
    pub async fn run(
        &mut self,
        mut inbound: mpsc::Receiver<Inbound>,
        outbound: mpsc::Sender<Outbound>,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        info!(turn_id = %self.id, "Turn started");
        let result = self.drive(&mut inbound, &outbound, &cancel).await;

        let close = match &result {
            Ok(_) => CloseCode::Normal,
            Err(e) => {
                error!(turn_id = %self.id, error = %e, "Turn aborted");
                e.close_code()
            }
        };
        if outbound.send(Outbound::Close(close)).await.is_err() {
            debug!(turn_id = %self.id, "Client gone before close frame");
        }
        self.state = TurnState::Done;

        if let Ok(TurnOutcome::Completed(summary)) = &result {
            info!(
                turn_id = %self.id,
                chunks = summary.chunks,
                sentences = summary.sentences,
                "Turn completed"
            );
        }
        result
    }

    async fn drive(
        &mut self,
        inbound: &mut mpsc::Receiver<Inbound>,
        outbound: &mpsc::Sender<Outbound>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, TurnError> {
        // Step 1: collect input, dispatching transcriptions as chunks arrive
        let Some(calls) = self.collect_input(inbound, cancel).await? else {
            return Ok(TurnOutcome::Disconnected);
        };
        let chunks = calls.len();

        // Step 2: ordered join into one transcript
        self.state = TurnState::Transcribing;
        let Some(transcript) = self.join_transcript(calls, cancel).await else {
            return Ok(TurnOutcome::Disconnected);
        };
        info!(turn_id = %self.id, chunks, transcript = %transcript, "Transcript ready");
        if !send(outbound, ServerMessage::Transcript(transcript.clone()), cancel).await {
            return Ok(TurnOutcome::Disconnected);
        }

        // Step 3: generation; the generator stays busy until its stream is exhausted
        self.state = TurnState::Generating;
        let generation = self.registry.track(CollaboratorKind::Generator);
        let tokens = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(TurnOutcome::Disconnected),
            tokens = self.generator.generate(&transcript, self.history.entries()) => {
                tokens.map_err(TurnError::Generation)?
            }
        };

        // Step 4 and 5: sentences, concurrent synthesis, ordered emission
        let sentences = self.settings.accumulator().chunks(tokens);
        let synthesizer = self.synthesizer.clone();
        let mut replies = Box::pin(self.synthesis.try_map_ordered(sentences, move |text: String| {
            let synthesizer = synthesizer.clone();
            async move { synthesizer.synthesize(&text).await }
        }));

        let mut reply = String::new();
        let mut sentences = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(TurnOutcome::Disconnected),
                next = replies.next() => next,
            };
            let Some(pair) = next else { break };
            let (text, audio) = pair.map_err(TurnError::Reply)?;

            debug!(turn_id = %self.id, sentence = sentences, bytes = audio.len(), "Sentence ready");
            if !send(outbound, ServerMessage::Text(text.clone()), cancel).await
                || !send(outbound, ServerMessage::Wav(audio), cancel).await
            {
                return Ok(TurnOutcome::Disconnected);
            }
            reply.push_str(&text);
            sentences += 1;
        }

        // Step 6: drain
        drop(generation);
        self.state = TurnState::Draining;
        let reply = reply.trim_end().to_string();
        self.history.append(HistoryEntry::user(transcript.clone()));
        self.history.append(HistoryEntry::assistant(reply.clone()));

        Ok(TurnOutcome::Completed(TurnSummary {
            chunks,
            transcript,
            sentences,
            reply,
        }))
    }

    /// Read client messages until `end`.
    ///
    /// Returns `None` when the client disconnects first; pending calls are dropped
    /// and therefore aborted.
    async fn collect_input(
        &mut self,
        inbound: &mut mpsc::Receiver<Inbound>,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<PendingCall<String>>>, TurnError> {
        let mut calls = Vec::new();
        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                frame = inbound.recv() => frame,
            };
            let Some(frame) = frame else {
                debug!(turn_id = %self.id, "Client disconnected before end of turn");
                return Ok(None);
            };

            match ProtocolCodec::decode_client(frame.payload()) {
                Ok(ClientMessage::Wav(audio)) => {
                    debug!(turn_id = %self.id, chunk = calls.len(), bytes = audio.len(), "Audio chunk received");
                    let transcriber = self.transcriber.clone();
                    calls.push(
                        self.transcription
                            .spawn(async move { transcriber.transcribe(audio).await }),
                    );
                }
                Ok(ClientMessage::History(entries)) => {
                    debug!(turn_id = %self.id, entries = entries.len(), "History received");
                    self.history.extend(entries);
                }
                Ok(ClientMessage::End) => return Ok(Some(calls)),
                Err(ProtocolError::UnknownType(kind)) => {
                    warn!(turn_id = %self.id, kind = %kind, "Ignoring unknown message type");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn join_transcript(
        &self,
        calls: Vec<PendingCall<String>>,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let mut parts = Vec::with_capacity(calls.len());
        for call in calls {
            let index = call.index();
            match call.wait_cancellable(self.settings.poll_interval, cancel).await {
                Ok(text) => parts.push(text),
                Err(CallError::Cancelled) if cancel.is_cancelled() => return None,
                Err(e) => {
                    warn!(turn_id = %self.id, chunk = index, error = %e, "Transcription failed, using empty text");
                    parts.push(String::new());
                }
            }
        }
        Some(parts.join(" "))
    }
}

/// Send one message. `false` means the client is gone or the turn was cancelled.
async fn send(
    outbound: &mpsc::Sender<Outbound>,
    message: ServerMessage,
    cancel: &CancellationToken,
) -> bool {
    let frame = Outbound::Text(ProtocolCodec::encode_server(&message));
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = outbound.send(frame) => sent.is_ok(),
    }
}
