//! # Speech REST API Handlers
//!
//! The plain-HTTP form of a discrete turn, for clients that cannot hold a WebSocket.
//! The client drives each stage itself: transcribe, generate, then fetch each
//! sentence's audio by call id.
//!
//! ## Available Endpoints:
//! - `POST /transcribe` - Transcribe one audio chunk (raw request body)
//! - `POST /generate` - Stream a reply as `\x1e`-separated JSON events
//! - `GET /audio/{call_id}` - Claim the audio of one synthesized sentence
//! - `DELETE /audio/{call_id}` - Cancel a synthesis call
//!
//! ## Generate Events:
//! - `{"type": "text", "value": word}` for every generated word
//! - `{"type": "audio", "value": call_id}` per sentence when `tts` is on; synthesis
//!   starts the moment the sentence is complete
//! - `{"type": "sentence", "value": sentence}` per sentence when `tts` is off
//! - `{"type": "error", "value": message}` if generation fails mid-stream

use actix_web::{web, HttpResponse};
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::inference::{CollaboratorKind, InFlightGuard, Synthesizer, TokenStream};
use crate::pipeline::calls::{AudioCallStore, ClaimError};
use crate::pipeline::dispatcher::{CallError, ParallelDispatcher};
use crate::pipeline::fillers::CachedSynthesizer;
use crate::pipeline::history::HistoryEntry;
use crate::pipeline::sentence::SentenceAccumulator;
use crate::state::AppState;

/// Separates records in the `/generate` stream.
pub const RECORD_SEPARATOR: char = '\x1e';

/// Request body for `POST /generate`.
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub input: String,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// Synthesize each sentence and send call ids instead of sentence text
    #[serde(default)]
    pub tts: bool,
    /// Present: only warm the generator (and the synthesizer when `tts` is set)
    #[serde(default)]
    pub noop: Option<serde_json::Value>,
}

/// One record of the `/generate` stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum GenerateEvent {
    Text(String),
    Sentence(String),
    Audio(String),
    Error(String),
}

impl GenerateEvent {
    fn to_record(&self) -> web::Bytes {
        let mut record = serde_json::to_string(self).unwrap_or_default();
        record.push(RECORD_SEPARATOR);
        web::Bytes::from(record)
    }
}

/// Transcribe one audio chunk.
///
/// ## Endpoint: `POST /transcribe`
///
/// ## Response:
/// ```json
/// { "text": "what is the weather like" }
/// ```
pub async fn transcribe(
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse, AppError> {
    if body.is_empty() {
        return Err(AppError::BadRequest("Audio body is empty".to_string()));
    }

    let transcriber = state.collaborators.transcriber.clone();
    let audio = body.to_vec();
    debug!(bytes = audio.len(), "Transcribing uploaded chunk");

    let text = ParallelDispatcher::new(CollaboratorKind::Transcriber, state.registry.clone())
        .spawn(async move { transcriber.transcribe(audio).await })
        .wait()
        .await?;

    Ok(HttpResponse::Ok().json(json!({ "text": text })))
}

/// Stream a reply to `input`.
///
/// ## Endpoint: `POST /generate`
///
/// ## Request Body:
/// ```json
/// {
///   "input": "tell me a joke",
///   "history": [{ "role": "user", "content": "hi" }],
///   "tts": true
/// }
/// ```
pub async fn generate(
    state: web::Data<AppState>,
    request: web::Json<GenerateRequest>,
) -> Result<HttpResponse, AppError> {
    let request = request.into_inner();

    if request.noop.is_some() {
        warm_in_background(&state, request.tts);
        return Ok(HttpResponse::Ok().finish());
    }

    let busy = state.registry.track(CollaboratorKind::Generator);
    let tokens = state
        .collaborators
        .generator
        .generate(&request.input, &request.history)
        .await?;
    info!(tts = request.tts, history = request.history.len(), "Generating reply");

    let pipeline = &state.config.pipeline;
    let speaker = request.tts.then(|| Speaker {
        synthesis: ParallelDispatcher::new(CollaboratorKind::Synthesizer, state.registry.clone()),
        synthesizer: Arc::new(CachedSynthesizer::new(
            state.collaborators.synthesizer.clone(),
            state.fillers.clone(),
        )),
        calls: state.calls.clone(),
    });

    let generation = Generation {
        tokens: Some(tokens),
        accumulator: SentenceAccumulator::new(
            pipeline.chunking,
            pipeline.punctuation.clone(),
            pipeline.max_words,
        ),
        speaker,
        busy: Some(busy),
    };

    let body = events(generation).map(|event| Ok::<_, actix_web::Error>(event.to_record()));
    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .streaming(body))
}

/// Claim the audio of one sentence.
///
/// ## Endpoint: `GET /audio/{call_id}`
///
/// ## Responses:
/// - **200**: `audio/wav` body; the call id is spent
/// - **202**: still synthesizing; ask again
/// - **204**: synthesis produced no audio
/// - **404**: unknown or expired call id
/// - **410**: the call was cancelled
pub async fn get_audio(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let call_id = path.into_inner();
    let wait = Duration::from_millis(state.config.server.audio_wait_ms);

    match state.calls.claim(&call_id, wait).await {
        Ok(audio) if audio.is_empty() => Ok(HttpResponse::NoContent().finish()),
        Ok(audio) => Ok(HttpResponse::Ok().content_type("audio/wav").body(audio)),
        Err(ClaimError::Call(CallError::Pending)) => Ok(HttpResponse::Accepted().finish()),
        Err(ClaimError::Call(CallError::Cancelled | CallError::Consumed)) => {
            Ok(HttpResponse::Gone().finish())
        }
        Err(ClaimError::NotFound(id)) => Err(AppError::NotFound(format!("No audio call {}", id))),
        Err(ClaimError::Call(e)) => {
            warn!(call_id = %call_id, error = %e, "Synthesis failed");
            Err(e.into())
        }
    }
}

/// Cancel a synthesis call.
///
/// ## Endpoint: `DELETE /audio/{call_id}`
pub async fn cancel_audio(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let call_id = path.into_inner();
    if state.calls.cancel(&call_id).await {
        info!(call_id = %call_id, "Audio call cancelled");
        Ok(HttpResponse::NoContent().finish())
    } else {
        Err(AppError::NotFound(format!("No audio call {}", call_id)))
    }
}

fn warm_in_background(state: &AppState, tts: bool) {
    let mut kinds = vec![CollaboratorKind::Generator];
    if tts {
        kinds.push(CollaboratorKind::Synthesizer);
    }

    for kind in kinds {
        let registry = state.registry.clone();
        let collaborators = state.collaborators.clone();
        tokio::spawn(async move {
            if let Err(e) = registry.warm(&collaborators, kind).await {
                debug!(collaborator = %kind, error = %e, "Background warm-up failed");
            }
        });
    }
}

struct Speaker {
    synthesis: ParallelDispatcher,
    synthesizer: Arc<dyn Synthesizer>,
    calls: AudioCallStore,
}

/// State carried between `/generate` records.
struct Generation {
    tokens: Option<TokenStream>,
    accumulator: SentenceAccumulator,
    speaker: Option<Speaker>,
    /// Keeps the generator counted as busy until the reply is exhausted
    busy: Option<InFlightGuard>,
}

impl Generation {
    async fn speak(&self, sentence: String) -> GenerateEvent {
        let Some(speaker) = &self.speaker else {
            return GenerateEvent::Sentence(sentence);
        };

        let synthesizer = speaker.synthesizer.clone();
        let call = speaker
            .synthesis
            .spawn(async move { synthesizer.synthesize(&sentence).await });
        GenerateEvent::Audio(speaker.calls.insert(call).await)
    }
}

fn events(generation: Generation) -> impl futures_util::Stream<Item = GenerateEvent> {
    stream::unfold(generation, |mut generation| async move {
        let mut tokens = generation.tokens.take()?;

        let events = match tokens.next().await {
            Some(Ok(word)) => {
                let mut events = vec![GenerateEvent::Text(word.clone())];
                if let Some(sentence) = generation.accumulator.push(&word) {
                    events.push(generation.speak(sentence).await);
                }
                generation.tokens = Some(tokens);
                events
            }
            Some(Err(e)) => {
                warn!(error = %e, "Generation failed mid-stream");
                generation.busy = None;
                vec![GenerateEvent::Error(e.to_string())]
            }
            None => {
                generation.busy = None;
                match generation.accumulator.finish() {
                    Some(sentence) => vec![generation.speak(sentence).await],
                    None => Vec::new(),
                }
            }
        };

        Some((stream::iter(events), generation))
    })
    .flatten()
}
