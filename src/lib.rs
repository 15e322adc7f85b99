//! # Voice Relay
//!
//! A voice-chat relay with two conversation modes behind one actix-web server:
//!
//! - **Duplex sessions** (`/ws`): continuous full-duplex audio against a stateful
//!   speech-to-speech model, frame by frame
//! - **Discrete turns** (`/pipeline`): transcribe uploaded chunks, stream a generated
//!   reply, and speak it sentence by sentence
//! - **HTTP turns** (`/transcribe`, `/generate`, `/audio/{call_id}`): the same stages
//!   driven one request at a time by the client
//!
//! ## Module Layout:
//! - **audio**: streaming codec, frame re-chunking, the duplex session engine
//! - **pipeline**: ordered parallel dispatch, sentence chunking, the turn engine
//! - **inference**: collaborator interfaces, remote adapters, readiness registry
//! - **protocol** / **transport**: wire framings and the engine-facing frame types
//! - **websocket** / **handlers** / **health**: the HTTP surface
//! - **config** / **state** / **error**: ambient plumbing

pub mod audio;
pub mod config;
pub mod error;
pub mod handlers;
pub mod health;
pub mod inference;
pub mod pipeline;
pub mod protocol;
pub mod state;
pub mod transport;
pub mod websocket;

#[cfg(test)]
pub(crate) mod testing;
