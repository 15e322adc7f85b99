//! # Turn Pipeline Module
//!
//! The discrete request/response path: transcribe uploaded chunks, stream a reply,
//! split it into sentences, and speak each sentence as soon as its turn comes.
//!
//! ## Key Components:
//! - **Dispatcher**: ordered parallel collaborator calls with pollable handles
//! - **Calls**: synthesis calls parked by id for the HTTP turn routes
//! - **Sentence**: token-stream → sentence-chunk accumulation
//! - **Fillers**: cache of pre-synthesized filler sentences
//! - **History**: conversation history carried by a turn
//! - **Turn**: the per-connection state machine

pub mod calls;
pub mod dispatcher;
pub mod fillers;
pub mod history;
pub mod sentence;
pub mod turn;
