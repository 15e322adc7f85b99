//! # Audio Module
//!
//! Everything the duplex path does to audio between the socket and the model.
//!
//! ## Key Components:
//! - **Codec**: streaming bytes ↔ PCM conversion with per-connection state
//! - **Frame Buffer**: re-chunks arbitrary PCM pushes into fixed model frames
//! - **Session**: the duplex engine that ties codec, frame buffer and model together
//!
//! ## Default Audio Format:
//! - **Sample Rate**: 24kHz
//! - **Bit Depth**: 16-bit PCM, little-endian
//! - **Channels**: Mono

pub mod codec; // Streaming codec contract and raw PCM implementation
pub mod frame_buffer; // Fixed-size frame re-chunking
pub mod session; // Duplex session engine
