//! Messages exchanged between a WebSocket connection and the engine serving it.
//!
//! The engines (duplex [`Session`](crate::audio::session::Session) and
//! [`TurnPipeline`](crate::pipeline::turn::TurnPipeline)) never touch the socket. They
//! read [`Inbound`] frames from one bounded channel and write [`Outbound`] frames to
//! another. A closed inbound channel means the client disconnected.

/// A frame received from the client.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Binary(Vec<u8>),
    Text(String),
}

impl Inbound {
    pub fn payload(&self) -> &[u8] {
        match self {
            Inbound::Binary(bytes) => bytes,
            Inbound::Text(text) => text.as_bytes(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payload().is_empty()
    }
}

/// A frame to send to the client, or the instruction to close.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Binary(Vec<u8>),
    Text(String),
    Close(CloseCode),
}

/// How a connection ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// WebSocket 1000
    Normal,

    /// WebSocket 1011
    InternalError,
}

impl CloseCode {
    pub fn code(&self) -> u16 {
        match self {
            CloseCode::Normal => 1000,
            CloseCode::InternalError => 1011,
        }
    }
}
