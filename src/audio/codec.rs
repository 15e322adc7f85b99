//! # Codec Adapter
//!
//! Boundary between the session engine and a streaming audio codec.
//!
//! The engine never does codec math itself. It appends bytes to a decoder and drains
//! whatever PCM is ready, and it appends PCM to an encoder and drains whatever bytes
//! are ready. Both sides use non-blocking "try read" semantics: `None` means
//! "nothing ready yet", never an error.
//!
//! ## Key Components:
//! - **AudioCodec**: factory for fresh decoder/encoder state (one pair per connection)
//! - **StreamDecoder / StreamEncoder**: the two stateful halves
//! - **PcmS16Codec**: raw 16-bit little-endian mono PCM, the codec the relay ships with
//!
//! ## Sample Format:
//! PCM on the engine side is `f32` in `[-1.0, 1.0]`.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::VecDeque;
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("codec rejected input: {0}")]
    InvalidInput(String),

    #[error("codec failure: {0}")]
    Internal(String),
}

/// Creates codec state. Implementations are shared across connections and must not
/// hold per-connection state themselves.
pub trait AudioCodec: Send + Sync {
    fn name(&self) -> &'static str;

    fn sample_rate(&self) -> u32;

    /// Fresh decoder state for one connection.
    fn decoder(&self) -> Box<dyn StreamDecoder>;

    /// Fresh encoder state for one connection.
    fn encoder(&self) -> Box<dyn StreamEncoder>;
}

/// Inbound half: codec bytes in, PCM out.
pub trait StreamDecoder: Send {
    fn append_bytes(&mut self, data: &[u8]) -> Result<(), CodecError>;

    /// Decoded PCM that is ready now, or `None` if nothing is ready.
    fn try_read_pcm(&mut self) -> Option<Vec<f32>>;
}

/// Outbound half: PCM in, codec bytes out.
pub trait StreamEncoder: Send {
    fn append_pcm(&mut self, pcm: &[f32]) -> Result<(), CodecError>;

    /// Encoded bytes that are ready now, or `None` if nothing is ready.
    fn try_read_bytes(&mut self) -> Option<Vec<u8>>;
}

/// Convert 16-bit PCM samples to `f32` in `[-1.0, 1.0]`.
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}

/// Convert `f32` samples back to 16-bit PCM, clamping out-of-range values.
pub fn float_to_pcm(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&sample| (sample * 32768.0).clamp(-32768.0, 32767.0) as i16)
        .collect()
}

/// Raw 16-bit little-endian mono PCM.
#[derive(Debug, Clone)]
pub struct PcmS16Codec {
    sample_rate: u32,
}

impl PcmS16Codec {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }
}

impl AudioCodec for PcmS16Codec {
    fn name(&self) -> &'static str {
        "pcm_s16le"
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(PcmS16Decoder::default())
    }

    fn encoder(&self) -> Box<dyn StreamEncoder> {
        Box::new(PcmS16Encoder::default())
    }
}

/// Decoder state for [`PcmS16Codec`].
///
/// A chunk boundary may split a sample in half; the dangling byte is held until the
/// next append completes it.
#[derive(Debug, Default)]
pub struct PcmS16Decoder {
    carry: Option<u8>,
    ready: VecDeque<f32>,
}

impl StreamDecoder for PcmS16Decoder {
    fn append_bytes(&mut self, data: &[u8]) -> Result<(), CodecError> {
        let mut bytes = Vec::with_capacity(data.len() + 1);
        if let Some(byte) = self.carry.take() {
            bytes.push(byte);
        }
        bytes.extend_from_slice(data);

        if bytes.len() % 2 != 0 {
            self.carry = bytes.pop();
        }

        let mut cursor = Cursor::new(bytes.as_slice());
        let mut samples = Vec::with_capacity(bytes.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }
        self.ready.extend(pcm_to_float(&samples));
        Ok(())
    }

    fn try_read_pcm(&mut self) -> Option<Vec<f32>> {
        if self.ready.is_empty() {
            return None;
        }
        Some(self.ready.drain(..).collect())
    }
}

/// Encoder state for [`PcmS16Codec`].
#[derive(Debug, Default)]
pub struct PcmS16Encoder {
    ready: Vec<u8>,
}

impl StreamEncoder for PcmS16Encoder {
    fn append_pcm(&mut self, pcm: &[f32]) -> Result<(), CodecError> {
        self.ready.reserve(pcm.len() * 2);
        for sample in float_to_pcm(pcm) {
            self.ready
                .write_i16::<LittleEndian>(sample)
                .map_err(|e| CodecError::Internal(e.to_string()))?;
        }
        Ok(())
    }

    fn try_read_bytes(&mut self) -> Option<Vec<u8>> {
        if self.ready.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.ready))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_conversion() {
        let pcm_samples = vec![0i16, 16384, -16384, 32767, -32768];
        let converted_back = float_to_pcm(&pcm_to_float(&pcm_samples));

        for (original, converted) in pcm_samples.iter().zip(converted_back.iter()) {
            let diff = (original - converted).abs();
            assert!(diff <= 1, "Conversion error too large: {} vs {}", original, converted);
        }
    }

    #[test]
    fn test_decoder_nothing_ready() {
        let mut decoder = PcmS16Codec::new(24000).decoder();
        assert!(decoder.try_read_pcm().is_none());
        decoder.append_bytes(&[0x00]).unwrap();
        assert!(decoder.try_read_pcm().is_none());
    }

    /// Test that a sample split across two chunks is reassembled.
    #[test]
    fn test_decoder_carries_split_sample() {
        let mut decoder = PcmS16Codec::new(24000).decoder();
        let bytes = 16384i16.to_le_bytes();

        decoder.append_bytes(&[0, 0, bytes[0]]).unwrap();
        assert_eq!(decoder.try_read_pcm().unwrap(), vec![0.0]);

        decoder.append_bytes(&[bytes[1]]).unwrap();
        assert_eq!(decoder.try_read_pcm().unwrap(), vec![0.5]);
        assert!(decoder.try_read_pcm().is_none());
    }

    #[test]
    fn test_encoder_drains_once() {
        let mut encoder = PcmS16Codec::new(24000).encoder();
        encoder.append_pcm(&[0.5, -0.5]).unwrap();
        let bytes = encoder.try_read_bytes().unwrap();
        assert_eq!(bytes.len(), 4);
        assert_eq!(&bytes[..2], &16384i16.to_le_bytes());
        assert!(encoder.try_read_bytes().is_none());
    }

    #[test]
    fn test_fresh_state_per_decoder() {
        let codec = PcmS16Codec::new(24000);
        let mut first = codec.decoder();
        first.append_bytes(&[0x01]).unwrap();

        let mut second = codec.decoder();
        second.append_bytes(&[0x00, 0x00]).unwrap();
        assert_eq!(second.try_read_pcm().unwrap(), vec![0.0]);
    }
}
