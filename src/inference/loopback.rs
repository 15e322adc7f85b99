//! Echoing speech-to-speech model.
//!
//! Returns every frame it receives as audio output. It lets the duplex session run end
//! to end without an accelerator and is the default duplex collaborator.

use async_trait::async_trait;
use tracing::trace;

use super::{CollaboratorError, ModelOutput, ModelStream, SpeechToSpeech};
use crate::audio::frame_buffer::{AudioFrame, FrameBuffer};

#[derive(Debug, Clone)]
pub struct LoopbackModel {
    frame_size: usize,
    sample_rate: u32,
}

impl LoopbackModel {
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        Self {
            frame_size,
            sample_rate,
        }
    }
}

#[async_trait]
impl SpeechToSpeech for LoopbackModel {
    async fn warm(&self) -> Result<(), CollaboratorError> {
        let mut stream = self.open_stream().await?;
        let silence = vec![0.0; self.frame_size];
        let mut buffer = FrameBuffer::new(self.frame_size);
        buffer.push(&silence);
        if let Some(frame) = buffer.pop_frame() {
            stream.step(&frame).await?;
        }
        Ok(())
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn open_stream(&self) -> Result<Box<dyn ModelStream>, CollaboratorError> {
        Ok(Box::new(LoopbackStream {
            frame_size: self.frame_size,
            steps: 0,
        }))
    }
}

/// Per-connection state: only a step counter.
#[derive(Debug)]
pub struct LoopbackStream {
    frame_size: usize,
    steps: u64,
}

#[async_trait]
impl ModelStream for LoopbackStream {
    async fn step(&mut self, frame: &AudioFrame) -> Result<Vec<ModelOutput>, CollaboratorError> {
        if frame.len() != self.frame_size {
            return Err(CollaboratorError::Inference(format!(
                "expected {} samples, got {}",
                self.frame_size,
                frame.len()
            )));
        }
        self.steps += 1;
        trace!(step = self.steps, "Loopback step");

        // Silence produces nothing.
        if frame.samples().iter().all(|sample| *sample == 0.0) {
            return Ok(Vec::new());
        }
        Ok(vec![ModelOutput::Audio(frame.samples().to_vec())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echoes_frames() {
        let model = LoopbackModel::new(4, 24000);
        let mut stream = model.open_stream().await.unwrap();
        let mut buffer = FrameBuffer::new(4);
        buffer.push(&[0.1, 0.2, 0.3, 0.4]);
        let frame = buffer.pop_frame().unwrap();

        let outputs = stream.step(&frame).await.unwrap();
        assert_eq!(outputs, vec![ModelOutput::Audio(vec![0.1, 0.2, 0.3, 0.4])]);
    }

    #[tokio::test]
    async fn test_silence_yields_nothing() {
        let model = LoopbackModel::new(2, 24000);
        assert!(model.warm().await.is_ok());

        let mut stream = model.open_stream().await.unwrap();
        let mut buffer = FrameBuffer::new(2);
        buffer.push(&[0.0, 0.0]);
        let outputs = stream.step(&buffer.pop_frame().unwrap()).await.unwrap();
        assert!(outputs.is_empty());
    }
}
