//! In-process collaborator doubles shared by the unit tests.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::audio::codec::PcmS16Codec;
use crate::audio::frame_buffer::AudioFrame;
use crate::inference::{
    CollaboratorError, Collaborators, Generator, ModelOutput, ModelStream, SpeechToSpeech,
    Synthesizer, TokenStream, Transcriber,
};
use crate::pipeline::history::HistoryEntry;

/// Answers `<audio as utf8>-text`; audio `fail` fails.
#[derive(Default)]
pub struct MockTranscriber {
    delays: HashMap<Vec<u8>, Duration>,
    completed: Mutex<Vec<Vec<u8>>>,
}

impl MockTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, audio: &[u8], delay: Duration) -> Self {
        self.delays.insert(audio.to_vec(), delay);
        self
    }

    pub fn completion_order(&self) -> Vec<Vec<u8>> {
        self.completed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn warm(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn transcribe(&self, audio: Vec<u8>) -> Result<String, CollaboratorError> {
        if let Some(delay) = self.delays.get(&audio) {
            tokio::time::sleep(*delay).await;
        }
        self.completed.lock().unwrap().push(audio.clone());
        if audio == b"fail" {
            return Err(CollaboratorError::Inference("unreadable audio".into()));
        }
        Ok(format!("{}-text", String::from_utf8_lossy(&audio)))
    }
}

/// Streams a fixed word list.
#[derive(Default)]
pub struct MockGenerator {
    words: Vec<String>,
    fail_next: AtomicBool,
    history: Mutex<Vec<HistoryEntry>>,
    prompts: Mutex<Vec<String>>,
}

impl MockGenerator {
    pub fn new(words: Vec<&str>) -> Self {
        Self {
            words: words.into_iter().map(str::to_string).collect(),
            ..Self::default()
        }
    }

    pub fn fail_next_generation(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn last_history(&self) -> Vec<HistoryEntry> {
        self.history.lock().unwrap().clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for MockGenerator {
    async fn warm(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }

    async fn generate(
        &self,
        prompt: &str,
        history: &[HistoryEntry],
    ) -> Result<TokenStream, CollaboratorError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        *self.history.lock().unwrap() = history.to_vec();
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CollaboratorError::Unavailable("generator offline".into()));
        }
        Ok(stream::iter(self.words.clone().into_iter().map(Ok)).boxed())
    }
}

/// Answers `audio:<trimmed text>`.
#[derive(Default)]
pub struct MockSynthesizer {
    delays: HashMap<String, Duration>,
    failing: Option<String>,
    calls: AtomicUsize,
    warm_fails: bool,
}

impl MockSynthesizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, text: &str, delay: Duration) -> Self {
        self.delays.insert(text.to_string(), delay);
        self
    }

    pub fn failing_on(mut self, text: &str) -> Self {
        self.failing = Some(text.to_string());
        self
    }

    pub fn failing_warm(mut self) -> Self {
        self.warm_fails = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Synthesizer for MockSynthesizer {
    async fn warm(&self) -> Result<(), CollaboratorError> {
        if self.warm_fails {
            return Err(CollaboratorError::Unavailable("synthesizer offline".into()));
        }
        Ok(())
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let text = text.trim();
        if let Some(delay) = self.delays.get(text) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.as_deref() == Some(text) {
            return Err(CollaboratorError::Inference(format!("cannot speak {}", text)));
        }
        Ok(format!("audio:{}", text).into_bytes())
    }
}

/// Duplex model that echoes each frame and emits a text token `t<step>` per frame.
///
/// The step counter lives in the stream, so a fresh stream starts again at `t1`.
pub struct MockDuplexModel {
    frame_size: usize,
    fail_at_step: Option<u64>,
    fail_open: bool,
    opened: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
}

impl MockDuplexModel {
    pub fn new(frame_size: usize) -> Self {
        Self {
            frame_size,
            fail_at_step: None,
            fail_open: false,
            opened: Arc::new(AtomicUsize::new(0)),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_at_step(mut self, step: u64) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Streams not yet dropped.
    pub fn live_streams(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechToSpeech for MockDuplexModel {
    async fn warm(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn sample_rate(&self) -> u32 {
        24000
    }

    async fn open_stream(&self) -> Result<Box<dyn ModelStream>, CollaboratorError> {
        if self.fail_open {
            return Err(CollaboratorError::Unavailable("duplex model offline".into()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockDuplexStream {
            steps: 0,
            fail_at_step: self.fail_at_step,
            live: self.live.clone(),
        }))
    }
}

struct MockDuplexStream {
    steps: u64,
    fail_at_step: Option<u64>,
    live: Arc<AtomicUsize>,
}

impl Drop for MockDuplexStream {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ModelStream for MockDuplexStream {
    async fn step(&mut self, frame: &AudioFrame) -> Result<Vec<ModelOutput>, CollaboratorError> {
        self.steps += 1;
        if self.fail_at_step == Some(self.steps) {
            return Err(CollaboratorError::Inference("accelerator fault".into()));
        }
        Ok(vec![
            ModelOutput::Text(format!("t{}", self.steps)),
            ModelOutput::Audio(frame.samples().to_vec()),
        ])
    }
}

/// Mocks wired into a [`Collaborators`] set, with typed handles kept for assertions.
pub struct MockSet {
    pub collaborators: Collaborators,
    pub transcriber: Arc<MockTranscriber>,
    pub generator: Arc<MockGenerator>,
    pub synthesizer: Arc<MockSynthesizer>,
    pub duplex: Arc<MockDuplexModel>,
}

pub fn mock_collaborators(
    transcriber: MockTranscriber,
    words: Vec<&str>,
    synthesizer: MockSynthesizer,
) -> MockSet {
    mock_collaborators_with_duplex(transcriber, words, synthesizer, MockDuplexModel::new(4))
}

pub fn mock_collaborators_with_duplex(
    transcriber: MockTranscriber,
    words: Vec<&str>,
    synthesizer: MockSynthesizer,
    duplex: MockDuplexModel,
) -> MockSet {
    let transcriber = Arc::new(transcriber);
    let generator = Arc::new(MockGenerator::new(words));
    let synthesizer = Arc::new(synthesizer);
    let duplex = Arc::new(duplex);

    MockSet {
        collaborators: Collaborators {
            transcriber: transcriber.clone(),
            generator: generator.clone(),
            synthesizer: synthesizer.clone(),
            duplex: duplex.clone(),
            codec: Arc::new(PcmS16Codec::new(24000)),
        },
        transcriber,
        generator,
        synthesizer,
        duplex,
    }
}
