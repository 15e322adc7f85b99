//! # Sentence Accumulator
//!
//! Groups a generated word stream into chunks for speech synthesis.
//!
//! ## Algorithm:
//! 1. Append each word plus a separating space to a running buffer
//! 2. Emit the buffer when the word contains a boundary punctuation mark, or when the
//!    buffer reaches the word cap (depending on [`ChunkPolicy`])
//! 3. When the source ends, emit whatever is left
//!
//! Empty or whitespace-only words are ignored: they never trigger an emission and never
//! add spacing.
//!
//! An accumulator cannot be restarted mid-stream. Build a new one per generation.

use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use futures_util::stream::{Fuse, Stream, StreamExt};

/// Default boundary marks.
pub const DEFAULT_PUNCTUATION: [&str; 6] = [".", "?", "!", ":", ";", "*"];

/// Which boundaries end a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkPolicy {
    /// Only punctuation ends a chunk
    Punctuation,

    /// Only the word cap ends a chunk
    WordCap,

    /// Whichever comes first
    PunctuationOrWordCap,
}

impl ChunkPolicy {
    fn uses_punctuation(self) -> bool {
        matches!(self, ChunkPolicy::Punctuation | ChunkPolicy::PunctuationOrWordCap)
    }

    fn uses_word_cap(self) -> bool {
        matches!(self, ChunkPolicy::WordCap | ChunkPolicy::PunctuationOrWordCap)
    }
}

/// Synchronous core of the accumulator.
#[derive(Debug, Clone)]
pub struct SentenceAccumulator {
    policy: ChunkPolicy,
    punctuation: Vec<String>,
    max_words: usize,
    buffer: String,
    words: usize,
}

impl SentenceAccumulator {
    /// ## Parameters:
    /// - **policy**: which boundaries end a chunk
    /// - **punctuation**: boundary marks; a word containing any of them ends a chunk
    /// - **max_words**: a chunk never holds more than this many words when the policy
    ///   uses the cap
    pub fn new(policy: ChunkPolicy, punctuation: Vec<String>, max_words: usize) -> Self {
        Self {
            policy,
            punctuation,
            max_words: max_words.max(1),
            buffer: String::new(),
            words: 0,
        }
    }

    /// Punctuation-only accumulator with the default marks.
    pub fn with_default_punctuation() -> Self {
        Self::new(
            ChunkPolicy::Punctuation,
            DEFAULT_PUNCTUATION.iter().map(|p| p.to_string()).collect(),
            usize::MAX,
        )
    }

    /// Feed one word. Returns a chunk when this word completes one.
    pub fn push(&mut self, word: &str) -> Option<String> {
        if word.trim().is_empty() {
            return None;
        }

        self.buffer.push_str(word);
        self.buffer.push(' ');
        self.words += 1;

        let at_punctuation = self.policy.uses_punctuation()
            && self.punctuation.iter().any(|mark| word.contains(mark.as_str()));
        let at_cap = self.policy.uses_word_cap() && self.words >= self.max_words;

        if at_punctuation || at_cap {
            self.take()
        } else {
            None
        }
    }

    /// Emit the remaining buffer, if any.
    pub fn finish(&mut self) -> Option<String> {
        self.take()
    }

    fn take(&mut self) -> Option<String> {
        self.words = 0;
        if self.buffer.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.buffer))
    }

    /// Wrap a word stream so it yields chunks instead of words.
    pub fn chunks<S, E>(self, words: S) -> SentenceStream<S>
    where
        S: Stream<Item = Result<String, E>> + Unpin,
    {
        SentenceStream {
            words: words.fuse(),
            accumulator: self,
            done: false,
        }
    }
}

/// Stream of sentence chunks built from a word stream.
///
/// An error from the word stream is passed through and ends the chunk stream.
pub struct SentenceStream<S> {
    words: Fuse<S>,
    accumulator: SentenceAccumulator,
    done: bool,
}

impl<S, E> Stream for SentenceStream<S>
where
    S: Stream<Item = Result<String, E>> + Unpin,
{
    type Item = Result<String, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            match ready!(this.words.poll_next_unpin(cx)) {
                Some(Ok(word)) => {
                    if let Some(chunk) = this.accumulator.push(&word) {
                        return Poll::Ready(Some(Ok(chunk)));
                    }
                }
                Some(Err(e)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.done = true;
                    return Poll::Ready(this.accumulator.finish().map(Ok));
                }
            }
        }
    }
}
