//! Turns a streamed byte body into whole words.
//!
//! A network chunk can end in the middle of a multi-byte UTF-8 sequence. Incomplete
//! sequences are held back until the rest arrives and invalid bytes are skipped, so
//! a replacement character is never produced.

use futures_util::stream::{self, Stream, StreamExt};
use std::fmt::Display;

use super::CollaboratorError;

/// Incremental UTF-8 decoder.
#[derive(Debug, Default)]
pub struct Utf8Accumulator {
    pending: Vec<u8>,
}

impl Utf8Accumulator {
    /// Append bytes and return every complete character decoded so far.
    pub fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    // The prefix was just validated.
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        // Incomplete sequence at the end: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                        Some(invalid) => {
                            self.pending.drain(..valid + invalid);
                        }
                    }
                }
            }
        }
        out
    }

    /// Bytes held back waiting for the rest of a sequence.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Splits decoded text into whitespace-separated words.
///
/// A word is only yielded once the whitespace after it has arrived; `finish`
/// returns the last word.
#[derive(Debug, Default)]
pub struct WordSplitter {
    decoder: Utf8Accumulator,
    partial: String,
}

impl WordSplitter {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let text = self.decoder.push(bytes);
        self.partial.push_str(&text);

        let mut words = Vec::new();
        while let Some(index) = self.partial.find(char::is_whitespace) {
            let word: String = self.partial.drain(..index).collect();
            // Drop the separator itself.
            let separator = self.partial.chars().next().map(char::len_utf8).unwrap_or(0);
            self.partial.drain(..separator);
            if !word.is_empty() {
                words.push(word);
            }
        }
        words
    }

    pub fn finish(self) -> Option<String> {
        let word = self.partial.trim();
        if word.is_empty() {
            None
        } else {
            Some(word.to_string())
        }
    }
}

/// Adapt a stream of byte chunks into a stream of words.
pub fn words_from_bytes<S, B, E>(body: S) -> impl Stream<Item = Result<String, CollaboratorError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    stream::unfold(
        (body, Some(WordSplitter::default())),
        |(mut body, mut splitter)| async move {
            let active = splitter.as_mut()?;
            match body.next().await {
                Some(Ok(chunk)) => {
                    let words = active.push(chunk.as_ref());
                    let items: Vec<Result<String, CollaboratorError>> =
                        words.into_iter().map(Ok).collect();
                    Some((stream::iter(items), (body, splitter)))
                }
                Some(Err(e)) => {
                    let failure = CollaboratorError::Transport(e.to_string());
                    Some((stream::iter(vec![Err(failure)]), (body, None)))
                }
                None => {
                    let last = splitter.take().and_then(WordSplitter::finish);
                    Some((stream::iter(last.into_iter().map(Ok).collect::<Vec<_>>()), (body, None)))
                }
            }
        },
    )
    .flatten()
}
