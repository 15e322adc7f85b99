//! # Frame Buffer
//!
//! Reframes decoded audio of arbitrary chunk sizes into fixed-size inference frames.
//!
//! ## Key Features:
//! - **Arbitrary pushes**: the transport may deliver chunks smaller or larger than a frame
//! - **Exact frames**: every popped frame has exactly `frame_size` samples
//! - **Lossless**: samples are never reordered, dropped, or duplicated; the
//!   unconsumed remainder stays buffered after every pop
//!
//! A `FrameBuffer` is owned by exactly one task (the session's inference loop), so it
//! needs no locking.

use std::collections::VecDeque;

/// One fixed-length window of samples, the unit consumed by one inference step.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame<T = f32> {
    samples: Vec<T>,
}

impl<T> AudioFrame<T> {
    pub fn samples(&self) -> &[T] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn into_samples(self) -> Vec<T> {
        self.samples
    }
}

/// Accumulates samples and hands them out one full frame at a time.
///
/// ## Rust Concepts:
/// - **Generic `T: Copy`**: works for decoded `f32` PCM as well as raw `i16` or bytes
/// - **VecDeque**: cheap append at the back and drain from the front
#[derive(Debug)]
pub struct FrameBuffer<T = f32> {
    pending: VecDeque<T>,
    frame_size: usize,
}

impl<T: Copy> FrameBuffer<T> {
    /// Create an empty buffer producing frames of `frame_size` samples.
    ///
    /// A zero frame size is clamped to one sample so `pop_frame` always makes progress.
    pub fn new(frame_size: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            pending: VecDeque::with_capacity(frame_size * 2),
            frame_size,
        }
    }

    /// Append samples in arrival order.
    pub fn push(&mut self, samples: &[T]) {
        self.pending.extend(samples.iter().copied());
    }

    /// Remove and return the oldest complete frame, if one is buffered.
    ///
    /// ## Returns:
    /// - **Some(frame)**: exactly `frame_size` samples, oldest first
    /// - **None**: fewer than `frame_size` samples are buffered; nothing is consumed
    pub fn pop_frame(&mut self) -> Option<AudioFrame<T>> {
        if self.pending.len() < self.frame_size {
            return None;
        }
        let samples: Vec<T> = self.pending.drain(..self.frame_size).collect();
        Some(AudioFrame { samples })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Number of samples waiting for a full frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// The partial frame still buffered, oldest first.
    pub fn remainder(&self) -> Vec<T> {
        self.pending.iter().copied().collect()
    }

    /// Discard everything buffered. Used on teardown; partial frames never carry over.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
