//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## Contents:
//! - **config**: immutable after startup, so a plain `Arc`
//! - **collaborators**: the transcriber, generator, synthesizer, duplex model and codec
//! - **registry**: collaborator warm-up status and outstanding-call counts
//! - **fillers**: the filler-sentence cache, injected here rather than held globally
//! - **calls**: synthesis calls waiting to be claimed through `/audio/{call_id}`
//! - **metrics**: lock-free counters updated by the engines
//!
//! Every field is cheap to clone (`Arc` or a handle around one), so actix can clone
//! `AppState` into each worker.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::audio::session::{Session, SessionSummary};
use crate::config::AppConfig;
use crate::inference::{CollaboratorError, CollaboratorRegistry, Collaborators};
use crate::pipeline::calls::AudioCallStore;
use crate::pipeline::fillers::FillerCache;
use crate::pipeline::turn::{TurnPipeline, TurnSettings, TurnSummary};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub collaborators: Collaborators,
    pub registry: Arc<CollaboratorRegistry>,
    pub fillers: FillerCache,
    pub calls: AudioCallStore,
    pub metrics: Arc<RelayMetrics>,
    pub start_time: Instant,
}

/// Relay-wide counters.
///
/// `active_sessions` counts open WebSocket connections on both endpoints and is
/// also the admission counter.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    active_sessions: AtomicUsize,
    sessions_started: AtomicU64,
    sessions_failed: AtomicU64,
    sessions_rejected: AtomicU64,
    turns_completed: AtomicU64,
    turns_failed: AtomicU64,
    frames_inferred: AtomicU64,
    sentences_synthesized: AtomicU64,
}

/// Point-in-time copy of [`RelayMetrics`] for the metrics endpoint.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MetricsSnapshot {
    pub active_sessions: usize,
    pub sessions_started: u64,
    pub sessions_failed: u64,
    pub sessions_rejected: u64,
    pub turns_completed: u64,
    pub turns_failed: u64,
    pub frames_inferred: u64,
    pub sentences_synthesized: u64,
}

/// One admitted connection. Dropping it frees the slot.
#[derive(Debug)]
pub struct SessionSlot {
    metrics: Arc<RelayMetrics>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.metrics.active_sessions.fetch_sub(1, Ordering::AcqRel);
    }
}

impl RelayMetrics {
    /// Take a connection slot if fewer than `max` are open.
    pub fn try_admit(self: &Arc<Self>, max: usize) -> Option<SessionSlot> {
        let admitted = self
            .active_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < max).then_some(active + 1)
            })
            .is_ok();

        if admitted {
            self.sessions_started.fetch_add(1, Ordering::Relaxed);
            Some(SessionSlot {
                metrics: self.clone(),
            })
        } else {
            self.sessions_rejected.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Acquire)
    }

    pub fn session_completed(&self, summary: &SessionSummary) {
        self.frames_inferred
            .fetch_add(summary.frames, Ordering::Relaxed);
    }

    pub fn session_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn turn_completed(&self, summary: &TurnSummary) {
        self.turns_completed.fetch_add(1, Ordering::Relaxed);
        self.sentences_synthesized
            .fetch_add(summary.sentences as u64, Ordering::Relaxed);
    }

    pub fn turn_failed(&self) {
        self.turns_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_sessions: self.active_sessions.load(Ordering::Acquire),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            sessions_failed: self.sessions_failed.load(Ordering::Relaxed),
            sessions_rejected: self.sessions_rejected.load(Ordering::Relaxed),
            turns_completed: self.turns_completed.load(Ordering::Relaxed),
            turns_failed: self.turns_failed.load(Ordering::Relaxed),
            frames_inferred: self.frames_inferred.load(Ordering::Relaxed),
            sentences_synthesized: self.sentences_synthesized.load(Ordering::Relaxed),
        }
    }
}

impl AppState {
    /// Build state with the collaborators described by `config`.
    pub fn new(config: AppConfig) -> Result<Self, CollaboratorError> {
        let collaborators = Collaborators::from_config(&config)?;
        Ok(Self::with_collaborators(config, collaborators))
    }

    /// Build state around an already assembled collaborator set.
    pub fn with_collaborators(config: AppConfig, collaborators: Collaborators) -> Self {
        let registry = CollaboratorRegistry::with_max_in_flight(config.collaborators.max_in_flight);
        let calls = AudioCallStore::new(Duration::from_secs(config.server.audio_call_ttl_secs));
        Self {
            config: Arc::new(config),
            collaborators,
            registry: Arc::new(registry),
            fillers: FillerCache::new(),
            calls,
            metrics: Arc::new(RelayMetrics::default()),
            start_time: Instant::now(),
        }
    }

    /// Admission control for new WebSocket connections.
    pub fn admit(&self) -> Option<SessionSlot> {
        self.metrics
            .try_admit(self.config.performance.max_concurrent_sessions)
    }

    /// A fresh duplex session for one connection.
    pub fn new_session(&self) -> Session {
        Session::new(
            Uuid::new_v4().to_string(),
            self.collaborators.duplex.clone(),
            self.collaborators.codec.clone(),
            self.registry.clone(),
            self.config.duplex.channel_capacity,
        )
    }

    /// A fresh turn pipeline for one connection.
    pub fn new_turn(&self) -> TurnPipeline {
        let settings = TurnSettings::from_config(&self.config.pipeline);
        TurnPipeline::new(
            Uuid::new_v4().to_string(),
            &self.collaborators,
            self.registry.clone(),
            self.fillers.clone(),
            settings,
        )
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mock_collaborators, MockSynthesizer, MockTranscriber};

    fn state(max_sessions: usize) -> AppState {
        let mut config = AppConfig::default();
        config.performance.max_concurrent_sessions = max_sessions;
        let mocks = mock_collaborators(MockTranscriber::new(), vec![], MockSynthesizer::new());
        AppState::with_collaborators(config, mocks.collaborators)
    }

    /// Test that admission stops at the configured limit and slots are returned on drop.
    #[test]
    fn test_admission_limit() {
        let state = state(2);
        let first = state.admit().unwrap();
        let _second = state.admit().unwrap();
        assert!(state.admit().is_none());
        assert_eq!(state.metrics.active_sessions(), 2);

        drop(first);
        assert_eq!(state.metrics.active_sessions(), 1);
        assert!(state.admit().is_some());

        let snapshot = state.metrics.snapshot();
        assert_eq!(snapshot.sessions_started, 3);
        assert_eq!(snapshot.sessions_rejected, 1);
    }

    #[test]
    fn test_record_outcomes() {
        let metrics = RelayMetrics::default();
        let summary = SessionSummary {
            frames: 12,
            ..SessionSummary::default()
        };
        metrics.session_completed(&summary);
        metrics.session_failed();
        metrics.turn_completed(&TurnSummary {
            chunks: 1,
            transcript: "hi".into(),
            sentences: 2,
            reply: "Hello. Bye.".into(),
        });
        metrics.turn_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.frames_inferred, 12);
        assert_eq!(snapshot.sessions_failed, 1);
        assert_eq!(snapshot.turns_completed, 1);
        assert_eq!(snapshot.turns_failed, 1);
        assert_eq!(snapshot.sentences_synthesized, 2);
    }

    #[tokio::test]
    async fn test_each_session_is_fresh() {
        let state = state(4);
        let first = state.new_session();
        let second = state.new_session();
        assert_ne!(first.id(), second.id());

        let turn = state.new_turn();
        assert!(turn.history().is_empty());
    }
}
