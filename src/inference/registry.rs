//! # Collaborator Registry
//!
//! Tracks the warm-up status of every collaborator and how many calls each one has
//! outstanding. Collaborators are usually capacity-constrained (one accelerator per
//! instance), so the relay counts in-flight calls itself instead of trusting the
//! backend to serialize.
//!
//! ## Key Features:
//! - **Status tracking**: Cold → Warming → Ready, or Failed
//! - **Outstanding calls**: an RAII [`InFlightGuard`] per call
//! - **Concurrency cap**: one semaphore per collaborator, shared by every connection
//! - **Readiness**: a collaborator is ready when it is warmed and idle
//! - **Prewarm**: warm every collaborator concurrently and wait for all of them

use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{RwLock, Semaphore};
use tracing::{error, info};

use super::{CollaboratorError, CollaboratorKind, Collaborators};

/// Current warm-up status of a collaborator.
///
/// ## State Transitions:
/// Cold → Warming → Ready. A failed warm-up lands in Failed; warming again may
/// recover it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CollaboratorStatus {
    /// No warm-up call has been issued yet
    Cold,

    /// A warm-up call is in progress
    Warming,

    /// Warm-up succeeded
    Ready { warmed_at: u64 },

    /// Warm-up failed
    Failed { message: String, failed_at: u64 },
}

impl CollaboratorStatus {
    pub fn is_ready(&self) -> bool {
        matches!(self, CollaboratorStatus::Ready { .. })
    }

    pub fn description(&self) -> String {
        match self {
            CollaboratorStatus::Cold => "Not warmed".to_string(),
            CollaboratorStatus::Warming => "Warming up".to_string(),
            CollaboratorStatus::Ready { .. } => "Ready".to_string(),
            CollaboratorStatus::Failed { message, .. } => format!("Error: {}", message),
        }
    }
}

#[derive(Debug, Default)]
struct CallCounters {
    in_flight: AtomicUsize,
    total: AtomicU64,
}

/// Decrements the outstanding-call count of one collaborator when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    counters: Arc<CallCounters>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Per-collaborator entry in a [`RegistrySummary`].
#[derive(Debug, Clone, Serialize)]
pub struct CollaboratorSummary {
    pub status: CollaboratorStatus,
    pub description: String,
    pub in_flight: usize,
    pub total_calls: u64,
    pub ready: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub collaborators: BTreeMap<CollaboratorKind, CollaboratorSummary>,
    pub all_ready: bool,
}

/// Shared registry, one per server instance.
#[derive(Debug)]
pub struct CollaboratorRegistry {
    statuses: RwLock<HashMap<CollaboratorKind, CollaboratorStatus>>,
    counters: HashMap<CollaboratorKind, Arc<CallCounters>>,
    limits: HashMap<CollaboratorKind, Arc<Semaphore>>,
    max_in_flight: usize,
}

impl Default for CollaboratorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CollaboratorRegistry {
    /// Every collaborator starts Cold with no calls outstanding and no cap.
    pub fn new() -> Self {
        Self::with_max_in_flight(0)
    }

    /// ## Parameters:
    /// - **max_in_flight**: cap on concurrently running calls per collaborator,
    ///   across all connections; 0 means unlimited
    pub fn with_max_in_flight(max_in_flight: usize) -> Self {
        let statuses = CollaboratorKind::ALL
            .iter()
            .map(|kind| (*kind, CollaboratorStatus::Cold))
            .collect();
        let counters = CollaboratorKind::ALL
            .iter()
            .map(|kind| (*kind, Arc::new(CallCounters::default())))
            .collect();

        let limits = if max_in_flight > 0 {
            CollaboratorKind::ALL
                .iter()
                .map(|kind| (*kind, Arc::new(Semaphore::new(max_in_flight))))
                .collect()
        } else {
            HashMap::new()
        };

        Self {
            statuses: RwLock::new(statuses),
            counters,
            limits,
            max_in_flight,
        }
    }

    /// Configured per-collaborator cap; 0 means unlimited.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Semaphore bounding concurrent calls to `kind`, if capped.
    pub fn limiter(&self, kind: CollaboratorKind) -> Option<Arc<Semaphore>> {
        self.limits.get(&kind).cloned()
    }

    fn counters(&self, kind: CollaboratorKind) -> Arc<CallCounters> {
        // Every kind is inserted in `new`.
        self.counters.get(&kind).cloned().unwrap_or_default()
    }

    /// Record the start of a call. The count drops again when the guard is dropped.
    pub fn track(&self, kind: CollaboratorKind) -> InFlightGuard {
        let counters = self.counters(kind);
        counters.in_flight.fetch_add(1, Ordering::AcqRel);
        counters.total.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { counters }
    }

    pub fn in_flight(&self, kind: CollaboratorKind) -> usize {
        self.counters(kind).in_flight.load(Ordering::Acquire)
    }

    pub async fn status(&self, kind: CollaboratorKind) -> CollaboratorStatus {
        self.statuses
            .read()
            .await
            .get(&kind)
            .cloned()
            .unwrap_or(CollaboratorStatus::Cold)
    }

    pub async fn set_status(&self, kind: CollaboratorKind, status: CollaboratorStatus) {
        self.statuses.write().await.insert(kind, status);
    }

    /// Warmed and idle.
    pub async fn is_ready(&self, kind: CollaboratorKind) -> bool {
        self.status(kind).await.is_ready() && self.in_flight(kind) == 0
    }

    /// Readiness of every collaborator, keyed by kind.
    pub async fn readiness(&self) -> BTreeMap<CollaboratorKind, bool> {
        let mut readiness = BTreeMap::new();
        for kind in CollaboratorKind::ALL {
            readiness.insert(kind, self.is_ready(kind).await);
        }
        readiness
    }

    pub async fn summary(&self) -> RegistrySummary {
        let mut collaborators = BTreeMap::new();
        for kind in CollaboratorKind::ALL {
            let status = self.status(kind).await;
            let counters = self.counters(kind);
            let in_flight = counters.in_flight.load(Ordering::Acquire);
            collaborators.insert(
                kind,
                CollaboratorSummary {
                    description: status.description(),
                    ready: status.is_ready() && in_flight == 0,
                    status,
                    in_flight,
                    total_calls: counters.total.load(Ordering::Relaxed),
                },
            );
        }
        let all_ready = collaborators.values().all(|entry| entry.ready);
        RegistrySummary {
            collaborators,
            all_ready,
        }
    }

    /// Warm one collaborator, recording the outcome.
    pub async fn warm(
        &self,
        collaborators: &Collaborators,
        kind: CollaboratorKind,
    ) -> Result<(), CollaboratorError> {
        self.set_status(kind, CollaboratorStatus::Warming).await;
        let result = {
            let _guard = self.track(kind);
            collaborators.warm(kind).await
        };

        match &result {
            Ok(()) => {
                info!(collaborator = %kind, "Collaborator warmed");
                self.set_status(kind, CollaboratorStatus::Ready { warmed_at: current_timestamp() })
                    .await;
            }
            Err(e) => {
                error!(collaborator = %kind, error = %e, "Collaborator warm-up failed");
                self.set_status(
                    kind,
                    CollaboratorStatus::Failed {
                        message: e.to_string(),
                        failed_at: current_timestamp(),
                    },
                )
                .await;
            }
        }
        result
    }

    /// Issue a warm-up call to every collaborator at once and wait for all of them.
    ///
    /// ## Returns:
    /// - **Ok(())**: every collaborator warmed
    /// - **Err**: the first failure in collaborator order; the others still ran
    pub async fn prewarm(&self, collaborators: &Collaborators) -> Result<(), CollaboratorError> {
        let results = join_all(
            CollaboratorKind::ALL
                .iter()
                .map(|kind| self.warm(collaborators, *kind)),
        )
        .await;

        results.into_iter().collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
