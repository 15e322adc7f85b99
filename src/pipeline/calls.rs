//! # Audio Call Store
//!
//! Synthesis calls started by `POST /generate` and claimed later by id through
//! `GET /audio/{call_id}`.
//!
//! ## Claim Semantics:
//! - **Ready**: the audio is returned and the entry is removed
//! - **Pending**: the wait timed out; the entry stays and may be claimed again
//! - **Failed / cancelled**: reported once, then the entry is removed
//!
//! Entries nobody claims are dropped (and their calls aborted) once they are older
//! than the store's TTL. Expired entries are swept on every insert.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::debug;
use uuid::Uuid;

use crate::pipeline::dispatcher::{CallError, PendingCall};

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("unknown call id: {0}")]
    NotFound(String),

    #[error(transparent)]
    Call(#[from] CallError),
}

struct StoredCall {
    call: Arc<Mutex<PendingCall<Vec<u8>>>>,
    abort: Option<AbortHandle>,
    created: Instant,
}

/// Shared between handlers; cloning is cheap.
#[derive(Clone)]
pub struct AudioCallStore {
    calls: Arc<Mutex<HashMap<String, StoredCall>>>,
    ttl: Duration,
}

impl AudioCallStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Keep `call` under a fresh id and return the id.
    pub async fn insert(&self, call: PendingCall<Vec<u8>>) -> String {
        let id = Uuid::new_v4().to_string();
        let mut calls = self.calls.lock().await;

        let ttl = self.ttl;
        let before = calls.len();
        calls.retain(|_, stored| stored.created.elapsed() < ttl);
        if calls.len() < before {
            debug!(expired = before - calls.len(), "Dropped unclaimed audio calls");
        }

        calls.insert(
            id.clone(),
            StoredCall {
                abort: call.abort_handle(),
                call: Arc::new(Mutex::new(call)),
                created: Instant::now(),
            },
        );
        id
    }

    pub async fn len(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// Wait up to `timeout` for the call's audio.
    pub async fn claim(&self, id: &str, timeout: Duration) -> Result<Vec<u8>, ClaimError> {
        let call = self
            .calls
            .lock()
            .await
            .get(id)
            .map(|stored| stored.call.clone())
            .ok_or_else(|| ClaimError::NotFound(id.to_string()))?;

        let result = call.lock().await.resolve(Some(timeout)).await;
        if !matches!(result, Err(CallError::Pending)) {
            self.calls.lock().await.remove(id);
        }
        Ok(result?)
    }

    /// Abort the call and forget it. `false` when the id is unknown.
    pub async fn cancel(&self, id: &str) -> bool {
        match self.calls.lock().await.remove(id) {
            Some(stored) => {
                if let Some(abort) = stored.abort {
                    abort.abort();
                }
                true
            }
            None => false,
        }
    }
}
