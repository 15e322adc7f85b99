//! # Parallel Dispatcher
//!
//! Fans work out to concurrent collaborator calls and joins the results back in the
//! order the work was submitted, whatever order the calls finish in.
//!
//! ## Key Components:
//! - **PendingCall**: "spawn now, resolve later" handle with timeout-bounded
//!   resolution and cancellation
//! - **ParallelDispatcher**: spawns calls against one collaborator, counting them in
//!   the registry and holding a permit from the registry's cap while each runs
//!
//! ## Policy:
//! - One outstanding call per input
//! - No automatic retry; a failed call fails its slot, and [`ParallelDispatcher::join`]
//!   fails as a whole
//! - Dropping a `PendingCall` before it resolves aborts the call

use futures_util::stream::{Stream, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::inference::{CollaboratorError, CollaboratorKind, CollaboratorRegistry};

/// Why a [`PendingCall`] did not produce a value.
#[derive(Debug, Error)]
pub enum CallError {
    /// The timeout elapsed first. The call keeps running and may be resolved again.
    #[error("call is still pending")]
    Pending,

    #[error(transparent)]
    Failed(#[from] CollaboratorError),

    #[error("call was cancelled")]
    Cancelled,

    #[error("call panicked: {0}")]
    Panicked(String),

    #[error("call result was already taken")]
    Consumed,
}

impl CallError {
    pub fn is_pending(&self) -> bool {
        matches!(self, CallError::Pending)
    }
}

/// Handle to one spawned collaborator call.
#[derive(Debug)]
pub struct PendingCall<T> {
    index: usize,
    handle: Option<JoinHandle<Result<T, CollaboratorError>>>,
}

impl<T> PendingCall<T> {
    /// Submission index within the dispatcher that spawned it.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(JoinHandle::is_finished).unwrap_or(true)
    }

    /// Wait for the result.
    ///
    /// ## Parameters:
    /// - **timeout**: upper bound on the wait; `None` waits until the call resolves
    ///
    /// ## Returns:
    /// - **Ok(value)**: the call succeeded; the handle is now consumed
    /// - **Err(CallError::Pending)**: the timeout elapsed; the call is still running
    ///   and `resolve` may be called again
    /// - **Err(other)**: the call failed, was cancelled, or panicked
    pub async fn resolve(&mut self, timeout: Option<Duration>) -> Result<T, CallError> {
        let handle = self.handle.as_mut().ok_or(CallError::Consumed)?;

        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => return Err(CallError::Pending),
            },
            None => handle.await,
        };
        self.handle = None;

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(CallError::Failed(e)),
            Err(e) if e.is_cancelled() => Err(CallError::Cancelled),
            Err(e) => Err(CallError::Panicked(e.to_string())),
        }
    }

    /// Wait until the call resolves.
    pub async fn wait(mut self) -> Result<T, CallError> {
        self.resolve(None).await
    }

    /// Resolve in `poll` sized slices, giving up as soon as `cancel` fires.
    pub async fn wait_cancellable(
        mut self,
        poll: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, CallError> {
        loop {
            if cancel.is_cancelled() {
                self.cancel();
                return Err(CallError::Cancelled);
            }
            match self.resolve(Some(poll)).await {
                Err(CallError::Pending) => {
                    trace!(index = self.index, "Call still pending");
                }
                other => return other,
            }
        }
    }

    /// Handle that aborts the call without access to the `PendingCall` itself.
    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.handle.as_ref().map(JoinHandle::abort_handle)
    }

    /// Abort the call. Resolving afterwards reports `Cancelled`.
    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}

impl<T> Drop for PendingCall<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Spawns calls against one collaborator.
#[derive(Clone)]
pub struct ParallelDispatcher {
    kind: CollaboratorKind,
    registry: Arc<CollaboratorRegistry>,
    lookahead: usize,
    submitted: Arc<AtomicUsize>,
}

impl ParallelDispatcher {
    /// ## Parameters:
    /// - **kind**: collaborator the calls go to
    /// - **registry**: where outstanding calls are counted and the per-collaborator
    ///   cap lives, shared by every dispatcher built on it
    pub fn new(kind: CollaboratorKind, registry: Arc<CollaboratorRegistry>) -> Self {
        let lookahead = match registry.max_in_flight() {
            0 => 64,
            cap => cap,
        };
        Self {
            kind,
            registry,
            lookahead,
            submitted: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn kind(&self) -> CollaboratorKind {
        self.kind
    }

    /// Start one call immediately and return its handle.
    pub fn spawn<F, T>(&self, call: F) -> PendingCall<T>
    where
        F: Future<Output = Result<T, CollaboratorError>> + Send + 'static,
        T: Send + 'static,
    {
        let index = self.submitted.fetch_add(1, Ordering::Relaxed);
        let guard = self.registry.track(self.kind);
        let limit = self.registry.limiter(self.kind);
        let kind = self.kind;

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let _permit = match limit {
                Some(semaphore) => Some(
                    semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| CollaboratorError::Unavailable(kind.to_string()))?,
                ),
                None => None,
            };
            debug!(collaborator = %kind, index, "Call started");
            call.await
        });

        PendingCall {
            index,
            handle: Some(handle),
        }
    }

    /// Start one call per input, in input order.
    pub fn spawn_all<I, F, Fut, T>(&self, inputs: I, mut call: F) -> Vec<PendingCall<T>>
    where
        I: IntoIterator,
        F: FnMut(I::Item) -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>> + Send + 'static,
        T: Send + 'static,
    {
        inputs.into_iter().map(|input| self.spawn(call(input))).collect()
    }

    /// Resolve every call, returning values in submission order.
    ///
    /// The first failure (in submission order) fails the join; calls not yet
    /// resolved at that point are aborted.
    pub async fn join<T>(calls: Vec<PendingCall<T>>) -> Result<Vec<T>, CallError> {
        let mut values = Vec::with_capacity(calls.len());
        for call in calls {
            values.push(call.wait().await?);
        }
        Ok(values)
    }

    /// Resolve every call, keeping each slot's outcome, in submission order.
    pub async fn join_settled<T>(calls: Vec<PendingCall<T>>) -> Vec<Result<T, CallError>> {
        let mut outcomes = Vec::with_capacity(calls.len());
        for call in calls {
            outcomes.push(call.wait().await);
        }
        outcomes
    }

    /// Map form over a lazy input stream.
    ///
    /// Each input is dispatched as soon as it arrives (up to the lookahead) and the
    /// output yields `(input, result)` pairs in input order. An `Err` input is passed
    /// through without dispatching anything.
    pub fn try_map_ordered<S, I, F, Fut, T>(
        &self,
        inputs: S,
        mut call: F,
    ) -> impl Stream<Item = Result<(I, T), CallError>>
    where
        S: Stream<Item = Result<I, CollaboratorError>>,
        I: Clone + Send + 'static,
        F: FnMut(I) -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>> + Send + 'static,
        T: Send + 'static,
    {
        let dispatcher = self.clone();
        inputs
            .map(move |input| {
                let pending = input.map(|value| (value.clone(), dispatcher.spawn(call(value))));
                async move {
                    let (value, call) = pending?;
                    let output = call.wait().await?;
                    Ok::<_, CallError>((value, output))
                }
            })
            .buffered(self.lookahead)
    }

    /// Map form over an infallible input stream.
    pub fn map_ordered<S, I, F, Fut, T>(
        &self,
        inputs: S,
        call: F,
    ) -> impl Stream<Item = Result<(I, T), CallError>>
    where
        S: Stream<Item = I>,
        I: Clone + Send + 'static,
        F: FnMut(I) -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>> + Send + 'static,
        T: Send + 'static,
    {
        self.try_map_ordered(inputs.map(Ok), call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::Mutex;

    fn dispatcher(max_in_flight: usize) -> (ParallelDispatcher, Arc<CollaboratorRegistry>) {
        let registry = Arc::new(CollaboratorRegistry::with_max_in_flight(max_in_flight));
        let dispatcher = ParallelDispatcher::new(CollaboratorKind::Transcriber, registry.clone());
        (dispatcher, registry)
    }

    /// Spawn `count` calls that record the peak number running at once.
    fn spawn_counted(
        dispatcher: &ParallelDispatcher,
        count: usize,
        running: &Arc<AtomicUsize>,
        peak: &Arc<AtomicUsize>,
    ) -> Vec<PendingCall<()>> {
        dispatcher.spawn_all(0..count, |_| {
            let running = running.clone();
            let peak = peak.clone();
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    /// Test that results come back in submission order when calls finish in reverse.
    #[tokio::test]
    async fn test_join_preserves_submission_order() {
        let (dispatcher, _) = dispatcher(0);
        let finished = Arc::new(Mutex::new(Vec::new()));

        let calls = dispatcher.spawn_all(0..3u64, |i| {
            let finished = finished.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(60 - i * 25)).await;
                finished.lock().unwrap().push(i);
                Ok(i * 10)
            }
        });

        let values = ParallelDispatcher::join(calls).await.unwrap();
        assert_eq!(values, vec![0, 10, 20]);
        assert_eq!(*finished.lock().unwrap(), vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn test_failed_call_fails_join() {
        let (dispatcher, _) = dispatcher(0);
        let calls = dispatcher.spawn_all(0..3u32, |i| async move {
            if i == 1 {
                Err(CollaboratorError::Inference("bad chunk".into()))
            } else {
                Ok(i)
            }
        });

        let result = ParallelDispatcher::join(calls).await;
        assert!(matches!(result, Err(CallError::Failed(_))));
    }

    #[tokio::test]
    async fn test_join_settled_keeps_each_slot() {
        let (dispatcher, _) = dispatcher(0);
        let calls = dispatcher.spawn_all(0..3u32, |i| async move {
            if i == 0 {
                Err(CollaboratorError::Inference("bad chunk".into()))
            } else {
                Ok(i)
            }
        });

        let outcomes = ParallelDispatcher::join_settled(calls).await;
        assert!(outcomes[0].is_err());
        assert_eq!(outcomes[1].as_ref().unwrap(), &1);
        assert_eq!(outcomes[2].as_ref().unwrap(), &2);
    }

    /// Test that a timeout reports Pending and the same handle resolves later.
    #[tokio::test]
    async fn test_resolve_timeout_is_pending_not_failure() {
        let (dispatcher, registry) = dispatcher(0);
        let mut call = dispatcher.spawn(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok("done")
        });
        assert_eq!(registry.in_flight(CollaboratorKind::Transcriber), 1);

        let early = call.resolve(Some(Duration::from_millis(1))).await;
        assert!(early.unwrap_err().is_pending());

        let value = call.resolve(None).await.unwrap();
        assert_eq!(value, "done");
        assert!(matches!(call.resolve(None).await, Err(CallError::Consumed)));
        assert_eq!(registry.in_flight(CollaboratorKind::Transcriber), 0);
    }

    #[tokio::test]
    async fn test_cancel_releases_call() {
        let (dispatcher, registry) = dispatcher(0);
        let mut call = dispatcher.spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });

        call.cancel();
        assert!(matches!(call.resolve(None).await, Err(CallError::Cancelled)));
        assert_eq!(registry.in_flight(CollaboratorKind::Transcriber), 0);
    }

    #[tokio::test]
    async fn test_wait_cancellable_stops_on_token() {
        let (dispatcher, _) = dispatcher(0);
        let call = dispatcher.spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        });

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = call.wait_cancellable(Duration::from_millis(2), &token).await;
        assert!(matches!(result, Err(CallError::Cancelled)));
    }

    /// Test that the map form pairs each input with its own output, in input order.
    #[tokio::test]
    async fn test_map_ordered_pairs_in_input_order() {
        let (dispatcher, _) = dispatcher(0);
        let inputs = stream::iter(vec!["slow", "medium", "fast"]);

        let pairs: Vec<(&str, usize)> = dispatcher
            .map_ordered(inputs, |text| async move {
                let delay = match text {
                    "slow" => 50,
                    "medium" => 25,
                    _ => 1,
                };
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(text.len())
            })
            .map(|pair| pair.unwrap())
            .collect()
            .await;

        assert_eq!(pairs, vec![("slow", 4), ("medium", 6), ("fast", 4)]);
    }

    #[tokio::test]
    async fn test_concurrency_cap() {
        let (dispatcher, _) = dispatcher(1);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let calls = spawn_counted(&dispatcher, 4, &running, &peak);
        ParallelDispatcher::join(calls).await.unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    /// Test that two dispatchers on one registry share the collaborator's cap.
    #[tokio::test]
    async fn test_cap_holds_across_dispatchers() {
        let registry = Arc::new(CollaboratorRegistry::with_max_in_flight(1));
        let first = ParallelDispatcher::new(CollaboratorKind::Synthesizer, registry.clone());
        let second = ParallelDispatcher::new(CollaboratorKind::Synthesizer, registry.clone());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut calls = spawn_counted(&first, 3, &running, &peak);
        calls.extend(spawn_counted(&second, 3, &running, &peak));
        ParallelDispatcher::join(calls).await.unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(registry.in_flight(CollaboratorKind::Synthesizer), 0);
    }
}
