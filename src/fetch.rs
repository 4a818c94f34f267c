//! Bounded-concurrency fetch pool for synthesis requests.
//!
//! At most `max_parallel` requests run against the synthesis endpoint at
//! once; everything beyond that queues FIFO on a counting semaphore. Every
//! submitted chunk settles a one-shot result with `Some(bytes)` on success
//! or `None` on failure/abort — a failed chunk is a normal outcome for the
//! scheduler, never an error that breaks the chain.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use tokio::sync::{Semaphore, oneshot};
use tokio_util::sync::CancellationToken;

use crate::synth::SynthesisClient;

/// Settleable result of a submitted fetch.
///
/// Resolves to `Some(bytes)` on success, `None` on failure or abort. The
/// sender side is dropped (never settled) only if the pool task panics, which
/// the scheduler also treats as a skipped chunk.
pub type FetchResult = oneshot::Receiver<Option<Bytes>>;

/// Bounded-concurrency executor for synthesis fetches.
///
/// The concurrency bound is a first-class property: admission is gated by a
/// FIFO counting semaphore, and the live in-flight count is inspectable via
/// [`active_fetches`](Self::active_fetches).
pub struct FetchWorkerPool {
    client: Arc<dyn SynthesisClient>,

    /// Admission gate — FIFO-fair, `max_parallel` permits.
    permits: Arc<Semaphore>,

    /// Number of requests currently running (admitted, not yet settled).
    active: Arc<AtomicUsize>,

    /// Cancellation for the current batch. Replaced on every
    /// [`abort_all`](Self::abort_all) so later submissions run normally.
    cancel: Mutex<CancellationToken>,

    max_parallel: usize,
}

impl FetchWorkerPool {
    /// Create a pool admitting at most `max_parallel` concurrent fetches.
    #[must_use]
    pub fn new(client: Arc<dyn SynthesisClient>, max_parallel: usize) -> Self {
        Self {
            client,
            permits: Arc::new(Semaphore::new(max_parallel.max(1))),
            active: Arc::new(AtomicUsize::new(0)),
            cancel: Mutex::new(CancellationToken::new()),
            max_parallel: max_parallel.max(1),
        }
    }

    /// Submit a text chunk for synthesis.
    ///
    /// Returns immediately; the fetch runs on a spawned task once a permit
    /// is available. Must be called from within a tokio runtime.
    pub fn submit(&self, text: String) -> FetchResult {
        let (tx, rx) = oneshot::channel();

        let client = Arc::clone(&self.client);
        let permits = Arc::clone(&self.permits);
        let active = Arc::clone(&self.active);
        let token = self.cancel.lock().unwrap().clone();

        tokio::spawn(async move {
            // Wait for admission; an abort while queued settles silently.
            let permit = tokio::select! {
                () = token.cancelled() => {
                    tracing::debug!("fetch aborted while queued");
                    let _ = tx.send(None);
                    return;
                }
                permit = permits.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => {
                        let _ = tx.send(None);
                        return;
                    }
                },
            };

            active.fetch_add(1, Ordering::SeqCst);

            let outcome = tokio::select! {
                () = token.cancelled() => {
                    tracing::debug!("fetch aborted in flight");
                    None
                }
                result = client.synthesize(&text) => match result {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        tracing::warn!(error = %e, "synthesis fetch failed — chunk will be skipped");
                        None
                    }
                },
            };

            active.fetch_sub(1, Ordering::SeqCst);
            drop(permit);

            let _ = tx.send(outcome);
        });

        rx
    }

    /// Cancel every active and queued request.
    ///
    /// Already-settled results are unaffected. Idempotent — a fresh token is
    /// installed so submissions made after the call run normally.
    pub fn abort_all(&self) {
        let mut token = self.cancel.lock().unwrap();
        token.cancel();
        *token = CancellationToken::new();
    }

    /// Number of fetches currently running (admitted, unsettled).
    #[must_use]
    pub fn active_fetches(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// The configured concurrency bound.
    #[must_use]
    pub const fn max_parallel(&self) -> usize {
        self.max_parallel
    }
}
