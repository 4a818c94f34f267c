//! Playback scheduler — the ordering core of the speech queue.
//!
//! Chunks are committed to the device timeline **in submission order**, no
//! matter in which order their fetches or decodes settle. The serialization
//! is structural: every chunk becomes one step on a single-consumer FIFO
//! channel (the "schedule chain"), drained by exactly one task. Step *k*
//! does not begin evaluating its scheduling decision until step *k−1* has
//! finished making its decision — though fetches and decodes for later steps
//! run in parallel the whole time.
//!
//! Gaplessness falls out of the cursor: each committed clip starts at
//! `max(now, next_start_time)` and advances `next_start_time` by its own
//! duration, so a clip that is ready in time starts exactly when its
//! predecessor ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::clip::{AudioClip, decode_clip};
use crate::events::{SkipReason, SpeechEvent};
use crate::sink::SpeechSink;

/// Callback invoked when a chunk finishes playing naturally.
pub type ChunkDoneCallback = Box<dyn FnOnce() + Send + 'static>;

/// One step of the schedule chain: a chunk waiting for its turn.
struct ChainStep {
    seq: u64,
    clip_rx: oneshot::Receiver<Result<AudioClip, SkipReason>>,
    on_end: Option<ChunkDoneCallback>,
}

/// The live end of the schedule chain.
struct ChainHandle {
    tx: mpsc::UnboundedSender<ChainStep>,
    consumer: JoinHandle<()>,
}

// ── Shared state ───────────────────────────────────────────────────

struct SchedulerShared {
    sink: Arc<dyn SpeechSink>,

    /// Absolute device-clock time at which the next clip may begin.
    /// Monotonically non-decreasing between stops. The lock doubles as the
    /// commit lock: `commit` holds it from the stop check through the sink
    /// append and the active-set insert, and `stop` takes it around its cut,
    /// so the two can never interleave.
    cursor: Mutex<Instant>,

    /// Sources currently producing sound: source handle → submission seq.
    /// Emptiness is the sole determinant of `is_speaking`.
    active: Mutex<HashMap<u64, u64>>,

    /// Global stop flag — set for the duration of a `stop()` so steps that
    /// settle mid-stop cannot make sound.
    stopped: AtomicBool,

    /// Bumped on every `stop()`; end-watchers from an older generation are
    /// inert.
    generation: AtomicU64,

    /// Source handle allocator.
    next_source: AtomicU64,

    /// Mirrors "active set is non-empty".
    speaking_tx: watch::Sender<bool>,

    events: mpsc::UnboundedSender<SpeechEvent>,
}

impl SchedulerShared {
    fn emit(&self, event: SpeechEvent) {
        let _ = self.events.send(event);
    }

    /// Record a chunk that will never make sound.
    fn skip(&self, seq: u64, reason: SkipReason) {
        match reason {
            SkipReason::Stopped => {
                tracing::debug!(seq, "chunk dropped after stop");
            }
            SkipReason::FetchFailed | SkipReason::DecodeFailed | SkipReason::DeviceFailed => {
                tracing::warn!(seq, ?reason, "chunk skipped — continuing with the next step");
            }
        }
        self.emit(SpeechEvent::ChunkSkipped { seq, reason });
    }

    /// Commit a clip to the device timeline. The chain consumer invokes this
    /// serially; the cursor/commit lock guards it against a concurrent
    /// `stop()`.
    fn commit(shared: &Arc<Self>, seq: u64, clip: AudioClip, on_end: Option<ChunkDoneCallback>) {
        let duration = clip.duration();
        let now = Instant::now();

        let mut cursor = shared.cursor.lock().unwrap();
        let start = if *cursor > now { *cursor } else { now };

        // Last re-check before the only audible side effect in the crate.
        if shared.stopped.load(Ordering::SeqCst) {
            drop(cursor);
            shared.skip(seq, SkipReason::Stopped);
            return;
        }

        if let Err(e) = shared.sink.play(clip, start) {
            drop(cursor);
            tracing::error!(seq, error = %e, "device rejected clip");
            shared.skip(seq, SkipReason::DeviceFailed);
            return;
        }

        let ends_at = start + duration;
        *cursor = ends_at;

        // Insert while still holding the commit lock, so a concurrent
        // stop() cannot clear the active set between the append above and
        // this insert and strand the entry forever.
        let source_id = shared.next_source.fetch_add(1, Ordering::SeqCst);
        {
            let mut active = shared.active.lock().unwrap();
            active.insert(source_id, seq);
            if active.len() == 1 {
                shared.speaking_tx.send_replace(true);
                shared.emit(SpeechEvent::SpeakingStarted);
            }
        }
        let generation = shared.generation.load(Ordering::SeqCst);
        drop(cursor);

        tracing::debug!(
            seq,
            source_id,
            duration_ms = duration.as_millis(),
            "clip committed to device timeline"
        );
        shared.emit(SpeechEvent::ChunkScheduled {
            seq,
            start,
            duration,
        });

        let watcher = Arc::clone(shared);
        tokio::spawn(async move {
            watcher
                .watch_source_end(source_id, ends_at, generation, on_end)
                .await;
        });
    }

    /// Natural-end handler for one committed source.
    async fn watch_source_end(
        &self,
        source_id: u64,
        ends_at: Instant,
        generation: u64,
        on_end: Option<ChunkDoneCallback>,
    ) {
        tokio::time::sleep_until(ends_at).await;

        // A stop() happened since this source was committed — it was already
        // torn down and its callback must not fire.
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }

        let (seq, became_idle) = {
            let mut active = self.active.lock().unwrap();
            let Some(seq) = active.remove(&source_id) else {
                return;
            };
            (seq, active.is_empty())
        };

        self.emit(SpeechEvent::ChunkFinished { seq });
        if became_idle {
            self.speaking_tx.send_replace(false);
            self.emit(SpeechEvent::SpeakingFinished);
            tracing::debug!("speech queue drained");
        }

        if let Some(callback) = on_end {
            callback();
        }
    }
}

// ── Chain consumer ─────────────────────────────────────────────────

/// The single consumer: drains chain steps in submission order, awaiting
/// each chunk's settled clip before making its scheduling decision.
async fn run_chain(shared: Arc<SchedulerShared>, mut rx: mpsc::UnboundedReceiver<ChainStep>) {
    while let Some(step) = rx.recv().await {
        let clip = match step.clip_rx.await {
            Ok(Ok(clip)) => clip,
            Ok(Err(reason)) => {
                shared.skip(step.seq, reason);
                continue;
            }
            // Settler dropped without resolving (task panicked / aborted).
            Err(_) => {
                shared.skip(step.seq, SkipReason::FetchFailed);
                continue;
            }
        };

        if shared.stopped.load(Ordering::SeqCst) {
            shared.skip(step.seq, SkipReason::Stopped);
            continue;
        }

        SchedulerShared::commit(&shared, step.seq, clip, step.on_end);
    }
}

// ── PlaybackScheduler ──────────────────────────────────────────────

/// Schedules decoded clips on the device timeline in strict submission
/// order. See the module docs for the ordering and gaplessness model.
pub struct PlaybackScheduler {
    shared: Arc<SchedulerShared>,
    chain: Mutex<ChainHandle>,
}

impl PlaybackScheduler {
    /// Create a scheduler committing clips to `sink`.
    ///
    /// Must be called from within a tokio runtime — the chain consumer task
    /// is spawned immediately.
    #[must_use]
    pub fn new(
        sink: Arc<dyn SpeechSink>,
        events: mpsc::UnboundedSender<SpeechEvent>,
    ) -> Self {
        let (speaking_tx, _) = watch::channel(false);

        let shared = Arc::new(SchedulerShared {
            sink,
            cursor: Mutex::new(Instant::now()),
            active: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            next_source: AtomicU64::new(0),
            speaking_tx,
            events,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let consumer = tokio::spawn(run_chain(Arc::clone(&shared), rx));

        Self {
            shared,
            chain: Mutex::new(ChainHandle { tx, consumer }),
        }
    }

    /// Append a chunk as the next step of the schedule chain.
    ///
    /// Must be called once per chunk, in submission order. The fetched bytes
    /// are decoded on a spawned task (decodes overlap fetches and each
    /// other); only the scheduling decision is serialized.
    pub fn schedule_next(
        &self,
        seq: u64,
        bytes_rx: oneshot::Receiver<Option<Bytes>>,
        on_end: Option<ChunkDoneCallback>,
    ) {
        let (clip_tx, clip_rx) = oneshot::channel();

        tokio::spawn(async move {
            let settled = match bytes_rx.await {
                Ok(Some(bytes)) => match decode_clip(&bytes) {
                    Ok(clip) => Ok(clip),
                    Err(e) => {
                        tracing::warn!(seq, error = %e, "failed to decode synthesized audio");
                        Err(SkipReason::DecodeFailed)
                    }
                },
                Ok(None) | Err(_) => Err(SkipReason::FetchFailed),
            };
            let _ = clip_tx.send(settled);
        });

        // The sender is only replaced under this same lock (see `stop`), so
        // a step can never land on a dead chain.
        let chain = self.chain.lock().unwrap();
        let _ = chain.tx.send(ChainStep {
            seq,
            clip_rx,
            on_end,
        });
    }

    /// Stop playback and discard every pending chain step.
    ///
    /// Safe to call at any moment, with any number of fetches and steps in
    /// flight; idempotent; never fails. After it returns, no audio from
    /// previously submitted chunks will be produced, and the cursor is reset
    /// so the next `speak` starts immediately.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);

        // Replace the chain wholesale: pending steps die with the old
        // channel, and a fresh consumer serves everything submitted later.
        {
            let mut chain = self.chain.lock().unwrap();
            chain.consumer.abort();
            let (tx, rx) = mpsc::unbounded_channel();
            chain.tx = tx;
            chain.consumer = tokio::spawn(run_chain(Arc::clone(&self.shared), rx));
        }

        // The commit lock serializes the cut against an in-flight commit: a
        // commit past its stop check finishes its append and insert before
        // the cut runs, so its clip is silenced here and its active entry is
        // cleared rather than stranded.
        {
            let mut cursor = self.shared.cursor.lock().unwrap();

            if let Err(e) = self.shared.sink.stop() {
                // stop() never fails upward; the device layer already reported.
                tracing::debug!(error = %e, "sink stop failed during scheduler stop");
            }

            let was_speaking = {
                let mut active = self.shared.active.lock().unwrap();
                let was = !active.is_empty();
                active.clear();
                was
            };
            if was_speaking {
                self.shared.speaking_tx.send_replace(false);
                self.shared.emit(SpeechEvent::SpeakingFinished);
            }

            *cursor = Instant::now();
        }
        self.shared.stopped.store(false, Ordering::SeqCst);

        tracing::debug!("playback scheduler stopped and reset");
    }

    /// Clear the stop flag so a `speak` issued immediately after `stop` is
    /// honored even if the two race.
    pub fn clear_stop_flag(&self) {
        self.shared.stopped.store(false, Ordering::SeqCst);
    }

    /// Whether any source is currently producing sound.
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        *self.shared.speaking_tx.borrow()
    }

    /// Subscribe to `is_speaking` transitions.
    #[must_use]
    pub fn subscribe_speaking(&self) -> watch::Receiver<bool> {
        self.shared.speaking_tx.subscribe()
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.chain.lock().unwrap().consumer.abort();
    }
}
