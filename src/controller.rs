//! `SpeechQueueController` — the crate's façade.
//!
//! Wires the fetch pool, playback scheduler, output context, and ducking
//! coordinator together behind a small surface: `speak`, `stop`, volume
//! setters, and the `is_speaking` observers. `speak` never blocks and never
//! returns synthesis errors; failures surface on the event channel as
//! skipped chunks.

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::SpeechQueueConfig;
use crate::ducking::{DuckableResource, DuckingCoordinator};
use crate::events::SpeechEvent;
use crate::fetch::FetchWorkerPool;
use crate::output::AudioOutputContext;
use crate::scheduler::{ChunkDoneCallback, PlaybackScheduler};
use crate::sink::SpeechSink;
use crate::synth::{HttpSynthesisClient, SynthesisClient};

/// Façade over the speech queue.
///
/// One controller owns one speech timeline: chunks submitted through it play
/// back-to-back in submission order regardless of fetch timing. Create it
/// from within a tokio runtime.
pub struct SpeechQueueController {
    pool: FetchWorkerPool,
    scheduler: PlaybackScheduler,
    ducking: Arc<DuckingCoordinator>,

    /// Present only when the controller owns the audio device (the
    /// [`new`](Self::new) constructor); volume setters are no-ops otherwise.
    output: Option<AudioOutputContext>,

    /// Submission sequence allocator. Locked across the pool submit and the
    /// chain append so sequence order and chain order always agree, even
    /// with `speak` called from concurrent tasks.
    next_seq: Mutex<u64>,

    ducking_watcher: JoinHandle<()>,
}

impl SpeechQueueController {
    /// Create a controller playing through the default audio output device.
    ///
    /// The device itself opens lazily on the first `speak`. Returns the
    /// controller and the event stream.
    #[must_use]
    pub fn new(config: &SpeechQueueConfig) -> (Self, mpsc::UnboundedReceiver<SpeechEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let output = AudioOutputContext::new(events_tx.clone());
        let client: Arc<dyn SynthesisClient> = Arc::new(HttpSynthesisClient::new(config));
        let sink: Arc<dyn SpeechSink> = Arc::new(output.clone());

        (
            Self::build(client, sink, Some(output), config, events_tx),
            events_rx,
        )
    }

    /// Create a controller with injected synthesis and playback backends.
    ///
    /// Volume setters are no-ops in this mode — the injected sink owns its
    /// own levels.
    #[must_use]
    pub fn with_backends(
        client: Arc<dyn SynthesisClient>,
        sink: Arc<dyn SpeechSink>,
        config: &SpeechQueueConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SpeechEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (Self::build(client, sink, None, config, events_tx), events_rx)
    }

    fn build(
        client: Arc<dyn SynthesisClient>,
        sink: Arc<dyn SpeechSink>,
        output: Option<AudioOutputContext>,
        config: &SpeechQueueConfig,
        events_tx: mpsc::UnboundedSender<SpeechEvent>,
    ) -> Self {
        let pool = FetchWorkerPool::new(client, config.max_parallel_fetches);
        let scheduler = PlaybackScheduler::new(sink, events_tx);

        let ducking = Arc::new(DuckingCoordinator::new());
        let ducking_watcher = ducking.spawn_watcher(scheduler.subscribe_speaking());

        Self {
            pool,
            scheduler,
            ducking,
            output,
            next_seq: Mutex::new(0),
            ducking_watcher,
        }
    }

    // ── Speaking ───────────────────────────────────────────────────

    /// Queue `text` for synthesis and playback.
    ///
    /// Returns immediately. The chunk plays after everything queued before
    /// it, gaplessly when its fetch settles in time. Empty or whitespace-only
    /// text is ignored.
    pub fn speak(&self, text: &str) {
        self.enqueue(text, None);
    }

    /// Like [`speak`](Self::speak), with a callback fired once the chunk
    /// finishes playing naturally. The callback does not fire for skipped
    /// or stopped chunks.
    pub fn speak_with(&self, text: &str, on_end: ChunkDoneCallback) {
        self.enqueue(text, Some(on_end));
    }

    fn enqueue(&self, text: &str, on_end: Option<ChunkDoneCallback>) {
        if text.trim().is_empty() {
            tracing::debug!("ignoring empty speech request");
            return;
        }

        // A speak racing a concurrent stop() must still be honored.
        self.scheduler.clear_stop_flag();

        let mut next_seq = self.next_seq.lock().unwrap();
        let seq = *next_seq;
        *next_seq += 1;
        tracing::debug!(seq, chars = text.len(), "speech chunk queued");

        let bytes_rx = self.pool.submit(text.to_string());
        self.scheduler.schedule_next(seq, bytes_rx, on_end);
    }

    /// Stop speaking immediately and discard everything queued.
    ///
    /// Aborts in-flight fetches, drops pending chunks, and cuts sounding
    /// audio. Idempotent; chunks submitted after the call play normally.
    pub fn stop(&self) {
        tracing::debug!("stopping speech queue");
        self.pool.abort_all();
        self.scheduler.stop();
    }

    // ── Observers ──────────────────────────────────────────────────

    /// Whether any speech is currently sounding.
    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.scheduler.is_speaking()
    }

    /// Subscribe to `is_speaking` transitions.
    #[must_use]
    pub fn subscribe_speaking(&self) -> watch::Receiver<bool> {
        self.scheduler.subscribe_speaking()
    }

    /// Number of synthesis fetches currently in flight.
    #[must_use]
    pub fn active_fetches(&self) -> usize {
        self.pool.active_fetches()
    }

    // ── Volume & ducking ───────────────────────────────────────────

    /// Set the speech channel volume (`[0, 1]`).
    pub fn set_speech_volume(&self, volume: f32) {
        match self.output {
            Some(ref output) => output.set_speech_volume(volume),
            None => tracing::debug!("speech volume ignored with injected sink"),
        }
    }

    /// Set the master volume (`[0, 1]`).
    pub fn set_master_volume(&self, volume: f32) {
        match self.output {
            Some(ref output) => output.set_master_volume(volume),
            None => tracing::debug!("master volume ignored with injected sink"),
        }
    }

    /// Register a resource to be ducked while speech is sounding.
    pub fn register_duckable(&self, resource: Arc<dyn DuckableResource>) {
        self.ducking.register(resource);
    }

    /// The ducking coordinator, for manual duck/restore control.
    #[must_use]
    pub fn ducking(&self) -> &Arc<DuckingCoordinator> {
        &self.ducking
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Stop speech and release the audio device, if this controller owns
    /// one. The device re-opens lazily on the next `speak`.
    pub fn shutdown(&self) {
        self.stop();
        if let Some(ref output) = self.output {
            output.shutdown();
        }
    }
}

impl Drop for SpeechQueueController {
    fn drop(&mut self) {
        self.ducking_watcher.abort();
    }
}
