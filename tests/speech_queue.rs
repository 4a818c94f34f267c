//! Integration tests for the speech queue.
//!
//! These drive [`SpeechQueueController`] end to end through a mock synthesis
//! backend and a recording sink. No real audio hardware or network access is
//! required, and every test runs under paused tokio time, so fetch latencies
//! are simulated deterministically.
//!
//! # What is tested
//!
//! - Submission order survives arbitrary fetch completion order
//! - Chunks ready in time concatenate gaplessly on the device timeline
//! - Fetch concurrency never exceeds the configured bound
//! - `stop` silences everything and later speech plays normally
//! - Failed fetches and undecodable payloads are skipped without stalling
//! - `is_speaking` transitions and ducking follow playback

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;

use voxqueue::{
    AudioClip, DuckableResource, MUSIC_DUCK_FACTOR, SkipReason, SpeechError, SpeechEvent,
    SpeechQueueConfig, SpeechQueueController, SpeechSink, SynthesisClient,
};

// ── Mock backends ──────────────────────────────────────────────────

/// Build a mono 16-bit PCM WAV payload of the given duration at 16 kHz.
fn wav_secs(secs: f64) -> Bytes {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let samples = (secs * 16_000.0) as usize;
    let data_len = (samples * 2) as u32;

    let mut out = Vec::with_capacity(44 + samples * 2);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&16_000u32.to_le_bytes());
    out.extend_from_slice(&32_000u32.to_le_bytes()); // byte rate
    out.extend_from_slice(&2u16.to_le_bytes()); // block align
    out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    out.resize(44 + samples * 2, 0);
    Bytes::from(out)
}

/// Per-chunk scripted behaviour: synthesis latency plus the payload to
/// return, or `None` for a fetch failure.
struct ChunkScript {
    latency: Duration,
    payload: Option<Bytes>,
}

/// Synthesis backend returning canned payloads after scripted latencies,
/// tracking peak request concurrency along the way.
struct MockSynth {
    chunks: HashMap<String, ChunkScript>,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl MockSynth {
    fn new() -> Self {
        Self {
            chunks: HashMap::new(),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn with(mut self, text: &str, latency_ms: u64, payload: Option<Bytes>) -> Self {
        self.chunks.insert(
            text.to_string(),
            ChunkScript {
                latency: Duration::from_millis(latency_ms),
                payload,
            },
        );
        self
    }
}

#[async_trait]
impl SynthesisClient for MockSynth {
    async fn synthesize(&self, text: &str) -> Result<Bytes, SpeechError> {
        let script = self
            .chunks
            .get(text)
            .unwrap_or_else(|| panic!("unscripted chunk: {text:?}"));

        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(script.latency).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        script
            .payload
            .clone()
            .ok_or_else(|| SpeechError::FetchFailed(anyhow::anyhow!("scripted failure")))
    }
}

/// Sink recording every committed clip's start time and duration.
struct RecordingSink {
    played: Mutex<Vec<(Instant, Duration)>>,
    stops: AtomicUsize,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            played: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        })
    }

    fn played(&self) -> Vec<(Instant, Duration)> {
        self.played.lock().unwrap().clone()
    }
}

impl SpeechSink for RecordingSink {
    fn play(&self, clip: AudioClip, at: Instant) -> Result<(), SpeechError> {
        self.played.lock().unwrap().push((at, clip.duration()));
        Ok(())
    }

    fn stop(&self) -> Result<(), SpeechError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn make_controller(
    synth: MockSynth,
    sink: Arc<RecordingSink>,
) -> (
    SpeechQueueController,
    tokio::sync::mpsc::UnboundedReceiver<SpeechEvent>,
) {
    SpeechQueueController::with_backends(Arc::new(synth), sink, &SpeechQueueConfig::default())
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<SpeechEvent>) -> Vec<SpeechEvent> {
    let mut events = Vec::new();
    while let Ok(e) = rx.try_recv() {
        events.push(e);
    }
    events
}

fn scheduled(events: &[SpeechEvent]) -> Vec<(u64, Instant, Duration)> {
    events
        .iter()
        .filter_map(|e| match e {
            SpeechEvent::ChunkScheduled {
                seq,
                start,
                duration,
            } => Some((*seq, *start, *duration)),
            _ => None,
        })
        .collect()
}

fn skipped(events: &[SpeechEvent]) -> Vec<(u64, SkipReason)> {
    events
        .iter()
        .filter_map(|e| match e {
            SpeechEvent::ChunkSkipped { seq, reason } => Some((*seq, *reason)),
            _ => None,
        })
        .collect()
}

// ── Ordering & gaplessness ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn submission_order_survives_out_of_order_fetches() {
    let synth = MockSynth::new()
        .with("one", 300, Some(wav_secs(1.0)))
        .with("two", 50, Some(wav_secs(1.0)))
        .with("three", 150, Some(wav_secs(1.0)));
    let sink = RecordingSink::new();
    let (speech, mut events) = make_controller(synth, sink.clone());

    speech.speak("one");
    speech.speak("two");
    speech.speak("three");
    tokio::time::sleep(Duration::from_millis(500)).await;

    let committed = scheduled(&drain(&mut events));
    let order: Vec<u64> = committed.iter().map(|(seq, ..)| *seq).collect();
    assert_eq!(order, vec![0, 1, 2], "playback must follow submission order");

    // "two" and "three" settled long before their turn, so they queue
    // seamlessly behind "one": relative starts 0 / 1 / 2 s.
    assert_eq!(committed[1].1, committed[0].1 + Duration::from_secs(1));
    assert_eq!(committed[2].1, committed[0].1 + Duration::from_secs(2));
    assert_eq!(sink.played().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn ready_chunks_concatenate_gaplessly() {
    let synth = MockSynth::new()
        .with("one", 100, Some(wav_secs(1.0)))
        .with("two", 100, Some(wav_secs(1.0)))
        .with("three", 100, Some(wav_secs(1.0)));
    let sink = RecordingSink::new();
    let (speech, mut events) = make_controller(synth, sink);

    speech.speak("one");
    speech.speak("two");
    speech.speak("three");
    tokio::time::sleep(Duration::from_millis(500)).await;

    let committed = scheduled(&drain(&mut events));
    assert_eq!(committed.len(), 3);
    for window in committed.windows(2) {
        let (_, prev_start, prev_duration) = window[0];
        let (_, next_start, _) = window[1];
        assert_eq!(
            next_start,
            prev_start + prev_duration,
            "each chunk must start exactly when its predecessor ends"
        );
    }

    // 3 s of audio are on the timeline; still speaking until it drains.
    assert!(speech.is_speaking());
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(!speech.is_speaking());
}

#[tokio::test(start_paused = true)]
async fn speaking_flag_follows_playback() {
    let synth = MockSynth::new().with("hello", 50, Some(wav_secs(1.0)));
    let sink = RecordingSink::new();
    let (speech, _events) = make_controller(synth, sink);

    let mut speaking_rx = speech.subscribe_speaking();
    assert!(!*speaking_rx.borrow());

    speech.speak("hello");
    speaking_rx.changed().await.unwrap();
    assert!(*speaking_rx.borrow_and_update());

    speaking_rx.changed().await.unwrap();
    assert!(!*speaking_rx.borrow_and_update());
    assert!(!speech.is_speaking());
}

// ── Concurrency bound ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn fetch_concurrency_never_exceeds_the_bound() {
    let mut synth = MockSynth::new();
    for i in 0..10 {
        synth = synth.with(&format!("chunk {i}"), 200, Some(wav_secs(0.1)));
    }
    let peak_probe = Arc::new(synth);
    let sink = RecordingSink::new();
    let (speech, _events) = SpeechQueueController::with_backends(
        peak_probe.clone(),
        sink.clone(),
        &SpeechQueueConfig::default(),
    );

    for i in 0..10 {
        speech.speak(&format!("chunk {i}"));
    }
    tokio::time::sleep(Duration::from_secs(2)).await;

    let peak = peak_probe.peak.load(Ordering::SeqCst);
    assert!(peak <= 3, "peak fetch concurrency {peak} exceeded the bound");
    assert_eq!(sink.played().len(), 10, "every chunk still plays");
    assert_eq!(speech.active_fetches(), 0);
}

// ── Cancellation ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stop_silences_everything_and_later_speech_plays() {
    let synth = MockSynth::new()
        .with("slow one", 10_000, Some(wav_secs(1.0)))
        .with("slow two", 10_000, Some(wav_secs(1.0)))
        .with("hello", 50, Some(wav_secs(1.0)));
    let sink = RecordingSink::new();
    let (speech, _events) = make_controller(synth, sink.clone());

    speech.speak("slow one");
    speech.speak("slow two");
    tokio::time::sleep(Duration::from_millis(100)).await;

    speech.stop();
    speech.stop(); // idempotent
    assert!(!speech.is_speaking());

    // Nothing from before the stop ever reaches the sink.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert!(sink.played().is_empty());
    assert!(sink.stops.load(Ordering::SeqCst) >= 1);

    // The queue is immediately usable again.
    speech.speak("hello");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.played().len(), 1);
    assert!(speech.is_speaking());
}

// ── Failure isolation ──────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn failed_fetch_is_skipped_without_stalling_successors() {
    let synth = MockSynth::new()
        .with("one", 50, Some(wav_secs(1.0)))
        .with("two", 50, None)
        .with("three", 50, Some(wav_secs(1.0)));
    let sink = RecordingSink::new();
    let (speech, mut events) = make_controller(synth, sink.clone());

    speech.speak("one");
    speech.speak("two");
    speech.speak("three");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let all = drain(&mut events);
    assert_eq!(skipped(&all), vec![(1, SkipReason::FetchFailed)]);

    let committed = scheduled(&all);
    assert_eq!(
        committed.iter().map(|(seq, ..)| *seq).collect::<Vec<_>>(),
        vec![0, 2]
    );
    // The survivor closes the gap left by the failed chunk.
    assert_eq!(committed[1].1, committed[0].1 + committed[0].2);
    assert_eq!(sink.played().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn undecodable_payload_is_skipped() {
    let synth = MockSynth::new()
        .with("garbled", 50, Some(Bytes::from_static(b"not audio at all")))
        .with("fine", 50, Some(wav_secs(1.0)));
    let sink = RecordingSink::new();
    let (speech, mut events) = make_controller(synth, sink.clone());

    speech.speak("garbled");
    speech.speak("fine");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let all = drain(&mut events);
    assert_eq!(skipped(&all), vec![(0, SkipReason::DecodeFailed)]);
    assert_eq!(
        scheduled(&all).iter().map(|(seq, ..)| *seq).collect::<Vec<_>>(),
        vec![1]
    );
    assert_eq!(sink.played().len(), 1);
}

/// Sink that rejects the first N appends as a dead device would, then
/// behaves normally.
struct FlakySink {
    failures_left: AtomicUsize,
    played: Mutex<Vec<(Instant, Duration)>>,
}

impl FlakySink {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(failures),
            played: Mutex::new(Vec::new()),
        })
    }
}

impl SpeechSink for FlakySink {
    fn play(&self, clip: AudioClip, at: Instant) -> Result<(), SpeechError> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SpeechError::OutputStreamError("device gone".to_string()));
        }
        self.played.lock().unwrap().push((at, clip.duration()));
        Ok(())
    }

    fn stop(&self) -> Result<(), SpeechError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn device_rejection_skips_the_chunk_without_stalling_successors() {
    let synth = MockSynth::new()
        .with("one", 50, Some(wav_secs(1.0)))
        .with("two", 50, Some(wav_secs(1.0)));
    let sink = FlakySink::new(1);
    let (speech, mut events) = SpeechQueueController::with_backends(
        Arc::new(synth),
        sink.clone(),
        &SpeechQueueConfig::default(),
    );

    speech.speak("one");
    speech.speak("two");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let all = drain(&mut events);
    assert_eq!(skipped(&all), vec![(0, SkipReason::DeviceFailed)]);
    assert_eq!(
        scheduled(&all).iter().map(|(seq, ..)| *seq).collect::<Vec<_>>(),
        vec![1],
        "the chunk after the device rejection still plays"
    );
    assert_eq!(sink.played.lock().unwrap().len(), 1);
    assert!(speech.is_speaking());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_speak_calls_keep_chain_and_sequence_aligned() {
    let synth = MockSynth::new().with("tick", 0, Some(wav_secs(0.01)));
    let sink = RecordingSink::new();
    let (speech, mut events) = make_controller(synth, sink.clone());
    let speech = Arc::new(speech);

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let speech = Arc::clone(&speech);
        tasks.push(tokio::spawn(async move {
            for _ in 0..5 {
                speech.speak("tick");
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let seqs: Vec<u64> = scheduled(&drain(&mut events))
        .iter()
        .map(|(seq, ..)| *seq)
        .collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs.len(), 20);
    assert_eq!(seqs, sorted, "commit order must match sequence order");
}

#[tokio::test(start_paused = true)]
async fn speak_with_fires_callback_after_natural_completion() {
    let synth = MockSynth::new().with("done", 50, Some(wav_secs(1.0)));
    let sink = RecordingSink::new();
    let (speech, _events) = make_controller(synth, sink);

    let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flag = fired.clone();
    speech.speak_with(
        "done",
        Box::new(move || flag.store(true, Ordering::SeqCst)),
    );

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!fired.load(Ordering::SeqCst), "clip is still sounding");

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(fired.load(Ordering::SeqCst));
}

// ── Ducking ────────────────────────────────────────────────────────

/// Duckable resource with a live volume cell.
struct FakeMusic {
    volume: AtomicU32,
}

impl FakeMusic {
    fn new(volume: f32) -> Arc<Self> {
        Arc::new(Self {
            volume: AtomicU32::new(volume.to_bits()),
        })
    }

    fn current(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::SeqCst))
    }
}

impl DuckableResource for FakeMusic {
    fn id(&self) -> String {
        "music".to_string()
    }

    fn volume(&self) -> f32 {
        self.current()
    }

    fn set_volume(&self, volume: f32) {
        self.volume.store(volume.to_bits(), Ordering::SeqCst);
    }

    fn is_active(&self) -> bool {
        true
    }

    fn duck_factor(&self) -> f32 {
        MUSIC_DUCK_FACTOR
    }
}

#[tokio::test(start_paused = true)]
async fn background_music_ducks_while_speaking_and_restores_after() {
    let synth = MockSynth::new()
        .with("one", 50, Some(wav_secs(1.0)))
        .with("two", 50, Some(wav_secs(1.0)));
    let sink = RecordingSink::new();
    let (speech, _events) = make_controller(synth, sink);

    let music = FakeMusic::new(0.8);
    speech.register_duckable(music.clone());

    speech.speak("one");
    speech.speak("two");
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Ducked exactly once even though two chunks are sounding.
    assert!((music.current() - 0.8 * MUSIC_DUCK_FACTOR).abs() < f32::EPSILON);

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!speech.is_speaking());
    assert!((music.current() - 0.8).abs() < f32::EPSILON);
}
