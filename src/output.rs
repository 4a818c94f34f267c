//! Audio output context — owns the shared output device and the speech gain.
//!
//! `rodio::OutputStream` is `!Send` on some platforms, so the device lives on
//! a dedicated OS thread behind a command channel; [`AudioOutputContext`] is
//! the `Send + Sync` proxy the rest of the crate holds.
//!
//! Lifecycle is explicit: the device is created on first use, every playback
//! attempt is preceded by a health probe, a dead device is recreated exactly
//! once before the failure is surfaced (on the event channel — never as a
//! panic), and [`shutdown`](AudioOutputContext::shutdown) or dropping the
//! context releases the device.
//!
//! Output level is `speech_volume × master_volume`, recomputed reactively by
//! a watcher task whenever either input changes.

use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use rodio::{OutputStream, OutputStreamHandle, Sink};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::clip::AudioClip;
use crate::error::SpeechError;
use crate::events::SpeechEvent;
use crate::sink::SpeechSink;

// ── Commands ───────────────────────────────────────────────────────

/// A command sent from the context to the audio thread.
enum OutputCommand {
    /// Append a clip to the speech queue.
    Play {
        samples: Vec<f32>,
        channels: u16,
        sample_rate: u32,
        reply: mpsc::Sender<Result<(), SpeechError>>,
    },

    /// Apply a new combined gain to the speech queue.
    SetGain { gain: f32 },

    /// Cut all queued and sounding audio.
    StopAll { reply: mpsc::Sender<()> },

    /// Health probe — replies if the thread is alive.
    Ping { reply: mpsc::Sender<()> },

    /// Shut down the audio thread, releasing the device.
    Shutdown,
}

// ── Device thread ──────────────────────────────────────────────────

/// Handle to the dedicated audio OS thread.
struct DeviceThread {
    cmd_tx: mpsc::Sender<OutputCommand>,
    thread: Option<thread::JoinHandle<()>>,
}

impl DeviceThread {
    /// Spawn the audio thread and open the default output device on it.
    ///
    /// Device-open errors are propagated back through a one-shot init channel.
    fn spawn(initial_gain: f32) -> Result<Self, SpeechError> {
        let (cmd_tx, cmd_rx) = mpsc::channel::<OutputCommand>();
        let (init_tx, init_rx) = mpsc::channel::<Result<(), SpeechError>>();

        let thread = thread::Builder::new()
            .name("voxqueue-audio".into())
            .spawn(move || Self::run(&cmd_rx, &init_tx, initial_gain))
            .map_err(|e| {
                SpeechError::OutputStreamError(format!("failed to spawn audio thread: {e}"))
            })?;

        // Wait for the audio thread to finish opening the device.
        init_rx.recv().map_err(|_| SpeechError::AudioThreadDied)??;

        Ok(Self {
            cmd_tx,
            thread: Some(thread),
        })
    }

    /// Send a command that expects a reply, blocking until the audio thread
    /// responds. Channel failures map to [`SpeechError::AudioThreadDied`].
    fn send_and_recv<T>(
        &self,
        build: impl FnOnce(mpsc::Sender<T>) -> OutputCommand,
    ) -> Result<T, SpeechError> {
        let (tx, rx) = mpsc::channel();
        self.cmd_tx
            .send(build(tx))
            .map_err(|_| SpeechError::AudioThreadDied)?;
        rx.recv().map_err(|_| SpeechError::AudioThreadDied)
    }

    /// The body of the audio thread. Owns the output stream and the speech
    /// sink for their entire lifetime — they never cross thread boundaries.
    fn run(
        cmd_rx: &mpsc::Receiver<OutputCommand>,
        init_tx: &mpsc::Sender<Result<(), SpeechError>>,
        initial_gain: f32,
    ) {
        let (stream, handle) = match OutputStream::try_default() {
            Ok(pair) => pair,
            Err(rodio::StreamError::NoDevice) => {
                let _ = init_tx.send(Err(SpeechError::NoOutputDevice));
                return;
            }
            Err(e) => {
                let _ = init_tx.send(Err(SpeechError::OutputStreamError(e.to_string())));
                return;
            }
        };

        if init_tx.send(Ok(())).is_err() {
            // Caller dropped — nothing to do.
            return;
        }
        tracing::info!("Speech output initialized on default output device");

        let mut gain = initial_gain;
        // One long-lived FIFO sink per speaking session; recreated after a
        // stop, matching the clip concatenation contract in `SpeechSink`.
        let mut sink: Option<Sink> = None;

        while let Ok(cmd) = cmd_rx.recv() {
            match cmd {
                OutputCommand::Play {
                    samples,
                    channels,
                    sample_rate,
                    reply,
                } => {
                    let result = Self::ensure_sink(&handle, &mut sink, gain).map(|s| {
                        s.append(rodio::buffer::SamplesBuffer::new(
                            channels,
                            sample_rate,
                            samples,
                        ));
                    });
                    let _ = reply.send(result);
                }

                OutputCommand::SetGain { gain: new_gain } => {
                    gain = new_gain;
                    if let Some(ref s) = sink {
                        s.set_volume(gain);
                    }
                }

                OutputCommand::StopAll { reply } => {
                    if let Some(s) = sink.take() {
                        s.stop();
                    }
                    let _ = reply.send(());
                }

                OutputCommand::Ping { reply } => {
                    let _ = reply.send(());
                }

                OutputCommand::Shutdown => break,
            }
        }

        tracing::debug!("Audio output thread shutting down");
        drop(stream);
    }

    /// Get the current speech sink, creating one if none is active.
    fn ensure_sink<'a>(
        handle: &OutputStreamHandle,
        sink: &'a mut Option<Sink>,
        gain: f32,
    ) -> Result<&'a Sink, SpeechError> {
        if sink.is_none() {
            let s = Sink::try_new(handle)
                .map_err(|e| SpeechError::OutputStreamError(e.to_string()))?;
            s.set_volume(gain);
            *sink = Some(s);
        }
        Ok(sink.as_ref().expect("sink just ensured"))
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        // Best-effort shutdown — the thread may already be dead.
        let _ = self.cmd_tx.send(OutputCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

// ── AudioOutputContext ─────────────────────────────────────────────

struct OutputInner {
    /// The device thread, created on first use.
    device: Mutex<Option<DeviceThread>>,

    /// Speech channel volume input, `[0, 1]`.
    speech_volume: watch::Sender<f32>,

    /// Master volume input, `[0, 1]`.
    master_volume: watch::Sender<f32>,

    /// Device failures are reported here — never as panics or `speak` errors.
    events: tokio::sync::mpsc::UnboundedSender<SpeechEvent>,
}

impl OutputInner {
    /// Current combined gain: `speech × master`.
    fn gain(&self) -> f32 {
        (*self.speech_volume.borrow() * *self.master_volume.borrow()).clamp(0.0, 1.0)
    }

    /// Apply a recomputed gain to the live device, if any.
    ///
    /// A dead thread is left alone here; the next playback attempt runs the
    /// probe/recreate path.
    fn apply_gain(&self, gain: f32) {
        let guard = self.device.lock().unwrap();
        if let Some(ref device) = *guard {
            let _ = device.cmd_tx.send(OutputCommand::SetGain { gain });
        }
    }

    /// Report a device failure on the event channel.
    fn report_device_failure(&self, error: &SpeechError) {
        tracing::error!(error = %error, "audio device failure");
        let _ = self
            .events
            .send(SpeechEvent::DeviceError(error.to_string()));
    }

    /// Run `op` against the device, creating it on first use and recreating
    /// it exactly once if it turns out to be dead.
    fn with_device<T>(
        &self,
        op: impl Fn(&DeviceThread) -> Result<T, SpeechError>,
    ) -> Result<T, SpeechError> {
        let mut guard = self.device.lock().unwrap();

        if guard.is_none() {
            match DeviceThread::spawn(self.gain()) {
                Ok(device) => *guard = Some(device),
                Err(e) => {
                    self.report_device_failure(&e);
                    return Err(e);
                }
            }
        }

        let first = op(guard.as_ref().expect("device just ensured"));
        let recreate = matches!(
            first,
            Err(SpeechError::AudioThreadDied | SpeechError::OutputStreamError(_))
        );
        if !recreate {
            return first;
        }

        // The device died under us — rebuild the whole output graph once.
        tracing::warn!("audio device unusable — recreating output graph");
        *guard = None;

        let result = match DeviceThread::spawn(self.gain()) {
            Ok(device) => {
                let retried = op(&device);
                *guard = Some(device);
                retried
            }
            Err(e) => Err(SpeechError::DeviceUnrecoverable(e.to_string())),
        };

        if let Err(ref e) = result {
            self.report_device_failure(e);
        }
        result
    }
}

/// `Send + Sync` handle to the process-wide speech output device.
///
/// Cheap to clone; all clones share one device thread and one pair of volume
/// inputs.
#[derive(Clone)]
pub struct AudioOutputContext {
    inner: Arc<OutputInner>,
}

impl AudioOutputContext {
    /// Create a context. The device itself is not opened until the first
    /// playback attempt or [`ensure_running`](Self::ensure_running) call.
    ///
    /// Must be called from within a tokio runtime — a watcher task is
    /// spawned to recompute the output gain when either volume changes.
    #[must_use]
    pub fn new(events: tokio::sync::mpsc::UnboundedSender<SpeechEvent>) -> Self {
        let (speech_volume, _) = watch::channel(1.0_f32);
        let (master_volume, _) = watch::channel(1.0_f32);

        let inner = Arc::new(OutputInner {
            device: Mutex::new(None),
            speech_volume,
            master_volume,
            events,
        });

        Self::spawn_gain_watcher(&inner);

        Self { inner }
    }

    /// Recompute and apply the combined gain whenever either input changes.
    ///
    /// Holds only a weak reference so dropping the last context ends the task.
    fn spawn_gain_watcher(inner: &Arc<OutputInner>) {
        let mut speech_rx = inner.speech_volume.subscribe();
        let mut master_rx = inner.master_volume.subscribe();
        let weak = Arc::downgrade(inner);

        tokio::spawn(async move {
            loop {
                let changed = tokio::select! {
                    r = speech_rx.changed() => r,
                    r = master_rx.changed() => r,
                };
                if changed.is_err() {
                    break;
                }
                let Some(inner) = weak.upgrade() else { break };

                speech_rx.mark_unchanged();
                master_rx.mark_unchanged();
                inner.apply_gain(inner.gain());
            }
        });
    }

    /// Set the speech channel volume (`[0, 1]`).
    pub fn set_speech_volume(&self, volume: f32) {
        self.inner.speech_volume.send_replace(volume.clamp(0.0, 1.0));
    }

    /// Set the master volume (`[0, 1]`).
    pub fn set_master_volume(&self, volume: f32) {
        self.inner.master_volume.send_replace(volume.clamp(0.0, 1.0));
    }

    /// Ensure the device is open and responding, creating or recreating it
    /// as needed.
    pub fn ensure_running(&self) -> Result<(), SpeechError> {
        self.inner
            .with_device(|device| device.send_and_recv(|reply| OutputCommand::Ping { reply }))
    }

    /// Whether this backend can rebuild its output graph after device loss.
    #[must_use]
    pub const fn can_recreate(&self) -> bool {
        true
    }

    /// Release the device and join the audio thread.
    ///
    /// A later playback attempt re-opens the device lazily.
    pub fn shutdown(&self) {
        self.inner.device.lock().unwrap().take();
    }
}

impl SpeechSink for AudioOutputContext {
    fn play(&self, clip: AudioClip, at: Instant) -> Result<(), SpeechError> {
        tracing::debug!(
            lead_ms = at.saturating_duration_since(Instant::now()).as_millis(),
            sample_rate = clip.sample_rate,
            "committing clip to output device"
        );

        self.inner.with_device(|device| {
            device.send_and_recv(|reply| OutputCommand::Play {
                samples: clip.samples.clone(),
                channels: clip.channels,
                sample_rate: clip.sample_rate,
                reply,
            })?
        })
    }

    fn stop(&self) -> Result<(), SpeechError> {
        // Nothing to cut if the device was never opened.
        let guard = self.inner.device.lock().unwrap();
        let Some(ref device) = *guard else {
            return Ok(());
        };
        device.send_and_recv(|reply| OutputCommand::StopAll { reply })
    }
}
