//! `SpeechSink` trait — the playback seam between the scheduler and audio
//! hardware.
//!
//! The scheduler commits clips through this trait so that tests (and other
//! transports) can observe the device timeline without real hardware. The
//! production implementation is [`AudioOutputContext`](crate::output::AudioOutputContext).

use tokio::time::Instant;

use crate::clip::AudioClip;
use crate::error::SpeechError;

/// Abstraction over the speech output device.
///
/// # Object safety
/// All methods take `&self`; the trait is usable as `Arc<dyn SpeechSink>`
/// inside [`PlaybackScheduler`](crate::scheduler::PlaybackScheduler).
///
/// # Timeline contract
/// [`play`](Self::play) is only ever called by the serialized schedule chain,
/// with `at` equal to `max(now, previous clip's end)`. When the previous clip
/// is still sounding, `at` is exactly its end time and the implementation
/// must concatenate gaplessly (the rodio backend appends to one FIFO sink,
/// so queue order *is* the timeline). When the sink is idle, `at` is "now".
pub trait SpeechSink: Send + Sync {
    /// Commit a clip to the device timeline at absolute time `at`.
    fn play(&self, clip: AudioClip, at: Instant) -> Result<(), SpeechError>;

    /// Cut all queued and sounding audio immediately.
    fn stop(&self) -> Result<(), SpeechError>;
}
