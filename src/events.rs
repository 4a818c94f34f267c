//! Events emitted by the speech queue to the application layer.
//!
//! The event channel doubles as the telemetry hook: a skipped chunk makes no
//! sound and raises no dialog, but it is always observable here.

use std::time::Duration;

use tokio::time::Instant;

/// Why a chunk was skipped instead of played.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The fetch failed (network error or non-2xx) or was aborted.
    FetchFailed,

    /// The fetched bytes could not be decoded into a playable buffer.
    DecodeFailed,

    /// A stop was requested before the chunk could make sound.
    Stopped,

    /// The audio device rejected the clip.
    DeviceFailed,
}

/// Events emitted by the speech queue.
#[derive(Debug, Clone)]
pub enum SpeechEvent {
    /// The first active source began producing sound.
    SpeakingStarted,

    /// The last active source finished (naturally or via stop).
    SpeakingFinished,

    /// A chunk was committed to the device timeline.
    ChunkScheduled {
        /// Submission sequence number of the chunk.
        seq: u64,
        /// Absolute device-clock time at which the clip starts.
        start: Instant,
        /// Clip duration.
        duration: Duration,
    },

    /// A chunk was skipped without any audible side effect.
    ChunkSkipped {
        /// Submission sequence number of the chunk.
        seq: u64,
        /// Why the chunk was skipped.
        reason: SkipReason,
    },

    /// A chunk finished playing naturally.
    ChunkFinished {
        /// Submission sequence number of the chunk.
        seq: u64,
    },

    /// The audio device failed and could not be recreated.
    DeviceError(String),
}
