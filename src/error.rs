//! Speech queue error types.

/// Errors that can occur in the speech playback queue.
///
/// Chunk-level failures (fetch, decode, abort) are absorbed by the pipeline
/// and reported through logging and [`SpeechEvent`](crate::events::SpeechEvent)s
/// — they never reach the caller. Only device-level failures are surfaced,
/// and even those arrive on the event channel rather than as a return value
/// from [`speak`](crate::controller::SpeechQueueController::speak).
#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    /// No audio output device found.
    #[error("No audio output device found")]
    NoOutputDevice,

    /// Failed to open the audio output stream.
    #[error("Failed to open audio output stream: {0}")]
    OutputStreamError(String),

    /// The audio device died and a recreation attempt also failed.
    #[error("Audio device unrecoverable: {0}")]
    DeviceUnrecoverable(String),

    /// The synthesis request failed (network error or non-2xx response).
    #[error("Speech synthesis request failed: {0}")]
    FetchFailed(#[source] anyhow::Error),

    /// Synthesized bytes could not be decoded into a playable buffer.
    #[error("Failed to decode synthesized audio: {0}")]
    DecodeFailed(String),

    /// The dedicated audio thread is no longer responding.
    #[error("Audio thread died")]
    AudioThreadDied,
}
