//! Decoded audio clips — the playable unit of the speech queue.

use std::io::Cursor;
use std::time::Duration;

use rodio::Source;

use crate::error::SpeechError;

/// A decoded, playable audio clip.
///
/// Samples are interleaved f32 PCM, ready to be handed to the output sink
/// without further conversion.
#[derive(Debug, Clone)]
pub struct AudioClip {
    /// Interleaved PCM f32 samples.
    pub samples: Vec<f32>,

    /// Number of interleaved channels.
    pub channels: u16,

    /// Sample rate in Hz.
    pub sample_rate: u32,
}

impl AudioClip {
    /// Playback duration of the clip.
    #[must_use]
    pub fn duration(&self) -> Duration {
        let frames = self.samples.len() / usize::from(self.channels.max(1));

        #[allow(clippy::cast_precision_loss)]
        Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate.max(1)))
    }
}

/// Decode raw synthesized bytes (WAV, MP3, …) into an [`AudioClip`].
///
/// The container format is sniffed by rodio; anything it cannot decode is a
/// [`SpeechError::DecodeFailed`], which the scheduler treats as a skipped
/// chunk rather than a pipeline error.
pub fn decode_clip(bytes: &[u8]) -> Result<AudioClip, SpeechError> {
    let decoder = rodio::Decoder::new(Cursor::new(bytes.to_vec()))
        .map_err(|e| SpeechError::DecodeFailed(e.to_string()))?;

    let channels = decoder.channels();
    let sample_rate = decoder.sample_rate();
    let samples: Vec<f32> = decoder.convert_samples().collect();

    if samples.is_empty() {
        return Err(SpeechError::DecodeFailed(
            "decoded to zero samples".to_string(),
        ));
    }

    Ok(AudioClip {
        samples,
        channels,
        sample_rate,
    })
}
