//! Speech queue configuration.

use serde::{Deserialize, Serialize};

/// Maximum number of synthesis requests allowed in flight at once.
///
/// Requests beyond this bound queue FIFO inside the
/// [`FetchWorkerPool`](crate::fetch::FetchWorkerPool).
pub const MAX_PARALLEL_FETCHES: usize = 3;

/// Default request timeout for a single synthesis fetch.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Voice parameters forwarded verbatim to the synthesis endpoint.
///
/// Which fields a given endpoint honours is its own business — OpenAI-style
/// services read `model`/`voice`/`speed`, ElevenLabs-style services read
/// `voice_id`/`voice_settings`. Unset fields are omitted from the request
/// body entirely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SynthesisOptions {
    /// Synthesis model identifier (e.g. `"tts-1"`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Voice name (OpenAI-style endpoints).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Voice identifier (ElevenLabs-style endpoints).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,

    /// Playback speed multiplier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f32>,

    /// Endpoint-specific voice settings, passed through untouched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_settings: Option<serde_json::Value>,
}

/// Configuration for the speech playback queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechQueueConfig {
    /// Synthesis endpoint URL.
    pub endpoint: String,

    /// Optional bearer token for the synthesis endpoint.
    pub api_key: Option<String>,

    /// Voice parameters sent with every request.
    pub options: SynthesisOptions,

    /// Concurrency bound for synthesis fetches.
    pub max_parallel_fetches: usize,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for SpeechQueueConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8880/v1/audio/speech".to_string(),
            api_key: None,
            options: SynthesisOptions::default(),
            max_parallel_fetches: MAX_PARALLEL_FETCHES,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}
