//! Remote speech-synthesis client.
//!
//! The [`SynthesisClient`] trait is the seam between the fetch pool and the
//! network. The production implementation posts JSON to a configured HTTP
//! endpoint; tests inject their own implementation with canned latencies and
//! payloads.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use crate::config::{SpeechQueueConfig, SynthesisOptions};
use crate::error::SpeechError;

// ── Request body ───────────────────────────────────────────────────

/// JSON body sent to the synthesis endpoint.
///
/// `text` plus whatever voice parameters were configured — unset options
/// are omitted so the body stays compatible with endpoints that reject
/// unknown-but-null fields.
#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,

    #[serde(flatten)]
    options: &'a SynthesisOptions,
}

// ── Client trait ───────────────────────────────────────────────────

/// Abstraction over the remote synthesis endpoint.
///
/// Object-safe (`Arc<dyn SynthesisClient>`) so the fetch pool never knows
/// whether it is talking to a real service or a test double. Ordinary
/// failures (network, non-2xx) are `Err` here; the pool converts them to
/// `None` for the scheduler, so they never break the chain.
#[async_trait]
pub trait SynthesisClient: Send + Sync {
    /// Synthesize `text` into a raw audio payload.
    async fn synthesize(&self, text: &str) -> Result<Bytes, SpeechError>;
}

// ── HTTP implementation ────────────────────────────────────────────

/// Production synthesis client — JSON POST over HTTP with optional bearer
/// auth and a per-request timeout.
pub struct HttpSynthesisClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    options: SynthesisOptions,
}

impl HttpSynthesisClient {
    /// Create a client from queue configuration.
    #[must_use]
    pub fn new(config: &SpeechQueueConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .expect("failed to create HTTP client");

        Self {
            client,
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            options: config.options.clone(),
        }
    }
}

#[async_trait]
impl SynthesisClient for HttpSynthesisClient {
    async fn synthesize(&self, text: &str) -> Result<Bytes, SpeechError> {
        let body = SynthesisRequest {
            text,
            options: &self.options,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| SpeechError::FetchFailed(e.into()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SpeechError::FetchFailed(anyhow::anyhow!(
                "synthesis endpoint returned {status}"
            )));
        }

        response
            .bytes()
            .await
            .map_err(|e| SpeechError::FetchFailed(e.into()))
    }
}
