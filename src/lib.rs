//! Gapless speech playback queue for text-to-speech synthesis.
//!
//! Text chunks submitted through [`SpeechQueueController::speak`] are
//! synthesized by a remote endpoint and played strictly in submission order,
//! back to back, even though fetches run in parallel (bounded by
//! [`MAX_PARALLEL_FETCHES`]) and settle in arbitrary order. A failed chunk
//! is skipped without stalling its successors, [`stop`] cuts everything
//! instantly, and registered background audio is ducked while speech sounds.
//!
//! ```no_run
//! use voxqueue::{SpeechQueueConfig, SpeechQueueController};
//!
//! # async fn demo() {
//! let (speech, mut events) = SpeechQueueController::new(&SpeechQueueConfig::default());
//! speech.speak("First sentence.");
//! speech.speak("Second sentence, played seamlessly after the first.");
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # }
//! ```
//!
//! [`stop`]: SpeechQueueController::stop

#![deny(unused_crate_dependencies)]

pub mod clip;
pub mod config;
pub mod controller;
pub mod ducking;
pub mod error;
pub mod events;
pub mod fetch;
pub mod output;
pub mod scheduler;
pub mod sink;
pub mod synth;

pub use clip::AudioClip;
pub use config::{
    DEFAULT_REQUEST_TIMEOUT_SECS, MAX_PARALLEL_FETCHES, SpeechQueueConfig, SynthesisOptions,
};
pub use controller::SpeechQueueController;
pub use ducking::{
    AMBIENT_DUCK_FACTOR, DuckableResource, DuckingCoordinator, MUSIC_DUCK_FACTOR,
};
pub use error::SpeechError;
pub use events::{SkipReason, SpeechEvent};
pub use fetch::FetchWorkerPool;
pub use output::AudioOutputContext;
pub use scheduler::{ChunkDoneCallback, PlaybackScheduler};
pub use sink::SpeechSink;
pub use synth::{HttpSynthesisClient, SynthesisClient};
