//! # Solace Call - Live Voice Turn-Taking
//!
//! This crate runs the live voice call of the Solace wellness companion: it
//! listens to the user, decides when they have finished speaking, asks the AI
//! service for a reply, speaks it, and gets out of the way the moment the user
//! talks over it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        Turn Controller (actor)                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐           │
//! │  │   Audio In   │→ │  Recognizer  │→ │  Endpointer  │           │
//! │  │    (cpal)    │  │ (chunked STT)│  │ (1.5s quiet) │           │
//! │  └──────────────┘  └──────────────┘  └──────────────┘           │
//! │         ↑ barge-in         │                 ↓                   │
//! │  ┌──────────────┐          │         ┌──────────────┐           │
//! │  │  Audio Out   │←─────────┴─────────│ AI Service   │           │
//! │  │   (rodio)    │    Kill Signal     │ (text + TTS) │           │
//! │  └──────────────┘                    └──────────────┘           │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every collaborator posts its results into the controller's inbox; the UI
//! drives the call through a [`CallHandle`] and observes [`CallSession`]
//! snapshots and [`StateChange`]s.

pub mod audio;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod controller;
pub mod endpointer;
pub mod error;
pub mod playback;
pub mod recognizer;
pub mod response;
pub mod scripted;
pub mod session;
pub mod stt;

pub use audio::{
    compute_level, AudioCaptureSource, AudioFrame, CpalCapture, DevicePermission, FrameStream,
    MicrophonePermission,
};
pub use cancel::CancelToken;
pub use clock::SessionClock;
pub use config::{
    CallConfig, CaptureConfig, EndpointConfig, RecognizerConfig, ResponseConfig, VoicePreference,
};
pub use controller::{CallCommand, CallEvent, CallHandle, Collaborators, TurnController};
pub use endpointer::Endpointer;
pub use error::{CallError, CallResult, CaptureError};
pub use playback::{PlaybackController, PlaybackHandle, PlaybackOutcome, RodioPlayback};
pub use recognizer::{ChunkedRecognizer, RecognitionEvent, RecognitionHandle, StreamingRecognizer};
pub use response::{OpenAiResponseClient, ResponseClient};
pub use session::{CallSession, StateChange, TurnState, Utterance};
pub use stt::{OpenAiStt, SttBackend};
