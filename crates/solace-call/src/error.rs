//! Error types for the Solace call controller

use thiserror::Error;

/// Result type alias for call operations
pub type CallResult<T> = Result<T, CallError>;

/// Failures while configuring or running the microphone.
///
/// These are the only errors that surface to the UI: the controller moves the
/// session into `TurnState::Error` when one occurs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    PermissionDenied,

    #[error("no input device available")]
    NoDevice,

    #[error("audio session could not be configured: {0}")]
    Configure(String),

    #[error("audio stream error: {0}")]
    Stream(String),
}

/// Errors that can occur in the call controller and its collaborators
#[derive(Error, Debug)]
pub enum CallError {
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("recognition error: {0}")]
    Recognition(String),

    #[error("response error: {0}")]
    Response(String),

    #[error("synthesis error: {0}")]
    Synthesis(String),

    #[error("playback error: {0}")]
    Playback(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("config serialization error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("controller is no longer running")]
    ChannelClosed,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cpal::DevicesError> for CaptureError {
    fn from(err: cpal::DevicesError) -> Self {
        CaptureError::Configure(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for CaptureError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        CaptureError::Configure(err.to_string())
    }
}

impl From<cpal::BuildStreamError> for CaptureError {
    fn from(err: cpal::BuildStreamError) -> Self {
        CaptureError::Stream(err.to_string())
    }
}

impl From<cpal::PlayStreamError> for CaptureError {
    fn from(err: cpal::PlayStreamError) -> Self {
        CaptureError::Stream(err.to_string())
    }
}

impl From<hound::Error> for CallError {
    fn from(err: hound::Error) -> Self {
        CallError::Recognition(format!("WAV encoding failed: {err}"))
    }
}
