//! Layered configuration for the call controller.
//!
//! Precedence: built-in defaults < TOML file < `SOLACE__*` environment variables.
//! The file is taken from `SOLACE_CONFIG` when set, otherwise `config/solace.toml`
//! (skipped silently when missing).

use crate::error::{CallError, CallResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "config/solace.toml";

/// Endpointing (silence-based "user finished speaking") settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Silence after the last transcript change before the turn is committed (default: 1500ms)
    pub silence_ms: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self { silence_ms: 1500 }
    }
}

impl EndpointConfig {
    pub fn silence(&self) -> Duration {
        Duration::from_millis(self.silence_ms)
    }
}

/// Microphone capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Frame size in samples (default: 480 for 30ms at 16kHz)
    pub chunk_size: usize,

    /// Gain applied to the mean absolute amplitude before clamping (default: 5.0)
    pub level_gain: f32,

    /// Minimum spacing between level updates published to observers (default: 50ms)
    pub level_interval_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            chunk_size: 480,
            level_gain: 5.0,
            level_interval_ms: 50,
        }
    }
}

/// Settings for the chunked streaming recognizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecognizerConfig {
    /// Voiced audio between partial re-transcriptions (default: 1000ms)
    pub partial_interval_ms: u64,

    /// Frame level at or above which audio counts as voiced (default: 0.02)
    pub voiced_level: f32,

    /// Silence after voiced audio that flushes it to a transcript (default: 300ms)
    pub flush_silence_ms: u64,

    /// Transcription model for the OpenAI-compatible backend
    pub model: String,
}

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            partial_interval_ms: 1000,
            voiced_level: 0.02,
            flush_silence_ms: 300,
            model: "whisper-1".to_string(),
        }
    }
}

/// AI completion and speech synthesis service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1)
    pub base_url: String,
    pub chat_model: String,
    pub speech_model: String,
    /// System prompt sent ahead of the conversation history
    pub system_prompt: String,
    /// Number of user/assistant exchanges kept as context (default: 8)
    pub history_turns: usize,
    pub timeout_secs: u64,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            speech_model: "tts-1".to_string(),
            system_prompt: "You are a calm, supportive wellness companion on a voice call. \
                Keep replies short and conversational."
                .to_string(),
            history_turns: 8,
            timeout_secs: 60,
        }
    }
}

/// Voice preference supplied per session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoicePreference {
    /// Explicit synthesis voice (e.g. "nova"). Empty means derive from tone/gender.
    pub voice_key: String,
    /// e.g. "warm", "calm", "energetic"
    pub tone: String,
    /// e.g. "female", "male", "neutral"
    pub gender: String,
}

impl Default for VoicePreference {
    fn default() -> Self {
        Self {
            voice_key: String::new(),
            tone: "calm".to_string(),
            gender: "female".to_string(),
        }
    }
}

/// Top-level configuration for a call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub endpoint: EndpointConfig,
    pub capture: CaptureConfig,
    pub recognizer: RecognizerConfig,
    pub response: ResponseConfig,
    pub voice: VoicePreference,
    /// Spoken when a session starts. Empty skips the greeting.
    pub greeting: String,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            capture: CaptureConfig::default(),
            recognizer: RecognizerConfig::default(),
            response: ResponseConfig::default(),
            voice: VoicePreference::default(),
            greeting: "Hi, I'm here with you. How are you feeling today?".to_string(),
        }
    }
}

impl CallConfig {
    /// Load config from file and environment. Precedence: env `SOLACE_CONFIG` path > `config/solace.toml` > defaults.
    pub fn load() -> CallResult<Self> {
        let path = std::env::var("SOLACE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load from an explicit file (if it exists) layered over defaults, then `SOLACE__*` env.
    pub fn load_from(path: &Path) -> CallResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("SOLACE").separator("__"))
            .build()?;

        let config: Self = built.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Write this config as pretty TOML, creating parent directories.
    pub fn save_to(&self, path: &Path) -> CallResult<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values that would stall or break the call loop.
    pub fn validate(&self) -> CallResult<()> {
        if self.endpoint.silence_ms == 0 {
            return Err(CallError::InvalidConfig("endpoint.silence_ms must be > 0".to_string()));
        }
        if self.capture.sample_rate == 0 {
            return Err(CallError::InvalidConfig("capture.sample_rate must be > 0".to_string()));
        }
        if self.capture.chunk_size == 0 {
            return Err(CallError::InvalidConfig("capture.chunk_size must be > 0".to_string()));
        }
        if !(self.capture.level_gain >= 0.0) {
            return Err(CallError::InvalidConfig(format!(
                "capture.level_gain must be >= 0, got {}",
                self.capture.level_gain
            )));
        }
        if self.recognizer.partial_interval_ms == 0 {
            return Err(CallError::InvalidConfig(
                "recognizer.partial_interval_ms must be > 0".to_string(),
            ));
        }
        if self.recognizer.flush_silence_ms >= self.endpoint.silence_ms {
            return Err(CallError::InvalidConfig(format!(
                "recognizer.flush_silence_ms ({}) must be shorter than endpoint.silence_ms ({})",
                self.recognizer.flush_silence_ms, self.endpoint.silence_ms
            )));
        }
        Ok(())
    }
}
