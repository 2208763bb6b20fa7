//! **Speech-to-Text (STT)** — batch transcription of buffered PCM.
//!
//! `SttBackend` is the one-shot contract the chunked recognizer builds its
//! streaming behaviour on. `OpenAiStt` talks to any OpenAI-compatible
//! `/audio/transcriptions` endpoint.

use crate::config::RecognizerConfig;
use crate::error::{CallError, CallResult};
use async_trait::async_trait;
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

/// Backend for converting PCM to text.
#[async_trait]
pub trait SttBackend: Send + Sync {
    /// Transcribe mono f32 PCM. Return an empty string if nothing was said.
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> CallResult<String>;
}

/// Encode f32 PCM (mono) to 16-bit WAV bytes for API upload.
pub fn pcm_to_wav(samples: &[f32], sample_rate: u32) -> CallResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            let i = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
            writer.write_sample(i)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Production STT backend: OpenAI-compatible transcription API (OpenAI Whisper, OpenRouter, etc.).
#[derive(Debug, Clone)]
pub struct OpenAiStt {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// Model: whisper-1 or gpt-4o-transcribe, etc.
    pub model: String,
    client: reqwest::Client,
}

impl OpenAiStt {
    /// Create with explicit config.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> CallResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }

    /// Build from the recognizer config plus `SOLACE_API_KEY` (or `OPENAI_API_KEY`).
    pub fn from_env(base_url: &str, config: &RecognizerConfig) -> CallResult<Self> {
        let api_key = crate::response::api_key_from_env()?;
        Self::new(base_url, api_key, config.model.clone())
    }
}

#[async_trait]
impl SttBackend for OpenAiStt {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> CallResult<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        let wav = pcm_to_wav(samples, sample_rate)?;
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());

        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(CallError::Recognition(format!("STT API error {status}: {body}")));
        }

        let json: serde_json::Value = res.json().await?;
        let text = json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();
        debug!(samples = samples.len(), chars = text.len(), "transcribed audio");
        Ok(text)
    }
}
