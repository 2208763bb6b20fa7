//! AI service boundary: text completion and speech synthesis.
//!
//! Failures come back as `Err`, never as reply text, so the controller can
//! fall back to listening instead of speaking an error message aloud.

use crate::config::{ResponseConfig, VoicePreference};
use crate::error::{CallError, CallResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Text completion and speech synthesis for one call.
#[async_trait]
pub trait ResponseClient: Send + Sync {
    /// Reply to what the user just said.
    async fn request_text_response(&self, transcript: &str) -> CallResult<String>;

    /// Synthesize `text` into encoded audio (WAV/MP3) in the preferred voice.
    async fn request_speech_audio(&self, text: &str, voice: &VoicePreference) -> CallResult<Vec<u8>>;

    /// A new call is starting; forget anything tied to the previous one.
    fn begin_session(&self) {}
}

/// API key from `SOLACE_API_KEY`, falling back to `OPENAI_API_KEY`.
pub fn api_key_from_env() -> CallResult<String> {
    std::env::var("SOLACE_API_KEY")
        .or_else(|_| std::env::var("OPENAI_API_KEY"))
        .map(|k| k.trim().to_string())
        .ok()
        .filter(|k| !k.is_empty())
        .ok_or_else(|| CallError::InvalidConfig("requires SOLACE_API_KEY or OPENAI_API_KEY".to_string()))
}

/// Map a voice preference to an OpenAI TTS voice. An explicit key always wins;
/// otherwise warmer voices for warm/calm tones and drier ones for energetic.
pub fn voice_for(pref: &VoicePreference) -> String {
    let key = pref.voice_key.trim();
    if !key.is_empty() {
        return key.to_string();
    }
    let gender = pref.gender.to_ascii_lowercase();
    let tone = pref.tone.to_ascii_lowercase();
    let voice = match (gender.as_str(), tone.as_str()) {
        ("male", "warm") => "echo",
        ("male", "energetic") => "fable",
        ("male", _) => "onyx",
        ("neutral", _) => "alloy",
        (_, "energetic") => "nova",
        (_, "warm") => "coral",
        _ => "shimmer",
    };
    voice.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// Rolling user/assistant exchange history
#[derive(Debug, Default)]
struct History {
    messages: VecDeque<ChatMessage>,
    max_turns: usize,
}

impl History {
    fn new(max_turns: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            max_turns,
        }
    }

    fn record(&mut self, user: &str, assistant: &str) {
        self.messages.push_back(ChatMessage {
            role: "user".to_string(),
            content: user.to_string(),
        });
        self.messages.push_back(ChatMessage {
            role: "assistant".to_string(),
            content: assistant.to_string(),
        });
        while self.messages.len() > self.max_turns * 2 {
            self.messages.pop_front();
        }
    }

    fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }
}

/// Production client for OpenAI-compatible chat completion and `/audio/speech`.
pub struct OpenAiResponseClient {
    config: ResponseConfig,
    api_key: String,
    history: Mutex<History>,
    client: reqwest::Client,
}

impl OpenAiResponseClient {
    pub fn new(config: ResponseConfig, api_key: impl Into<String>) -> CallResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            history: Mutex::new(History::new(config.history_turns)),
            config,
            api_key: api_key.into(),
            client,
        })
    }

    /// Build from config plus `SOLACE_API_KEY` (or `OPENAI_API_KEY`).
    pub fn from_env(config: ResponseConfig) -> CallResult<Self> {
        let key = api_key_from_env()?;
        Self::new(config, key)
    }

    /// Forget the conversation so far (new session).
    pub fn clear_history(&self) {
        if let Ok(mut history) = self.history.lock() {
            history.messages.clear();
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn build_messages(&self, transcript: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage {
            role: "system".to_string(),
            content: self.config.system_prompt.clone(),
        }];
        if let Ok(history) = self.history.lock() {
            messages.extend(history.snapshot());
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: transcript.to_string(),
        });
        messages
    }
}

#[async_trait]
impl ResponseClient for OpenAiResponseClient {
    fn begin_session(&self) {
        self.clear_history();
        debug!("conversation history cleared for new session");
    }

    async fn request_text_response(&self, transcript: &str) -> CallResult<String> {
        let body = ChatRequest {
            model: &self.config.chat_model,
            messages: self.build_messages(transcript),
            max_tokens: Some(300),
        };

        let res = self
            .client
            .post(self.url("chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::Response(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(CallError::Response(format!("completion API error {status}: {body}")));
        }

        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| CallError::Response(format!("completion parse failed: {e}")))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| CallError::Response("completion returned no text".to_string()))?;

        if let Ok(mut history) = self.history.lock() {
            history.record(transcript, &text);
        }
        debug!(chars = text.len(), "completion received");
        Ok(text)
    }

    async fn request_speech_audio(&self, text: &str, voice: &VoicePreference) -> CallResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CallError::Synthesis("nothing to synthesize".to_string()));
        }
        let body = serde_json::json!({
            "model": self.config.speech_model,
            "input": text,
            "voice": voice_for(voice),
        });
        let res = self
            .client
            .post(self.url("audio/speech"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| CallError::Synthesis(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(CallError::Synthesis(format!("TTS API error {status}: {body}")));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| CallError::Synthesis(e.to_string()))?;
        if bytes.is_empty() {
            return Err(CallError::Synthesis("TTS returned no audio".to_string()));
        }
        Ok(bytes.to_vec())
    }
}
