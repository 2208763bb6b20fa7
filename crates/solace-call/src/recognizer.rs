//! Streaming speech recognition as cancellable, message-passing handles.
//!
//! A recognizer consumes a [`FrameStream`] and pushes [`RecognitionEvent`]s
//! through a [`RecognitionHandle`]. Events for one handle are causally ordered;
//! after `cancel()` the handle yields nothing more.

use crate::audio::FrameStream;
use crate::cancel::CancelToken;
use crate::config::{CaptureConfig, RecognizerConfig};
use crate::stt::SttBackend;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Upper bound on buffered utterance audio; later audio is not re-transcribed.
const MAX_UTTERANCE_SECS: usize = 30;

/// Event delivered by a recognition handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Full transcript of the utterance so far
    Transcript { text: String, is_final: bool },
    /// The handle finished naturally
    Completed,
    /// The handle ended with an error; earlier transcripts remain valid
    Failed(String),
}

/// Consumer side of one recognition stream
#[derive(Debug)]
pub struct RecognitionHandle {
    events: mpsc::UnboundedReceiver<RecognitionEvent>,
    cancel: CancelToken,
}

/// Producer side of one recognition stream
#[derive(Debug, Clone)]
pub struct RecognitionSender {
    tx: mpsc::UnboundedSender<RecognitionEvent>,
    cancel: CancelToken,
}

impl RecognitionHandle {
    /// Create a connected handle/sender pair.
    pub fn channel() -> (Self, RecognitionSender) {
        let (tx, events) = mpsc::unbounded_channel();
        let cancel = CancelToken::new();
        (
            Self {
                events,
                cancel: cancel.clone(),
            },
            RecognitionSender { tx, cancel },
        )
    }

    /// Next event, or `None` once cancelled or the producer is gone.
    pub async fn next_event(&mut self) -> Option<RecognitionEvent> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Stop delivery. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token that cancels this handle, for owners that hand the handle to a task.
    pub fn canceller(&self) -> CancelToken {
        self.cancel.clone()
    }
}

impl RecognitionSender {
    /// Push an event. Returns `false` when the handle was cancelled or dropped.
    pub fn send(&self, event: RecognitionEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.tx.send(event).is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }

    pub async fn cancelled(&self) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }
}

/// Turns a stream of audio frames into a stream of transcripts.
pub trait StreamingRecognizer: Send + Sync {
    /// Start recognizing `frames`. Must be called within a tokio runtime.
    fn begin(&self, frames: FrameStream) -> RecognitionHandle;
}

/// Streaming recognizer over a batch [`SttBackend`].
///
/// Leading silence is skipped. Once voice is heard the utterance is buffered and
/// re-transcribed every `partial_interval` of voiced audio, and whenever voiced
/// audio is followed by `flush_silence` of quiet; a changed result is emitted as
/// a partial. When the frame stream ends the whole buffer is transcribed once
/// more and emitted as final.
pub struct ChunkedRecognizer<B> {
    backend: Arc<B>,
    sample_rate: u32,
    partial_samples: usize,
    flush_samples: usize,
    voiced_level: f32,
}

impl<B: SttBackend + 'static> ChunkedRecognizer<B> {
    pub fn new(backend: B, capture: &CaptureConfig, config: &RecognizerConfig) -> Self {
        let samples_for = |ms: u64| (u64::from(capture.sample_rate) * ms / 1000).max(1) as usize;
        Self {
            backend: Arc::new(backend),
            sample_rate: capture.sample_rate,
            partial_samples: samples_for(config.partial_interval_ms),
            flush_samples: samples_for(config.flush_silence_ms),
            voiced_level: config.voiced_level,
        }
    }
}

impl<B: SttBackend + 'static> StreamingRecognizer for ChunkedRecognizer<B> {
    fn begin(&self, frames: FrameStream) -> RecognitionHandle {
        let (handle, sender) = RecognitionHandle::channel();
        let job = ChunkJob {
            backend: Arc::clone(&self.backend),
            sample_rate: self.sample_rate,
            partial_samples: self.partial_samples,
            flush_samples: self.flush_samples,
            voiced_level: self.voiced_level,
            max_samples: self.sample_rate as usize * MAX_UTTERANCE_SECS,
        };
        tokio::spawn(job.run(frames, sender));
        handle
    }
}

struct ChunkJob<B> {
    backend: Arc<B>,
    sample_rate: u32,
    partial_samples: usize,
    flush_samples: usize,
    voiced_level: f32,
    max_samples: usize,
}

impl<B: SttBackend> ChunkJob<B> {
    async fn run(self, mut frames: FrameStream, sender: RecognitionSender) {
        let mut buffer: Vec<f32> = Vec::new();
        let mut voiced_since_partial = 0usize;
        // Voiced audio not yet covered by a transcription
        let mut pending_voice = false;
        let mut silent_run = 0usize;
        let mut heard_voice = false;
        let mut last_text = String::new();

        loop {
            let frame = tokio::select! {
                biased;
                _ = sender.cancelled() => return,
                frame = frames.next() => frame,
            };

            let Some(frame) = frame else {
                break;
            };

            let voiced = frame.level >= self.voiced_level;
            if voiced {
                heard_voice = true;
                pending_voice = true;
                silent_run = 0;
                voiced_since_partial += frame.samples.len();
            } else {
                silent_run += frame.samples.len();
            }
            if !heard_voice {
                continue;
            }
            if buffer.len() < self.max_samples {
                buffer.extend_from_slice(&frame.samples);
            }

            let interval_due = voiced_since_partial >= self.partial_samples;
            let speaker_paused = pending_voice && silent_run >= self.flush_samples;
            if interval_due || speaker_paused {
                voiced_since_partial = 0;
                pending_voice = false;
                match self.transcribe(&buffer, &sender).await {
                    Some(Ok(text)) => {
                        if !text.is_empty() && text != last_text {
                            last_text.clone_from(&text);
                            if !sender.send(RecognitionEvent::Transcript { text, is_final: false }) {
                                return;
                            }
                        }
                    }
                    Some(Err(reason)) => {
                        warn!(%reason, "recognition failed");
                        sender.send(RecognitionEvent::Failed(reason));
                        return;
                    }
                    None => return,
                }
            }
        }

        // Frame stream ended: capture stopped
        if heard_voice {
            match self.transcribe(&buffer, &sender).await {
                Some(Ok(text)) if !text.is_empty() => {
                    sender.send(RecognitionEvent::Transcript { text, is_final: true });
                }
                Some(Ok(_)) => {}
                Some(Err(reason)) => {
                    sender.send(RecognitionEvent::Failed(reason));
                    return;
                }
                None => return,
            }
        }
        debug!("recognition stream completed");
        sender.send(RecognitionEvent::Completed);
    }

    /// `None` when cancelled mid-request.
    async fn transcribe(&self, buffer: &[f32], sender: &RecognitionSender) -> Option<Result<String, String>> {
        tokio::select! {
            biased;
            _ = sender.cancelled() => None,
            result = self.backend.transcribe(buffer, self.sample_rate) => {
                Some(result.map_err(|e| e.to_string()))
            }
        }
    }
}
