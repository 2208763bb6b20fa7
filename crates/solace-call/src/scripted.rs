//! Scripted collaborators for deterministic tests and hardware-free demos.
//!
//! Each constructor returns the collaborator plus a probe. The probe drives the
//! script (push frames, emit transcripts, finish playback) and reports what the
//! controller did with it (active streams, requests made).

use crate::audio::{AudioCaptureSource, AudioFrame, FrameStream, MicrophonePermission};
use crate::config::VoicePreference;
use crate::error::{CallError, CallResult, CaptureError};
use crate::playback::{PlaybackController, PlaybackHandle, PlaybackOutcome, PlaybackReporter};
use crate::recognizer::{RecognitionEvent, RecognitionHandle, RecognitionSender, StreamingRecognizer};
use crate::response::ResponseClient;
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking test thread must not hide the state from the others
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

// -----------------------------------------------------------------------------
// Capture
// -----------------------------------------------------------------------------

#[derive(Default)]
struct CaptureState {
    frame_tx: Option<mpsc::UnboundedSender<AudioFrame>>,
    starts: usize,
    fail_next: Option<CaptureError>,
}

/// Microphone that produces only what the probe pushes.
pub struct ScriptedCapture {
    state: Arc<Mutex<CaptureState>>,
    gain: f32,
}

/// Drives and inspects a [`ScriptedCapture`]
#[derive(Clone)]
pub struct CaptureProbe {
    state: Arc<Mutex<CaptureState>>,
    gain: f32,
}

impl ScriptedCapture {
    pub fn new(gain: f32) -> (Self, CaptureProbe) {
        let state = Arc::new(Mutex::new(CaptureState::default()));
        (
            Self {
                state: Arc::clone(&state),
                gain,
            },
            CaptureProbe { state, gain },
        )
    }
}

impl AudioCaptureSource for ScriptedCapture {
    fn start(&mut self) -> Result<FrameStream, CaptureError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.frame_tx = Some(tx);
        state.starts += 1;
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    fn stop(&mut self) {
        lock(&self.state).frame_tx = None;
    }

    fn is_capturing(&self) -> bool {
        lock(&self.state).frame_tx.is_some()
    }
}

impl CaptureProbe {
    pub fn is_active(&self) -> bool {
        lock(&self.state).frame_tx.is_some()
    }

    pub fn start_count(&self) -> usize {
        lock(&self.state).starts
    }

    /// Make the next `start()` fail with `err`.
    pub fn fail_next_start(&self, err: CaptureError) {
        lock(&self.state).fail_next = Some(err);
    }

    /// Push one frame of samples. Returns `false` when capture is stopped.
    pub fn push_samples(&self, samples: Vec<f32>) -> bool {
        let state = lock(&self.state);
        match &state.frame_tx {
            Some(tx) => tx.send(AudioFrame::new(samples, self.gain)).is_ok(),
            None => false,
        }
    }
}

// -----------------------------------------------------------------------------
// Recognition
// -----------------------------------------------------------------------------

/// One begun recognition. The frames are held so the capture tap never sees
/// a closed channel.
struct Recognition {
    sender: RecognitionSender,
    _frames: FrameStream,
}

#[derive(Default)]
struct RecognizerState {
    /// Live recognitions by begin order; cancelled ones are pruned
    live: BTreeMap<usize, Recognition>,
    begun: usize,
}

impl RecognizerState {
    fn prune(&mut self) {
        self.live.retain(|_, r| !r.sender.is_cancelled());
    }
}

/// Recognizer whose transcripts come from the probe.
pub struct ScriptedRecognizer {
    state: Arc<Mutex<RecognizerState>>,
}

/// Drives and inspects a [`ScriptedRecognizer`]
#[derive(Clone)]
pub struct RecognizerProbe {
    state: Arc<Mutex<RecognizerState>>,
}

impl ScriptedRecognizer {
    pub fn new() -> (Self, RecognizerProbe) {
        let state = Arc::new(Mutex::new(RecognizerState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            RecognizerProbe { state },
        )
    }
}

impl StreamingRecognizer for ScriptedRecognizer {
    fn begin(&self, frames: FrameStream) -> RecognitionHandle {
        let (handle, sender) = RecognitionHandle::channel();
        let mut state = lock(&self.state);
        state.prune();
        let index = state.begun;
        state.begun += 1;
        state.live.insert(
            index,
            Recognition {
                sender,
                _frames: frames,
            },
        );
        handle
    }
}

impl RecognizerProbe {
    /// Handles begun so far
    pub fn begin_count(&self) -> usize {
        lock(&self.state).begun
    }

    /// Handles neither cancelled nor dropped by the consumer
    pub fn active_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.prune();
        state.live.len()
    }

    /// Begun handles still held (and their frame streams)
    pub fn retained_count(&self) -> usize {
        lock(&self.state).live.len()
    }

    fn send_latest(&self, event: RecognitionEvent) -> bool {
        let state = lock(&self.state);
        let latest = state.begun.checked_sub(1);
        latest
            .and_then(|index| state.live.get(&index))
            .is_some_and(|r| r.sender.send(event))
    }

    /// Emit a transcript on the most recent handle. `false` if it was cancelled.
    pub fn emit(&self, text: &str, is_final: bool) -> bool {
        self.send_latest(RecognitionEvent::Transcript {
            text: text.to_string(),
            is_final,
        })
    }

    pub fn complete(&self) -> bool {
        self.send_latest(RecognitionEvent::Completed)
    }

    pub fn fail(&self, reason: &str) -> bool {
        self.send_latest(RecognitionEvent::Failed(reason.to_string()))
    }

    /// Emit on a specific (possibly stale) handle, by begin order.
    pub fn emit_on(&self, index: usize, text: &str) -> bool {
        let state = lock(&self.state);
        state.live.get(&index).is_some_and(|r| {
            r.sender.send(RecognitionEvent::Transcript {
                text: text.to_string(),
                is_final: false,
            })
        })
    }
}

// -----------------------------------------------------------------------------
// AI service
// -----------------------------------------------------------------------------

#[derive(Default)]
struct ResponseState {
    text_replies: VecDeque<CallResult<String>>,
    speech_replies: VecDeque<CallResult<Vec<u8>>>,
    text_requests: Vec<String>,
    speech_requests: Vec<String>,
    sessions: usize,
    delay: Duration,
}

/// AI service answering from queued replies. With nothing queued it answers
/// "I hear you." and synthesizes a few placeholder bytes.
pub struct ScriptedResponseClient {
    state: Arc<Mutex<ResponseState>>,
}

/// Drives and inspects a [`ScriptedResponseClient`]
#[derive(Clone)]
pub struct ResponseProbe {
    state: Arc<Mutex<ResponseState>>,
}

impl ScriptedResponseClient {
    pub fn new() -> (Self, ResponseProbe) {
        let state = Arc::new(Mutex::new(ResponseState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            ResponseProbe { state },
        )
    }
}

#[async_trait]
impl ResponseClient for ScriptedResponseClient {
    fn begin_session(&self) {
        lock(&self.state).sessions += 1;
    }

    async fn request_text_response(&self, transcript: &str) -> CallResult<String> {
        let delay = {
            let mut state = lock(&self.state);
            state.text_requests.push(transcript.to_string());
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        lock(&self.state)
            .text_replies
            .pop_front()
            .unwrap_or_else(|| Ok("I hear you.".to_string()))
    }

    async fn request_speech_audio(&self, text: &str, _voice: &VoicePreference) -> CallResult<Vec<u8>> {
        let delay = {
            let mut state = lock(&self.state);
            state.speech_requests.push(text.to_string());
            state.delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        lock(&self.state)
            .speech_replies
            .pop_front()
            .unwrap_or_else(|| Ok(vec![0u8; 16]))
    }
}

impl ResponseProbe {
    pub fn push_text(&self, reply: CallResult<String>) {
        lock(&self.state).text_replies.push_back(reply);
    }

    pub fn push_speech(&self, reply: CallResult<Vec<u8>>) {
        lock(&self.state).speech_replies.push_back(reply);
    }

    pub fn fail_next_speech(&self, reason: &str) {
        self.push_speech(Err(CallError::Synthesis(reason.to_string())));
    }

    /// Delay every reply by `delay` (tokio clock).
    pub fn set_delay(&self, delay: Duration) {
        lock(&self.state).delay = delay;
    }

    /// Sessions begun so far
    pub fn session_count(&self) -> usize {
        lock(&self.state).sessions
    }

    pub fn text_requests(&self) -> Vec<String> {
        lock(&self.state).text_requests.clone()
    }

    pub fn speech_requests(&self) -> Vec<String> {
        lock(&self.state).speech_requests.clone()
    }
}

// -----------------------------------------------------------------------------
// Playback
// -----------------------------------------------------------------------------

#[derive(Default)]
struct PlaybackState {
    live: Vec<PlaybackReporter>,
    started: usize,
    cancelled: usize,
    speaker_on: bool,
}

impl PlaybackState {
    /// Move cancelled reporters out of the live set.
    fn sweep(&mut self) {
        let before = self.live.len();
        self.live.retain(|r| !r.is_cancelled());
        self.cancelled += before - self.live.len();
    }
}

/// Player that finishes only when the probe says so.
pub struct ScriptedPlayback {
    state: Arc<Mutex<PlaybackState>>,
    next_id: u64,
}

/// Drives and inspects a [`ScriptedPlayback`]
#[derive(Clone)]
pub struct PlaybackProbe {
    state: Arc<Mutex<PlaybackState>>,
}

impl ScriptedPlayback {
    pub fn new() -> (Self, PlaybackProbe) {
        let state = Arc::new(Mutex::new(PlaybackState::default()));
        (
            Self {
                state: Arc::clone(&state),
                next_id: 0,
            },
            PlaybackProbe { state },
        )
    }
}

impl PlaybackController for ScriptedPlayback {
    fn play(&mut self, _audio: Vec<u8>) -> PlaybackHandle {
        self.next_id += 1;
        let (handle, reporter) = PlaybackHandle::channel(self.next_id);
        let mut state = lock(&self.state);
        state.live.push(reporter);
        state.started += 1;
        handle
    }

    fn set_speaker(&mut self, on: bool) {
        lock(&self.state).speaker_on = on;
    }
}

impl PlaybackProbe {
    pub fn started_count(&self) -> usize {
        lock(&self.state).started
    }

    /// Playbacks neither finished nor cancelled
    pub fn active_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.sweep();
        state.live.len()
    }

    pub fn cancelled_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.sweep();
        state.cancelled
    }

    pub fn speaker_on(&self) -> bool {
        lock(&self.state).speaker_on
    }

    fn finish_latest(&self, outcome: PlaybackOutcome) -> bool {
        let mut state = lock(&self.state);
        state.sweep();
        match state.live.pop() {
            Some(reporter) => {
                reporter.report(outcome);
                true
            }
            None => false,
        }
    }

    /// Finish the live playback successfully. `false` if none is live.
    pub fn complete_current(&self) -> bool {
        self.finish_latest(PlaybackOutcome::Completed)
    }

    pub fn fail_current(&self, reason: &str) -> bool {
        self.finish_latest(PlaybackOutcome::Failed(reason.to_string()))
    }
}

// -----------------------------------------------------------------------------
// Permission
// -----------------------------------------------------------------------------

/// Fixed permission answer
#[derive(Debug, Clone, Copy)]
pub struct ScriptedPermission(pub bool);

impl MicrophonePermission for ScriptedPermission {
    fn request(&self) -> bool {
        self.0
    }
}
