//! Turn Controller - the live-call state machine
//!
//! One actor owns the [`CallSession`] and every exclusive resource (microphone,
//! recognizer, endpointer, pending AI request, playback, clock). Everything
//! asynchronous (capture taps, recognition forwarders, AI requests, playback
//! watchers, timers) reports back by posting a [`CallEvent`] into the actor's
//! inbox, so all state mutation happens on one serialized context.
//!
//! Resource-bound events carry the id of the resource that produced them. When
//! that resource has since been replaced or cancelled the event is dropped,
//! which is what keeps a stale recognizer from touching the next turn.

use crate::audio::{AudioCaptureSource, AudioFrame, FrameStream, MicrophonePermission};
use crate::cancel::CancelToken;
use crate::clock::SessionClock;
use crate::config::CallConfig;
use crate::endpointer::Endpointer;
use crate::error::{CallError, CallResult, CaptureError};
use crate::playback::{PlaybackController, PlaybackHandle, PlaybackOutcome};
use crate::recognizer::{RecognitionEvent, StreamingRecognizer};
use crate::response::ResponseClient;
use crate::session::{CallSession, SessionPublisher, StateChange, TurnState, Utterance};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// Commands accepted from the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCommand {
    StartSession,
    EndSession,
    ToggleMute,
    ToggleSpeaker,
    /// End any live session and stop the actor loop
    Shutdown,
}

/// Everything the controller reacts to
#[derive(Debug)]
pub enum CallEvent {
    Command {
        command: CallCommand,
        ack: Option<oneshot::Sender<()>>,
    },
    /// Smoothed microphone level from capture `capture`
    CaptureLevel { capture: u64, level: f32 },
    Recognition { capture: u64, event: RecognitionEvent },
    EndpointFired { revision: u64 },
    TextResponse { request: u64, result: CallResult<String> },
    SpeechAudio {
        request: u64,
        text: String,
        result: CallResult<Vec<u8>>,
    },
    Playback { playback: u64, outcome: PlaybackOutcome },
    ClockTick { clock: u64 },
}

/// The controller's collaborators, injected so tests can script them
pub struct Collaborators {
    pub capture: Box<dyn AudioCaptureSource>,
    pub recognizer: Arc<dyn StreamingRecognizer>,
    pub client: Arc<dyn ResponseClient>,
    pub playback: Box<dyn PlaybackController>,
    pub permission: Arc<dyn MicrophonePermission>,
}

/// Capture + recognition pair currently owning the microphone
struct ActiveCapture {
    id: u64,
    recognition: CancelToken,
    tap: JoinHandle<()>,
    forwarder: JoinHandle<()>,
}

impl ActiveCapture {
    fn cancel(self) {
        self.recognition.cancel();
        self.tap.abort();
        self.forwarder.abort();
    }
}

/// In-flight text or speech request
struct PendingRequest {
    id: u64,
    task: JoinHandle<()>,
}

struct ActivePlayback {
    id: u64,
    handle: PlaybackHandle,
    watcher: Option<JoinHandle<()>>,
}

/// Owner and arbiter of one call at a time.
pub struct TurnController {
    config: CallConfig,
    capture: Box<dyn AudioCaptureSource>,
    recognizer: Arc<dyn StreamingRecognizer>,
    client: Arc<dyn ResponseClient>,
    playback: Box<dyn PlaybackController>,
    permission: Arc<dyn MicrophonePermission>,

    session: CallSession,
    utterance: Utterance,
    endpointer: Endpointer,
    /// A session is live from `start_session()` until teardown completes
    live: bool,

    listening: Option<ActiveCapture>,
    request: Option<PendingRequest>,
    speech: Option<ActivePlayback>,
    clock: Option<(u64, SessionClock)>,

    next_id: u64,
    events: mpsc::UnboundedSender<CallEvent>,
    publisher: SessionPublisher,
}

impl TurnController {
    /// Build a controller and the inbox its resources post into.
    pub fn new(config: CallConfig, collaborators: Collaborators) -> (Self, mpsc::UnboundedReceiver<CallEvent>) {
        let (events, inbox) = mpsc::unbounded_channel();
        let Collaborators {
            capture,
            recognizer,
            client,
            playback,
            permission,
        } = collaborators;

        let controller = Self {
            endpointer: Endpointer::new(config.endpoint.silence()),
            config,
            capture,
            recognizer,
            client,
            playback,
            permission,
            session: CallSession::default(),
            utterance: Utterance::default(),
            live: false,
            listening: None,
            request: None,
            speech: None,
            clock: None,
            next_id: 0,
            events,
            publisher: SessionPublisher::new(),
        };
        (controller, inbox)
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    pub fn state(&self) -> &TurnState {
        &self.session.state
    }

    pub fn is_live(&self) -> bool {
        self.live
    }

    /// The microphone is open and feeding a recognizer
    pub fn is_capturing(&self) -> bool {
        self.listening.is_some() && self.capture.is_capturing()
    }

    /// Latest session snapshot, updated on every change.
    pub fn watch(&self) -> watch::Receiver<CallSession> {
        self.publisher.watch()
    }

    /// Every turn-state transition, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.publisher.subscribe()
    }

    /// Move the controller onto its own task and return the UI handle.
    pub fn spawn(self, inbox: mpsc::UnboundedReceiver<CallEvent>) -> CallHandle {
        let handle = CallHandle {
            events: self.events.clone(),
            snapshot: self.publisher.watch(),
            changes: self.publisher.changes(),
        };
        tokio::spawn(self.run(inbox));
        handle
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<CallEvent>) {
        info!("📞 Call controller running");
        while let Some(event) = inbox.recv().await {
            let shutdown = matches!(
                event,
                CallEvent::Command {
                    command: CallCommand::Shutdown,
                    ..
                }
            );
            self.handle(event);
            if shutdown {
                break;
            }
        }
        info!("📴 Call controller stopped");
    }

    /// Apply one event. Synchronous: resources are started and cancelled
    /// inline, their results arrive later as new events.
    pub fn handle(&mut self, event: CallEvent) {
        match event {
            CallEvent::Command { command, ack } => {
                match command {
                    CallCommand::StartSession => self.start_session(),
                    CallCommand::EndSession | CallCommand::Shutdown => self.end_session(),
                    CallCommand::ToggleMute => self.toggle_mute(),
                    CallCommand::ToggleSpeaker => self.toggle_speaker(),
                }
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
            }
            CallEvent::CaptureLevel { capture, level } => self.on_level(capture, level),
            CallEvent::Recognition { capture, event } => self.on_recognition(capture, event),
            CallEvent::EndpointFired { revision } => self.on_endpoint(revision),
            CallEvent::TextResponse { request, result } => self.on_text_response(request, result),
            CallEvent::SpeechAudio { request, text, result } => self.on_speech_audio(request, text, result),
            CallEvent::Playback { playback, outcome } => self.on_playback(playback, outcome),
            CallEvent::ClockTick { clock } => self.on_tick(clock),
        }
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    fn start_session(&mut self) {
        if self.live {
            if !matches!(self.session.state, TurnState::Error(_)) {
                warn!(state = %self.session.state, "session already live, start ignored");
                return;
            }
            // Restart from Error: tear the failed session down first
            self.end_session();
        }

        info!("📞 Starting call session");
        self.session = CallSession {
            muted: false,
            speaker_on: self.session.speaker_on,
            started_at: Some(Utc::now()),
            ..CallSession::default()
        };
        self.utterance.reset();
        self.live = true;
        self.client.begin_session();
        self.start_clock();

        if !self.permission.request() {
            error!("🎤 Microphone permission denied");
            self.fail(CaptureError::PermissionDenied);
            return;
        }

        let greeting = self.config.greeting.trim().to_string();
        if greeting.is_empty() {
            self.enter_listening();
        } else {
            self.publisher.publish(&self.session);
            self.request_speech(greeting);
        }
    }

    fn end_session(&mut self) {
        if !self.live || self.session.state == TurnState::Ending {
            debug!("no live session, end ignored");
            return;
        }
        self.set_state(TurnState::Ending);
        self.teardown();
        if let Some((_, clock)) = self.clock.take() {
            clock.stop();
        }
        self.live = false;
        self.session.transcript.clear();
        self.set_state(TurnState::Idle);
        info!(duration_seconds = self.session.duration_seconds, "📴 Call ended");
    }

    fn toggle_mute(&mut self) {
        self.session.muted = !self.session.muted;
        info!(muted = self.session.muted, "🎤 Mute toggled");

        if self.session.muted {
            self.stop_capture();
            if self.session.state == TurnState::Listening {
                self.endpointer.cancel();
                self.utterance.reset();
                self.session.transcript.clear();
            }
        } else {
            match self.session.state {
                TurnState::Listening => self.enter_listening(),
                TurnState::Speaking => {
                    self.start_capture();
                }
                _ => {}
            }
        }
        self.publisher.publish(&self.session);
    }

    fn toggle_speaker(&mut self) {
        self.session.speaker_on = !self.session.speaker_on;
        self.playback.set_speaker(self.session.speaker_on);
        info!(speaker_on = self.session.speaker_on, "🔈 Speaker toggled");
        self.publisher.publish(&self.session);
    }

    // -------------------------------------------------------------------------
    // Resource events
    // -------------------------------------------------------------------------

    fn on_level(&mut self, capture: u64, level: f32) {
        if !self.is_current_capture(capture) || self.session.state != TurnState::Listening || self.session.muted {
            return;
        }
        self.session.audio_level = level.clamp(0.0, 1.0);
        self.publisher.publish(&self.session);
    }

    fn on_recognition(&mut self, capture: u64, event: RecognitionEvent) {
        if !self.is_current_capture(capture) {
            debug!(capture, "dropping event from stale recognizer");
            return;
        }

        match event {
            RecognitionEvent::Transcript { text, is_final } => match self.session.state {
                TurnState::Listening => {
                    if let Some(revision) = self.utterance.update(&text) {
                        debug!(revision, is_final, transcript = %text, "transcript changed");
                        self.session.transcript = text;
                        self.arm_endpointer(revision);
                        self.publisher.publish(&self.session);
                    }
                }
                TurnState::Speaking if !text.trim().is_empty() => self.barge_in(text),
                _ => {}
            },
            RecognitionEvent::Completed => {
                debug!("recognition completed");
                self.on_recognition_ended();
            }
            RecognitionEvent::Failed(reason) => {
                warn!(%reason, "recognition failed, keeping transcript");
                self.on_recognition_ended();
            }
        }
    }

    fn on_recognition_ended(&mut self) {
        match self.session.state {
            TurnState::Listening if self.utterance.is_empty() => self.restart_capture(),
            // A non-empty utterance is left to the endpointer
            TurnState::Listening => {}
            TurnState::Speaking => self.restart_capture(),
            _ => {}
        }
    }

    fn on_endpoint(&mut self, revision: u64) {
        if self.session.state != TurnState::Listening {
            return;
        }
        if self.endpointer.accept_fire(revision, self.utterance.is_empty()) {
            info!(transcript = %self.utterance.text(), "✅ Silence reached, committing turn");
            self.enter_processing();
        }
    }

    fn on_text_response(&mut self, request: u64, result: CallResult<String>) {
        if !self.take_request(request) || self.session.state != TurnState::Processing {
            debug!(request, "dropping stale text response");
            return;
        }
        match result {
            Ok(text) if !text.trim().is_empty() => {
                info!(chars = text.len(), "💬 Reply received");
                let text = text.trim().to_string();
                self.session.last_response_text.clone_from(&text);
                self.publisher.publish(&self.session);
                self.request_speech(text);
            }
            Ok(_) => {
                warn!("empty reply, back to listening");
                self.enter_listening();
            }
            Err(e) => {
                warn!(error = %e, "reply request failed, back to listening");
                self.enter_listening();
            }
        }
    }

    fn on_speech_audio(&mut self, request: u64, text: String, result: CallResult<Vec<u8>>) {
        if !self.take_request(request) || !self.live {
            debug!(request, "dropping stale speech audio");
            return;
        }
        match result {
            Ok(audio) => self.enter_speaking(audio),
            Err(e) => {
                warn!(error = %e, chars = text.len(), "synthesis failed, back to listening");
                self.enter_listening();
            }
        }
    }

    fn on_playback(&mut self, playback: u64, outcome: PlaybackOutcome) {
        if self.speech.as_ref().map(|s| s.id) != Some(playback) {
            debug!(playback, "dropping stale playback outcome");
            return;
        }
        self.speech = None;
        match outcome {
            PlaybackOutcome::Completed => debug!("playback completed"),
            PlaybackOutcome::Failed(reason) => warn!(%reason, "playback failed, back to listening"),
        }
        self.enter_listening();
    }

    fn on_tick(&mut self, clock: u64) {
        if self.clock.as_ref().map(|(id, _)| *id) != Some(clock) {
            return;
        }
        self.session.duration_seconds += 1;
        self.publisher.publish(&self.session);
    }

    // -------------------------------------------------------------------------
    // Transitions
    // -------------------------------------------------------------------------

    fn enter_listening(&mut self) {
        self.stop_capture();
        self.endpointer.cancel();
        self.utterance.reset();
        self.session.transcript.clear();
        self.set_state(TurnState::Listening);
        self.start_capture();
        self.publisher.publish(&self.session);
    }

    fn enter_processing(&mut self) {
        let transcript = self.utterance.text().to_string();
        self.session.transcript.clone_from(&transcript);
        self.stop_capture();
        self.endpointer.cancel();
        self.set_state(TurnState::Processing);

        let id = self.next_id();
        let client = Arc::clone(&self.client);
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let result = client.request_text_response(&transcript).await;
            let _ = events.send(CallEvent::TextResponse { request: id, result });
        });
        self.replace_request(PendingRequest { id, task });
    }

    fn enter_speaking(&mut self, audio: Vec<u8>) {
        self.stop_capture();
        self.endpointer.cancel();
        self.cancel_playback();

        let mut handle = self.playback.play(audio);
        let id = self.next_id();
        let watcher = handle.take_completion().map(|completion| {
            let events = self.events.clone();
            tokio::spawn(async move {
                if let Some(outcome) = completion.wait().await {
                    let _ = events.send(CallEvent::Playback { playback: id, outcome });
                }
            })
        });
        self.speech = Some(ActivePlayback { id, handle, watcher });

        self.utterance.reset();
        self.session.transcript.clear();
        self.set_state(TurnState::Speaking);
        // Listen for the user talking over us
        self.start_capture();
        self.publisher.publish(&self.session);
    }

    /// The user spoke over playback: silence it and hand them the turn,
    /// keeping the recognizer that heard them.
    fn barge_in(&mut self, partial: String) {
        info!(partial = %partial, "⚡ Barge-in: user speaking, silencing playback");
        self.cancel_playback();
        self.endpointer.cancel();
        self.utterance.reset();
        self.set_state(TurnState::Listening);
        if let Some(revision) = self.utterance.update(&partial) {
            self.session.transcript = partial;
            self.arm_endpointer(revision);
        }
        self.publisher.publish(&self.session);
    }

    /// Capture failed: the turn cannot continue until the session is ended or restarted.
    fn fail(&mut self, err: CaptureError) {
        error!(error = %err, "❌ Capture failed");
        self.teardown();
        self.set_state(TurnState::Error(err.to_string()));
    }

    fn set_state(&mut self, to: TurnState) {
        if self.session.state == to {
            return;
        }
        let from = std::mem::replace(&mut self.session.state, to);
        if self.session.state != TurnState::Listening {
            self.session.audio_level = 0.0;
        }
        info!(from = %from, to = %self.session.state, "🔄 Turn state");
        self.publisher.transition(&from, &self.session.state);
        self.publisher.publish(&self.session);
    }

    // -------------------------------------------------------------------------
    // Resources
    // -------------------------------------------------------------------------

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn is_current_capture(&self, capture: u64) -> bool {
        self.listening.as_ref().map(|c| c.id) == Some(capture)
    }

    /// Start a capture+recognition pair. Never while muted.
    fn start_capture(&mut self) {
        if self.session.muted || !self.live {
            return;
        }
        self.stop_capture();

        let frames = match self.capture.start() {
            Ok(frames) => frames,
            Err(e) => {
                self.fail(e);
                return;
            }
        };

        let id = self.next_id();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let tap = spawn_tap(
            id,
            frames,
            frame_tx,
            self.events.clone(),
            Duration::from_millis(self.config.capture.level_interval_ms),
        );

        let mut recognition = self.recognizer.begin(UnboundedReceiverStream::new(frame_rx).boxed());
        let cancel = recognition.canceller();
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = recognition.next_event().await {
                let terminal = !matches!(event, RecognitionEvent::Transcript { .. });
                if events.send(CallEvent::Recognition { capture: id, event }).is_err() || terminal {
                    break;
                }
            }
        });

        debug!(capture = id, state = %self.session.state, "🎤 Capture started");
        self.listening = Some(ActiveCapture {
            id,
            recognition: cancel,
            tap,
            forwarder,
        });
    }

    fn stop_capture(&mut self) {
        self.capture.stop();
        if let Some(active) = self.listening.take() {
            debug!(capture = active.id, "🎤 Capture stopped");
            active.cancel();
        }
        self.session.audio_level = 0.0;
    }

    fn restart_capture(&mut self) {
        self.stop_capture();
        self.start_capture();
        self.publisher.publish(&self.session);
    }

    fn arm_endpointer(&mut self, revision: u64) {
        let events = self.events.clone();
        self.endpointer.on_transcript_changed(revision, move |revision| {
            let _ = events.send(CallEvent::EndpointFired { revision });
        });
    }

    fn request_speech(&mut self, text: String) {
        let id = self.next_id();
        self.session.last_response_text.clone_from(&text);
        let client = Arc::clone(&self.client);
        let voice = self.config.voice.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            let result = client.request_speech_audio(&text, &voice).await;
            let _ = events.send(CallEvent::SpeechAudio { request: id, text, result });
        });
        self.replace_request(PendingRequest { id, task });
    }

    fn replace_request(&mut self, request: PendingRequest) {
        if let Some(previous) = self.request.replace(request) {
            previous.task.abort();
        }
    }

    /// Clear the pending request if `id` is the one we are waiting for.
    fn take_request(&mut self, id: u64) -> bool {
        if self.request.as_ref().map(|r| r.id) == Some(id) {
            self.request = None;
            true
        } else {
            false
        }
    }

    fn cancel_playback(&mut self) {
        if let Some(active) = self.speech.take() {
            debug!(playback = active.id, "⏹️ Cancelling playback");
            self.playback.cancel(&active.handle);
            if let Some(watcher) = active.watcher {
                watcher.abort();
            }
        }
    }

    fn start_clock(&mut self) {
        let id = self.next_id();
        let events = self.events.clone();
        let clock = SessionClock::start(move || {
            let _ = events.send(CallEvent::ClockTick { clock: id });
        });
        if let Some((_, previous)) = self.clock.replace((id, clock)) {
            previous.stop();
        }
    }

    /// Release everything a turn may hold. The clock keeps running.
    fn teardown(&mut self) {
        self.stop_capture();
        self.endpointer.cancel();
        if let Some(request) = self.request.take() {
            request.task.abort();
        }
        self.cancel_playback();
    }
}

impl Drop for TurnController {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Read the capture stream: meter it for the UI and feed the recognizer.
fn spawn_tap(
    capture: u64,
    mut frames: FrameStream,
    to_recognizer: mpsc::UnboundedSender<AudioFrame>,
    events: mpsc::UnboundedSender<CallEvent>,
    level_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_level: Option<Instant> = None;
        while let Some(frame) = frames.next().await {
            let now = Instant::now();
            if last_level.map_or(true, |t| now.duration_since(t) >= level_interval) {
                last_level = Some(now);
                if events
                    .send(CallEvent::CaptureLevel {
                        capture,
                        level: frame.level,
                    })
                    .is_err()
                {
                    break;
                }
            }
            // The recognizer may already be done; keep metering regardless
            let _ = to_recognizer.send(frame);
        }
    })
}

/// Cloneable UI-side handle to a running [`TurnController`].
#[derive(Clone)]
pub struct CallHandle {
    events: mpsc::UnboundedSender<CallEvent>,
    snapshot: watch::Receiver<CallSession>,
    changes: broadcast::Sender<StateChange>,
}

impl CallHandle {
    async fn send(&self, command: CallCommand) -> CallResult<()> {
        let (ack, done) = oneshot::channel();
        self.events
            .send(CallEvent::Command {
                command,
                ack: Some(ack),
            })
            .map_err(|_| CallError::ChannelClosed)?;
        done.await.map_err(|_| CallError::ChannelClosed)
    }

    pub async fn start_session(&self) -> CallResult<()> {
        self.send(CallCommand::StartSession).await
    }

    pub async fn end_session(&self) -> CallResult<()> {
        self.send(CallCommand::EndSession).await
    }

    pub async fn toggle_mute(&self) -> CallResult<()> {
        self.send(CallCommand::ToggleMute).await
    }

    pub async fn toggle_speaker(&self) -> CallResult<()> {
        self.send(CallCommand::ToggleSpeaker).await
    }

    /// End any live session and stop the controller task.
    pub async fn shutdown(&self) -> CallResult<()> {
        self.send(CallCommand::Shutdown).await
    }

    pub fn snapshot(&self) -> CallSession {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<CallSession> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallError;
    use crate::scripted::*;

    struct Rig {
        ctl: TurnController,
        inbox: mpsc::UnboundedReceiver<CallEvent>,
        changes: broadcast::Receiver<StateChange>,
        capture: CaptureProbe,
        recognizer: RecognizerProbe,
        client: ResponseProbe,
        playback: PlaybackProbe,
    }

    fn rig_with(config: CallConfig, permitted: bool) -> Rig {
        let (capture, capture_probe) = ScriptedCapture::new(config.capture.level_gain);
        let (recognizer, recognizer_probe) = ScriptedRecognizer::new();
        let (client, client_probe) = ScriptedResponseClient::new();
        let (playback, playback_probe) = ScriptedPlayback::new();
        let (ctl, inbox) = TurnController::new(
            config,
            Collaborators {
                capture: Box::new(capture),
                recognizer: Arc::new(recognizer),
                client: Arc::new(client),
                playback: Box::new(playback),
                permission: Arc::new(ScriptedPermission(permitted)),
            },
        );
        let changes = ctl.subscribe();
        Rig {
            ctl,
            inbox,
            changes,
            capture: capture_probe,
            recognizer: recognizer_probe,
            client: client_probe,
            playback: playback_probe,
        }
    }

    fn rig() -> Rig {
        rig_with(CallConfig::default(), true)
    }

    fn silent_rig() -> Rig {
        let config = CallConfig {
            greeting: String::new(),
            ..CallConfig::default()
        };
        rig_with(config, true)
    }

    fn command(command: CallCommand) -> CallEvent {
        CallEvent::Command { command, ack: None }
    }

    impl Rig {
        /// Let spawned tasks run and apply everything they posted.
        async fn pump(&mut self) {
            loop {
                for _ in 0..16 {
                    tokio::task::yield_now().await;
                }
                let mut handled = false;
                while let Ok(event) = self.inbox.try_recv() {
                    self.ctl.handle(event);
                    handled = true;
                }
                if !handled {
                    break;
                }
            }
        }

        async fn advance(&mut self, by: Duration) {
            tokio::time::advance(by).await;
            self.pump().await;
        }

        async fn send(&mut self, cmd: CallCommand) {
            self.ctl.handle(command(cmd));
            self.pump().await;
        }

        fn states(&mut self) -> Vec<TurnState> {
            let mut out = Vec::new();
            while let Ok(change) = self.changes.try_recv() {
                out.push(change.to);
            }
            out
        }

        fn state(&self) -> TurnState {
            self.ctl.state().clone()
        }

        async fn say(&mut self, text: &str) {
            assert!(self.recognizer.emit(text, false), "no live recognizer");
            self.pump().await;
        }

        fn assert_resource_bounds(&self) {
            assert!(self.recognizer.active_count() <= 1, "more than one recognition stream");
            assert!(self.playback.active_count() <= 1, "more than one playback");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn greeting_plays_then_listens() {
        let mut rig = rig();
        rig.send(CallCommand::StartSession).await;

        assert_eq!(rig.state(), TurnState::Speaking);
        assert_eq!(rig.client.speech_requests().len(), 1);
        assert_eq!(rig.playback.active_count(), 1);

        assert!(rig.playback.complete_current());
        rig.pump().await;

        assert_eq!(rig.state(), TurnState::Listening);
        assert_eq!(rig.states(), vec![TurnState::Speaking, TurnState::Listening]);
        assert!(rig.capture.is_active());
        rig.assert_resource_bounds();
    }

    #[tokio::test(start_paused = true)]
    async fn greeting_synthesis_failure_goes_straight_to_listening() {
        let mut rig = rig();
        rig.client.fail_next_speech("tts down");
        rig.send(CallCommand::StartSession).await;

        assert_eq!(rig.states(), vec![TurnState::Listening]);
        assert_eq!(rig.playback.started_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_turn_after_silence() {
        let mut rig = silent_rig();
        rig.send(CallCommand::StartSession).await;
        assert_eq!(rig.state(), TurnState::Listening);

        rig.say("I feel").await;
        rig.advance(Duration::from_millis(1000)).await;
        rig.say("I feel anxious").await;
        rig.advance(Duration::from_millis(1000)).await;
        assert_eq!(rig.state(), TurnState::Listening, "window restarted on change");

        rig.advance(Duration::from_millis(600)).await;
        assert_eq!(rig.client.text_requests(), vec!["I feel anxious".to_string()]);
        assert_eq!(rig.state(), TurnState::Speaking);
        assert_eq!(rig.ctl.session().last_response_text, "I hear you.");

        assert!(rig.playback.complete_current());
        rig.pump().await;
        assert_eq!(
            rig.states(),
            vec![
                TurnState::Listening,
                TurnState::Processing,
                TurnState::Speaking,
                TurnState::Listening
            ]
        );
        assert!(rig.ctl.session().transcript.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn endpoint_fires_exactly_once() {
        let mut rig = silent_rig();
        rig.client.set_delay(Duration::from_secs(10));
        rig.send(CallCommand::StartSession).await;

        rig.say("hello").await;
        rig.advance(Duration::from_millis(1500)).await;
        assert_eq!(rig.state(), TurnState::Processing);

        rig.advance(Duration::from_secs(5)).await;
        assert_eq!(rig.client.text_requests().len(), 1);
        assert!(!rig.capture.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_transcript_never_commits() {
        let mut rig = silent_rig();
        rig.send(CallCommand::StartSession).await;

        rig.say("   ").await;
        rig.advance(Duration::from_secs(10)).await;
        assert_eq!(rig.state(), TurnState::Listening);
        assert!(rig.client.text_requests().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn barge_in_cancels_playback_and_seeds_transcript() {
        let mut rig = silent_rig();
        rig.send(CallCommand::StartSession).await;
        rig.say("tell me something").await;
        rig.advance(Duration::from_millis(1500)).await;
        assert_eq!(rig.state(), TurnState::Speaking);
        rig.assert_resource_bounds();

        let begun = rig.recognizer.begin_count();
        rig.say("wait").await;

        assert_eq!(rig.state(), TurnState::Listening);
        assert_eq!(rig.ctl.session().transcript, "wait");
        assert_eq!(rig.playback.active_count(), 0);
        assert_eq!(rig.playback.cancelled_count(), 1);
        // The recognizer that heard the interruption keeps running
        assert_eq!(rig.recognizer.begin_count(), begun);
        assert_eq!(rig.recognizer.active_count(), 1);

        // And its utterance commits after silence like any other
        rig.advance(Duration::from_millis(1500)).await;
        assert_eq!(rig.client.text_requests().last().map(String::as_str), Some("wait"));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_partial_while_speaking_is_not_barge_in() {
        let mut rig = silent_rig();
        rig.send(CallCommand::StartSession).await;
        rig.say("hi").await;
        rig.advance(Duration::from_millis(1500)).await;
        assert_eq!(rig.state(), TurnState::Speaking);

        rig.say(" ").await;
        assert_eq!(rig.state(), TurnState::Speaking);
        assert_eq!(rig.playback.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn synthesis_failure_keeps_reply_text() {
        let mut rig = silent_rig();
        rig.client.push_text(Ok("Take a slow breath.".to_string()));
        rig.client.fail_next_speech("tts down");
        rig.send(CallCommand::StartSession).await;

        rig.say("I can't sleep").await;
        rig.advance(Duration::from_millis(1500)).await;

        assert_eq!(rig.state(), TurnState::Listening);
        assert_eq!(rig.ctl.session().last_response_text, "Take a slow breath.");
        assert_eq!(rig.playback.started_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn response_error_returns_to_listening() {
        let mut rig = silent_rig();
        rig.client.push_text(Err(CallError::Response("503".to_string())));
        rig.send(CallCommand::StartSession).await;

        rig.say("hello?").await;
        rig.advance(Duration::from_millis(1500)).await;

        assert_eq!(rig.state(), TurnState::Listening);
        assert!(rig.client.speech_requests().is_empty());
        assert!(rig.capture.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn playback_failure_returns_to_listening() {
        let mut rig = rig();
        rig.send(CallCommand::StartSession).await;
        assert!(rig.playback.fail_current("device lost"));
        rig.pump().await;
        assert_eq!(rig.state(), TurnState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn mute_suppresses_capture_but_keeps_listening() {
        let mut rig = silent_rig();
        rig.send(CallCommand::StartSession).await;
        assert!(rig.capture.push_samples(vec![0.1; 480]));
        rig.pump().await;
        assert!(rig.ctl.session().audio_level > 0.0);
        rig.say("half a thought").await;

        rig.send(CallCommand::ToggleMute).await;
        assert_eq!(rig.state(), TurnState::Listening);
        assert!(!rig.ctl.is_capturing());
        assert!(!rig.capture.is_active());
        assert_eq!(rig.ctl.session().audio_level, 0.0);
        assert_eq!(rig.recognizer.active_count(), 0);

        // The discarded utterance never commits
        rig.advance(Duration::from_secs(3)).await;
        assert!(rig.client.text_requests().is_empty());

        rig.send(CallCommand::ToggleMute).await;
        assert!(rig.ctl.is_capturing());
        assert!(rig.ctl.session().transcript.is_empty());
        assert_eq!(rig.capture.start_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn mute_while_speaking_holds_off_barge_in() {
        let mut rig = silent_rig();
        rig.send(CallCommand::StartSession).await;
        rig.say("tell me a story").await;
        rig.advance(Duration::from_millis(1500)).await;
        assert_eq!(rig.state(), TurnState::Speaking);
        assert!(rig.capture.is_active());
        let starts = rig.capture.start_count();

        rig.send(CallCommand::ToggleMute).await;
        assert_eq!(rig.state(), TurnState::Speaking);
        assert!(!rig.capture.is_active());
        assert_eq!(rig.recognizer.active_count(), 0);
        assert!(!rig.recognizer.emit("wait", false));
        assert_eq!(rig.playback.active_count(), 1);

        rig.send(CallCommand::ToggleMute).await;
        assert_eq!(rig.state(), TurnState::Speaking);
        assert!(rig.capture.is_active());
        assert_eq!(rig.capture.start_count(), starts + 1);

        rig.say("wait").await;
        assert_eq!(rig.state(), TurnState::Listening);
        assert_eq!(rig.playback.cancelled_count(), 1);
        rig.assert_resource_bounds();
    }

    #[tokio::test(start_paused = true)]
    async fn new_session_starts_a_fresh_conversation() {
        let mut rig = silent_rig();
        rig.send(CallCommand::StartSession).await;
        assert_eq!(rig.client.session_count(), 1);
        rig.say("first call").await;
        rig.advance(Duration::from_millis(1500)).await;
        assert_eq!(rig.client.text_requests().len(), 1);

        rig.send(CallCommand::EndSession).await;
        assert_eq!(rig.client.session_count(), 1);

        rig.send(CallCommand::StartSession).await;
        assert_eq!(rig.client.session_count(), 2);
        assert_eq!(rig.state(), TurnState::Listening);
    }

    #[tokio::test(start_paused = true)]
    async fn capture_error_enters_error_until_ended() {
        let mut rig = silent_rig();
        rig.capture.fail_next_start(CaptureError::NoDevice);
        rig.send(CallCommand::StartSession).await;

        assert!(matches!(rig.state(), TurnState::Error(_)));
        assert_eq!(rig.ctl.session().audio_level, 0.0);

        rig.send(CallCommand::EndSession).await;
        assert_eq!(rig.state(), TurnState::Idle);
        assert!(!rig.ctl.is_live());
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_is_an_error() {
        let mut rig = rig_with(CallConfig::default(), false);
        rig.send(CallCommand::StartSession).await;
        assert_eq!(rig.state(), TurnState::Error("microphone permission denied".to_string()));
        assert_eq!(rig.capture.start_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_from_error_tears_down_first() {
        let mut rig = silent_rig();
        rig.capture.fail_next_start(CaptureError::Stream("route conflict".to_string()));
        rig.send(CallCommand::StartSession).await;
        rig.send(CallCommand::StartSession).await;

        assert_eq!(rig.state(), TurnState::Listening);
        let states = rig.states();
        assert!(matches!(states[0], TurnState::Listening));
        assert!(matches!(states[1], TurnState::Error(_)));
        assert_eq!(&states[2..], &[TurnState::Ending, TurnState::Idle, TurnState::Listening]);
    }

    #[tokio::test(start_paused = true)]
    async fn end_is_idempotent_and_releases_everything() {
        let mut rig = silent_rig();
        rig.send(CallCommand::StartSession).await;
        rig.say("something").await;
        rig.advance(Duration::from_millis(1500)).await;
        assert_eq!(rig.state(), TurnState::Speaking);

        rig.send(CallCommand::EndSession).await;
        rig.send(CallCommand::EndSession).await;

        assert_eq!(rig.state(), TurnState::Idle);
        assert!(!rig.capture.is_active());
        assert_eq!(rig.recognizer.active_count(), 0);
        assert_eq!(rig.playback.active_count(), 0);
        let states = rig.states();
        assert_eq!(&states[states.len() - 2..], &[TurnState::Ending, TurnState::Idle]);
        assert_eq!(states.iter().filter(|s| **s == TurnState::Ending).count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn end_during_processing_drops_late_reply() {
        let mut rig = silent_rig();
        rig.client.set_delay(Duration::from_secs(2));
        rig.send(CallCommand::StartSession).await;
        rig.say("are you there").await;
        rig.advance(Duration::from_millis(1500)).await;
        assert_eq!(rig.state(), TurnState::Processing);

        rig.send(CallCommand::EndSession).await;
        rig.advance(Duration::from_secs(5)).await;
        assert_eq!(rig.state(), TurnState::Idle);
        assert_eq!(rig.playback.started_count(), 0);

        // A reply that raced the teardown is ignored too
        rig.ctl.handle(CallEvent::TextResponse {
            request: 1,
            result: Ok("late".to_string()),
        });
        assert_eq!(rig.state(), TurnState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_recognizer_events_are_dropped() {
        let mut rig = silent_rig();
        rig.send(CallCommand::StartSession).await;
        rig.ctl.handle(CallEvent::Recognition {
            capture: 9999,
            event: RecognitionEvent::Transcript {
                text: "ghost".to_string(),
                is_final: true,
            },
        });
        assert!(rig.ctl.session().transcript.is_empty());

        // Recognition ending on an empty utterance restarts the pair
        assert!(rig.recognizer.complete());
        rig.pump().await;
        assert_eq!(rig.recognizer.begin_count(), 2);
        assert!(!rig.recognizer.emit_on(0, "old handle"));
        rig.assert_resource_bounds();
    }

    #[tokio::test(start_paused = true)]
    async fn recognition_failure_keeps_transcript_for_endpointer() {
        let mut rig = silent_rig();
        rig.send(CallCommand::StartSession).await;
        rig.say("my week was").await;
        assert!(rig.recognizer.fail("network"));
        rig.pump().await;

        assert_eq!(rig.state(), TurnState::Listening);
        assert_eq!(rig.ctl.session().transcript, "my week was");
        rig.advance(Duration::from_millis(1500)).await;
        assert_eq!(rig.client.text_requests(), vec!["my week was".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn clock_counts_live_seconds_and_freezes_on_end() {
        let mut rig = silent_rig();
        rig.send(CallCommand::StartSession).await;
        for _ in 0..3 {
            rig.advance(Duration::from_secs(1)).await;
        }
        assert_eq!(rig.ctl.session().duration_seconds, 3);

        rig.send(CallCommand::EndSession).await;
        rig.advance(Duration::from_secs(5)).await;
        assert_eq!(rig.ctl.session().duration_seconds, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn speaker_toggle_reaches_playback() {
        let mut rig = silent_rig();
        rig.send(CallCommand::ToggleSpeaker).await;
        assert!(rig.ctl.session().speaker_on);
        assert!(rig.playback.speaker_on());
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_live_is_ignored() {
        let mut rig = silent_rig();
        rig.send(CallCommand::StartSession).await;
        rig.send(CallCommand::StartSession).await;
        assert_eq!(rig.states(), vec![TurnState::Listening]);
        assert_eq!(rig.capture.start_count(), 1);
    }
}
