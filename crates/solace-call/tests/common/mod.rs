//! Shared test utilities

use solace_call::scripted::{
    CaptureProbe, PlaybackProbe, RecognizerProbe, ResponseProbe, ScriptedCapture, ScriptedPermission,
    ScriptedPlayback, ScriptedRecognizer, ScriptedResponseClient,
};
use solace_call::{CallConfig, CallHandle, Collaborators, StateChange, TurnController, TurnState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// A running controller plus the probes behind its collaborators
pub struct TestCall {
    pub handle: CallHandle,
    pub changes: broadcast::Receiver<StateChange>,
    pub capture: CaptureProbe,
    pub recognizer: RecognizerProbe,
    pub client: ResponseProbe,
    pub playback: PlaybackProbe,
}

/// Config without the start greeting, so sessions open straight into listening
#[must_use]
pub fn quiet_config() -> CallConfig {
    CallConfig {
        greeting: String::new(),
        ..CallConfig::default()
    }
}

/// Spawn a controller over scripted collaborators
pub fn spawn_call(config: CallConfig) -> TestCall {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let (capture, capture_probe) = ScriptedCapture::new(config.capture.level_gain);
    let (recognizer, recognizer_probe) = ScriptedRecognizer::new();
    let (client, client_probe) = ScriptedResponseClient::new();
    let (playback, playback_probe) = ScriptedPlayback::new();

    let (controller, inbox) = TurnController::new(
        config,
        Collaborators {
            capture: Box::new(capture),
            recognizer: Arc::new(recognizer),
            client: Arc::new(client),
            playback: Box::new(playback),
            permission: Arc::new(ScriptedPermission(true)),
        },
    );
    let handle = controller.spawn(inbox);
    let changes = handle.subscribe();

    TestCall {
        handle,
        changes,
        capture: capture_probe,
        recognizer: recognizer_probe,
        client: client_probe,
        playback: playback_probe,
    }
}

impl TestCall {
    /// Wait for the next transition and assert where it went.
    pub async fn expect_state(&mut self, expected: TurnState) {
        let change = tokio::time::timeout(Duration::from_secs(60), self.changes.recv())
            .await
            .expect("timed out waiting for a state change")
            .expect("state change channel closed");
        assert_eq!(change.to, expected, "unexpected transition from {}", change.from);
    }

    /// Wait for the next transition into an error state.
    pub async fn expect_error(&mut self) -> String {
        let change = tokio::time::timeout(Duration::from_secs(60), self.changes.recv())
            .await
            .expect("timed out waiting for a state change")
            .expect("state change channel closed");
        match change.to {
            TurnState::Error(reason) => reason,
            other => panic!("expected error state, got {other}"),
        }
    }

    /// Let the controller task drain its inbox.
    pub async fn settle(&self) {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }
}
