//! Call session state: the aggregate the UI observes.
//!
//! The controller owns a single [`CallSession`] and republishes a snapshot on
//! every change through a `watch` channel, plus a `broadcast` of [`StateChange`]s
//! so observers can reconstruct the exact sequence of turn states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{broadcast, watch};

/// Capacity of the state-change broadcast. Slow subscribers lag past this.
const STATE_CHANGE_CAPACITY: usize = 256;

/// Turn-taking state of a call
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Idle,
    /// The turn is open for the user (capture may be suppressed by mute)
    Listening,
    /// Waiting on the AI service for a reply and its audio
    Processing,
    /// Playing the AI's reply; user speech interrupts
    Speaking,
    /// Tearing down; always settles in `Idle`
    Ending,
    /// Capture failed; requires `end_session()` or a restart
    Error(String),
}

impl TurnState {
    pub fn label(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::Listening => "listening",
            TurnState::Processing => "processing",
            TurnState::Speaking => "speaking",
            TurnState::Ending => "ending",
            TurnState::Error(_) => "error",
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnState::Error(reason) => write!(f, "error({reason})"),
            other => f.write_str(other.label()),
        }
    }
}

/// Observable state of the current call
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CallSession {
    pub state: TurnState,
    /// Utterance in progress
    pub transcript: String,
    pub last_response_text: String,
    /// Smoothed microphone level in [0, 1]; zero outside `Listening`
    pub audio_level: f32,
    pub duration_seconds: u64,
    pub muted: bool,
    pub speaker_on: bool,
    pub started_at: Option<DateTime<Utc>>,
}

/// One turn-state transition
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub from: TurnState,
    pub to: TurnState,
    pub at: DateTime<Utc>,
}

/// Transcript accumulated for the current turn.
///
/// `revision` increases on every change so the endpointer can tell whether the
/// text moved since a timer was armed without comparing strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Utterance {
    text: String,
    revision: u64,
}

impl Utterance {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Replace the text; returns the new revision, or `None` if nothing changed.
    pub fn update(&mut self, text: &str) -> Option<u64> {
        if self.text == text {
            return None;
        }
        self.text.clear();
        self.text.push_str(text);
        self.revision += 1;
        Some(self.revision)
    }

    /// Start a fresh utterance. The revision keeps counting so stale timers never match.
    pub fn reset(&mut self) {
        if !self.text.is_empty() {
            self.text.clear();
            self.revision += 1;
        }
    }
}

/// Publishes session snapshots and state transitions to observers
#[derive(Debug)]
pub(crate) struct SessionPublisher {
    snapshot_tx: watch::Sender<CallSession>,
    changes_tx: broadcast::Sender<StateChange>,
}

impl SessionPublisher {
    pub(crate) fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(CallSession::default());
        let (changes_tx, _) = broadcast::channel(STATE_CHANGE_CAPACITY);
        Self {
            snapshot_tx,
            changes_tx,
        }
    }

    pub(crate) fn publish(&self, session: &CallSession) {
        self.snapshot_tx.send_if_modified(|current| {
            if current == session {
                false
            } else {
                *current = session.clone();
                true
            }
        });
    }

    pub(crate) fn transition(&self, from: &TurnState, to: &TurnState) {
        // No subscribers is not an error
        let _ = self.changes_tx.send(StateChange {
            from: from.clone(),
            to: to.clone(),
            at: Utc::now(),
        });
    }

    pub(crate) fn watch(&self) -> watch::Receiver<CallSession> {
        self.snapshot_tx.subscribe()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes_tx.subscribe()
    }

    /// Sender side, for handles that subscribe later
    pub(crate) fn changes(&self) -> broadcast::Sender<StateChange> {
        self.changes_tx.clone()
    }
}
