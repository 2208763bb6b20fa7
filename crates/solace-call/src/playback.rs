//! Playback - synthesized speech output and the barge-in kill switch
//!
//! Every `play()` returns a [`PlaybackHandle`] that reports exactly one terminal
//! [`PlaybackOutcome`], unless it is cancelled first, in which case it reports
//! nothing at all.

use crate::cancel::CancelToken;
use crate::error::{CallError, CallResult};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// How often the worker checks sinks for completion and cancellation
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Terminal result of one playback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Failed(String),
}

/// One in-flight playback
#[derive(Debug)]
pub struct PlaybackHandle {
    id: u64,
    cancel: CancelToken,
    completion: Option<PlaybackCompletion>,
}

/// Awaitable terminal outcome of a playback, detached from its handle
#[derive(Debug)]
pub struct PlaybackCompletion {
    rx: oneshot::Receiver<PlaybackOutcome>,
    cancel: CancelToken,
}

/// Producer side: reports the outcome once
#[derive(Debug)]
pub struct PlaybackReporter {
    tx: oneshot::Sender<PlaybackOutcome>,
    cancel: CancelToken,
}

impl PlaybackHandle {
    /// Create a handle and the reporter the player uses to finish it.
    pub fn channel(id: u64) -> (Self, PlaybackReporter) {
        let (tx, rx) = oneshot::channel();
        let cancel = CancelToken::new();
        (
            Self {
                id,
                cancel: cancel.clone(),
                completion: Some(PlaybackCompletion {
                    rx,
                    cancel: cancel.clone(),
                }),
            },
            PlaybackReporter { tx, cancel },
        )
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop playback. No-op on a finished or already-cancelled handle.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Take the completion future. Only the first call returns `Some`.
    pub fn take_completion(&mut self) -> Option<PlaybackCompletion> {
        self.completion.take()
    }
}

impl PlaybackCompletion {
    /// The terminal outcome, or `None` if the playback was cancelled.
    pub async fn wait(self) -> Option<PlaybackOutcome> {
        let PlaybackCompletion { rx, cancel } = self;
        if cancel.is_cancelled() {
            return None;
        }
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            result = rx => result,
        };
        if cancel.is_cancelled() {
            return None;
        }
        match result {
            Ok(outcome) => Some(outcome),
            // The player dropped its reporter without finishing
            Err(_) => Some(PlaybackOutcome::Failed("playback ended without a result".to_string())),
        }
    }
}

impl PlaybackReporter {
    /// Report the terminal outcome. Swallowed if the handle was cancelled.
    pub fn report(self, outcome: PlaybackOutcome) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.tx.send(outcome);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Plays synthesized audio.
pub trait PlaybackController: Send {
    /// Start playing encoded audio (WAV/MP3).
    fn play(&mut self, audio: Vec<u8>) -> PlaybackHandle;

    /// Cancel a playback. Idempotent.
    fn cancel(&mut self, handle: &PlaybackHandle) {
        handle.cancel();
    }

    /// Route output to the loudspeaker (`true`) or the default route.
    fn set_speaker(&mut self, _on: bool) {}
}

enum WorkerCommand {
    Play {
        audio: Vec<u8>,
        reporter: PlaybackReporter,
    },
    Shutdown,
}

/// Rodio output. The `OutputStream` is `!Send`, so a worker thread owns it and
/// every sink; handles talk to it over a channel.
pub struct RodioPlayback {
    commands: std_mpsc::Sender<WorkerCommand>,
    worker: Option<thread::JoinHandle<()>>,
    next_id: u64,
}

impl RodioPlayback {
    /// Open the default output device.
    pub fn new() -> CallResult<Self> {
        let (commands, command_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<(), String>>();

        let worker = thread::Builder::new()
            .name("solace-playback".to_string())
            .spawn(move || {
                let (stream, stream_handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                run_worker(&stream_handle, &command_rx);
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                let _ = worker.join();
                return Err(CallError::Playback(reason));
            }
            Err(_) => {
                let _ = worker.join();
                return Err(CallError::Playback("playback worker exited during setup".to_string()));
            }
        }

        info!("🔊 Audio playback initialized");
        Ok(Self {
            commands,
            worker: Some(worker),
            next_id: 0,
        })
    }
}

impl PlaybackController for RodioPlayback {
    fn play(&mut self, audio: Vec<u8>) -> PlaybackHandle {
        self.next_id += 1;
        let (handle, reporter) = PlaybackHandle::channel(self.next_id);
        if let Err(std_mpsc::SendError(cmd)) = self.commands.send(WorkerCommand::Play { audio, reporter }) {
            if let WorkerCommand::Play { reporter, .. } = cmd {
                reporter.report(PlaybackOutcome::Failed("playback worker stopped".to_string()));
            }
        }
        handle
    }

    fn set_speaker(&mut self, on: bool) {
        // The desktop mixer has a single output route
        debug!(speaker_on = on, "speaker route updated");
    }
}

impl Drop for RodioPlayback {
    fn drop(&mut self) {
        let _ = self.commands.send(WorkerCommand::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn run_worker(stream_handle: &OutputStreamHandle, commands: &std_mpsc::Receiver<WorkerCommand>) {
    let mut active: Vec<(Sink, PlaybackReporter)> = Vec::new();

    loop {
        match commands.recv_timeout(POLL_INTERVAL) {
            Ok(WorkerCommand::Play { audio, reporter }) => match start_sink(stream_handle, audio) {
                Ok(sink) => active.push((sink, reporter)),
                Err(reason) => {
                    warn!(%reason, "playback failed to start");
                    reporter.report(PlaybackOutcome::Failed(reason));
                }
            },
            Ok(WorkerCommand::Shutdown) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
        }

        let mut still_active = Vec::with_capacity(active.len());
        for (sink, reporter) in active.drain(..) {
            if reporter.is_cancelled() {
                sink.stop();
                info!("⏹️ Playback cancelled");
            } else if sink.empty() {
                debug!("playback complete");
                reporter.report(PlaybackOutcome::Completed);
            } else {
                still_active.push((sink, reporter));
            }
        }
        active = still_active;
    }

    for (sink, _) in active {
        sink.stop();
    }
}

fn start_sink(stream_handle: &OutputStreamHandle, audio: Vec<u8>) -> Result<Sink, String> {
    if audio.is_empty() {
        return Err("no audio to play".to_string());
    }
    let source = rodio::Decoder::new(Cursor::new(audio)).map_err(|e| format!("decode failed: {e}"))?;
    let sink = Sink::try_new(stream_handle).map_err(|e| e.to_string())?;
    sink.append(source.convert_samples::<f32>());
    Ok(sink)
}
