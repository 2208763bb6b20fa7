//! Silence endpointing: decide when the user has finished speaking.
//!
//! Every transcript change restarts a single-shot countdown. When it elapses
//! without another change, the turn is committed, unless the transcript is
//! empty, in which case the fire is swallowed and nothing is re-armed until
//! the next real change. Timers run on the tokio clock, so tests can pause
//! and advance time instead of sleeping.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Restart-on-change countdown owned by the turn controller
#[derive(Debug)]
pub struct Endpointer {
    duration: Duration,
    timer: Option<JoinHandle<()>>,
    /// Revision the running window belongs to
    armed: Option<u64>,
}

impl Endpointer {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            timer: None,
            armed: None,
        }
    }

    /// Cancel the running window and start a new one for `revision`.
    ///
    /// `on_fire` runs at most once, after `duration`, unless the window is
    /// restarted or cancelled first. It only signals; the decision is made by
    /// [`Endpointer::accept_fire`] on the controller's own context.
    pub fn on_transcript_changed<F>(&mut self, revision: u64, on_fire: F)
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        self.armed = Some(revision);
        let duration = self.duration;
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            on_fire(revision);
        }));
    }

    /// Resolve a fire signal. Returns `true` when the turn should be committed.
    ///
    /// Fires from a replaced or cancelled window are ignored. A current fire
    /// always disarms the endpointer.
    pub fn accept_fire(&mut self, revision: u64, transcript_is_empty: bool) -> bool {
        if self.armed != Some(revision) {
            debug!(revision, "ignoring stale endpoint fire");
            return false;
        }
        self.armed = None;
        self.timer = None;
        if transcript_is_empty {
            debug!("endpoint fired on empty transcript, suppressed");
            return false;
        }
        true
    }

    /// Drop the running window, if any.
    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.armed = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }
}

impl Drop for Endpointer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn notifier() -> (
        impl Fn() -> Box<dyn FnOnce(u64) + Send> + Clone,
        mpsc::UnboundedReceiver<u64>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let make = move || {
            let tx = tx.clone();
            Box::new(move |rev: u64| {
                let _ = tx.send(rev);
            }) as Box<dyn FnOnce(u64) + Send>
        };
        (make, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_silence() {
        let (make, mut rx) = notifier();
        let mut ep = Endpointer::new(Duration::from_millis(1500));

        ep.on_transcript_changed(1, make());
        tokio::time::sleep(Duration::from_millis(1499)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(rx.recv().await, Some(1));
        assert!(ep.accept_fire(1, false));
        assert!(!ep.is_armed());

        // Nothing else arrives
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_pending_window() {
        let (make, mut rx) = notifier();
        let mut ep = Endpointer::new(Duration::from_millis(1500));

        ep.on_transcript_changed(1, make());
        tokio::time::sleep(Duration::from_millis(1000)).await;
        ep.on_transcript_changed(2, make());
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(rx.try_recv().is_err(), "first window must not fire");

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(rx.recv().await, Some(2));
        assert!(!ep.accept_fire(1, false), "stale revision");
        assert!(ep.accept_fire(2, false));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_transcript_suppresses_and_disarms() {
        let (make, mut rx) = notifier();
        let mut ep = Endpointer::new(Duration::from_millis(1500));

        ep.on_transcript_changed(3, make());
        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(rx.recv().await, Some(3));
        assert!(!ep.accept_fire(3, true));
        assert!(!ep.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_fire() {
        let (make, mut rx) = notifier();
        let mut ep = Endpointer::new(Duration::from_millis(1500));
        ep.on_transcript_changed(1, make());
        ep.cancel();
        ep.cancel();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(rx.try_recv().is_err());
        assert!(!ep.accept_fire(1, false));
    }
}
