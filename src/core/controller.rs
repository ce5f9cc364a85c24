//! Pause/resume/stop signal shared between a session and its running pipeline.
//!
//! The pipeline only consults the controller at chapter boundaries, so a stop
//! never interrupts a fetch that is already in flight.

use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlFlags {
    pub paused: bool,
    pub stopped: bool,
}

/// Where the pipeline currently is relative to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Idle,
    Working,
    /// Suspended at a chapter boundary inside `wait_if_paused`.
    Parked,
    Finished,
}

pub struct Controller {
    flags: watch::Sender<ControlFlags>,
    phase: watch::Sender<PipelinePhase>,
    poll_interval: Duration,
}

impl Controller {
    pub fn new(poll_interval: Duration) -> Self {
        let (flags, _) = watch::channel(ControlFlags::default());
        let (phase, _) = watch::channel(PipelinePhase::Idle);
        Self { flags, phase, poll_interval: poll_interval.max(Duration::from_millis(1)) }
    }

    pub fn flags(&self) -> ControlFlags {
        *self.flags.borrow()
    }

    pub fn is_paused(&self) -> bool {
        self.flags().paused
    }

    pub fn is_stopped(&self) -> bool {
        self.flags().stopped
    }

    pub fn pause(&self) {
        self.flags.send_modify(|f| f.paused = true);
    }

    pub fn resume(&self) {
        self.flags.send_modify(|f| f.paused = false);
    }

    /// Terminal: once stopped, the controller never runs again.
    pub fn stop(&self) {
        self.flags.send_modify(|f| f.stopped = true);
    }

    /// Suspends while paused and not stopped. Wakes on any flag change and
    /// re-checks at least once per poll interval.
    pub async fn wait_if_paused(&self) {
        let mut rx = self.flags.subscribe();
        let f = *rx.borrow_and_update();
        if !f.paused || f.stopped {
            return;
        }

        self.phase.send_replace(PipelinePhase::Parked);
        loop {
            let f = *rx.borrow_and_update();
            if !f.paused || f.stopped {
                break;
            }
            let _ = tokio::time::timeout(self.poll_interval, rx.changed()).await;
        }
        self.phase.send_replace(PipelinePhase::Working);
    }

    pub fn phase(&self) -> PipelinePhase {
        *self.phase.borrow()
    }

    pub(crate) fn set_phase(&self, phase: PipelinePhase) {
        self.phase.send_replace(phase);
    }

    /// Resolves once the pipeline is parked at a chapter boundary or has
    /// finished its run.
    pub async fn wait_for_boundary(&self) -> PipelinePhase {
        let mut rx = self.phase.subscribe();
        loop {
            let p = *rx.borrow_and_update();
            if matches!(p, PipelinePhase::Parked | PipelinePhase::Finished) {
                return p;
            }
            if rx.changed().await.is_err() {
                return PipelinePhase::Finished;
            }
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn stop_is_terminal() {
        let c = Controller::default();
        c.stop();
        c.resume();
        assert!(c.is_stopped());
        c.pause();
        c.resume();
        assert!(c.is_stopped());
        assert!(!c.is_paused());
    }

    #[tokio::test]
    async fn wait_returns_immediately_when_running() {
        let c = Controller::default();
        tokio::time::timeout(Duration::from_millis(50), c.wait_if_paused())
            .await
            .unwrap();
        assert_eq!(c.phase(), PipelinePhase::Idle);
    }

    #[tokio::test]
    async fn paused_wait_parks_until_resume() {
        let c = Arc::new(Controller::new(Duration::from_millis(10)));
        c.pause();

        let c2 = c.clone();
        let waiter = tokio::spawn(async move { c2.wait_if_paused().await });

        assert_eq!(c.wait_for_boundary().await, PipelinePhase::Parked);
        assert!(!waiter.is_finished());

        c.resume();
        waiter.await.unwrap();
        assert_eq!(c.phase(), PipelinePhase::Working);
    }

    #[tokio::test]
    async fn stop_releases_a_paused_wait() {
        let c = Arc::new(Controller::new(Duration::from_millis(10)));
        c.pause();
        let c2 = c.clone();
        let waiter = tokio::spawn(async move { c2.wait_if_paused().await });
        c.wait_for_boundary().await;
        c.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }
}
