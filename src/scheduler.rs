//! Periodic message scheduler
//!
//! A single suppressible repeating timer. While armed it delivers a tick to
//! the controller's event queue once per interval; the controller turns each
//! tick into one periodic-message fetch. The scheduler is paused for the
//! whole of any recording, listening, or in-flight submission, and its
//! interval is reset after every user-triggered exchange so the next
//! periodic message is a full interval away from the last real activity.

use crate::controller::SessionEvent;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct PeriodicScheduler {
    interval: Duration,
    tick_tx: mpsc::UnboundedSender<SessionEvent>,
    handle: Option<JoinHandle<()>>,
    paused: bool,
}

impl PeriodicScheduler {
    pub fn new(interval: Duration, tick_tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            interval,
            tick_tx,
            handle: None,
            paused: false,
        }
    }

    /// Re-arm the repeating timer if not already armed.
    pub fn resume(&mut self) {
        self.paused = false;
        self.arm();
    }

    /// Clear the timer without firing. Newly scheduled firings stop
    /// immediately; a fetch already in flight runs to completion.
    pub fn pause(&mut self) {
        self.paused = true;
        self.disarm();
    }

    /// Clear-then-rearm so the next firing is a full interval from now.
    pub fn reset_interval(&mut self) {
        self.disarm();
        if !self.paused {
            self.arm();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    fn arm(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let tick_tx = self.tick_tx.clone();
        let period = self.interval;
        self.handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; swallow it so firings
            // start a full interval from now.
            interval.tick().await;
            loop {
                interval.tick().await;
                if tick_tx.send(SessionEvent::PeriodicTick).is_err() {
                    break;
                }
            }
        }));
        debug!("Periodic scheduler armed ({:?})", period);
    }

    fn disarm(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("Periodic scheduler disarmed");
        }
    }
}

impl Drop for PeriodicScheduler {
    fn drop(&mut self) {
        self.disarm();
    }
}
