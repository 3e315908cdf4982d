//! Keep-alive watchdog.
//!
//! Owns the ping cadence timer and the single outstanding pong-deadline timer
//! for one open connection. The watchdog never arms a second deadline: a ping
//! tick that fires while a pong is still outstanding is swallowed. Dropping
//! the watchdog (which the manager does whenever the connection leaves the
//! open state) cancels both timers.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior, Sleep};

/// What the connection driver must do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Send a ping control frame, then call [`KeepAliveWatchdog::record_ping_sent`].
    SendPing,
    /// No pong arrived within the deadline; the transport must be hard
    /// terminated.
    PongTimeout,
}

pub struct KeepAliveWatchdog {
    pong_timeout: Duration,
    ping_timer: Interval,
    pong_deadline: Option<Pin<Box<Sleep>>>,
}

impl KeepAliveWatchdog {
    /// Arm the ping cadence. The first ping fires one full interval after the
    /// connection opened.
    pub fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        let mut ping_timer = interval_at(Instant::now() + ping_interval, ping_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Self {
            pong_timeout,
            ping_timer,
            pong_deadline: None,
        }
    }

    /// Wait for the next required action.
    ///
    /// Cancel-safe: both underlying timers keep their position when the
    /// returned future is dropped mid-wait.
    pub async fn next_action(&mut self) -> WatchdogAction {
        loop {
            if self.pong_deadline.is_none() {
                self.ping_timer.tick().await;
                return WatchdogAction::SendPing;
            }

            tokio::select! {
                _ = deadline_elapsed(&mut self.pong_deadline) => {
                    self.pong_deadline = None;
                    return WatchdogAction::PongTimeout;
                }
                // Previous ping still unanswered: skip this tick so at most
                // one deadline is ever armed.
                _ = self.ping_timer.tick() => {}
            }
        }
    }

    /// Arm the pong deadline; call right after the ping frame was written.
    pub fn record_ping_sent(&mut self) {
        self.pong_deadline = Some(Box::pin(sleep(self.pong_timeout)));
    }

    /// A pong arrived; cancel the pending deadline, if any.
    pub fn record_pong(&mut self) {
        self.pong_deadline = None;
    }

    pub fn pong_pending(&self) -> bool {
        self.pong_deadline.is_some()
    }
}

/// Pending forever when no deadline is armed, so the select arm above only
/// fires while a pong is outstanding.
async fn deadline_elapsed(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline.as_mut() {
        Some(d) => d.as_mut().await,
        None => std::future::pending().await,
    }
}
