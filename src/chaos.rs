//! Disconnect simulator.
//!
//! Chaos harness that forcibly kills an open connection exactly once, to
//! exercise the recovery path. Armed on every open transition and tagged with
//! the generation of the transport instance that armed it, so a timer left
//! over from a superseded connection can be detected and ignored.

use std::pin::Pin;
use std::time::Duration;

use tokio::time::{sleep, Sleep};

pub struct DisconnectSimulator {
    generation: u64,
    timer: Pin<Box<Sleep>>,
    fired: bool,
}

impl DisconnectSimulator {
    /// Arm a one-shot kill timer scoped to `generation`.
    pub fn arm(generation: u64, delay: Duration) -> Self {
        Self {
            generation,
            timer: Box::pin(sleep(delay)),
            fired: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Resolves once when the kill timer elapses, yielding the generation the
    /// timer was armed for. Pending forever after it has fired.
    pub async fn fire(&mut self) -> u64 {
        if self.fired {
            std::future::pending::<()>().await;
        }
        self.timer.as_mut().await;
        self.fired = true;
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn fires_once_at_configured_delay() {
        let start = Instant::now();
        let mut sim = DisconnectSimulator::arm(3, Duration::from_millis(30_000));

        assert_eq!(sim.fire().await, 3);
        assert_eq!(start.elapsed(), Duration::from_millis(30_000));
        assert_eq!(sim.generation(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn never_fires_twice() {
        let mut sim = DisconnectSimulator::arm(1, Duration::from_millis(10));
        sim.fire().await;

        let second = tokio::time::timeout(Duration::from_secs(60), sim.fire()).await;
        assert!(second.is_err());
    }
}
