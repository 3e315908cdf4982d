//! Connection lifecycle manager.
//!
//! Owns the one live transport, the keep-alive watchdog, the reconnect policy
//! and the optional disconnect simulator, and guarantees that every
//! connection loss is followed by exactly one of: a scheduled reconnect or
//! terminal failure. Duplicate close/error signals for the same underlying
//! fault collapse into a single recovery decision because the driver returns
//! on the first terminal event and drops the transport wholesale.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::chaos::DisconnectSimulator;
use crate::config::WatcherConfig;
use crate::pipeline::BlockEventPipeline;
use crate::reconnect::{ReconnectDecision, ReconnectPolicy};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::watchdog::{KeepAliveWatchdog, WatchdogAction};

/// Connection state machine states. Exclusively owned and mutated by the
/// manager; everyone else gets a read-only handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    ReconnectScheduled,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "CONNECTING"),
            Self::Open => write!(f, "OPEN"),
            Self::Closed => write!(f, "CLOSED"),
            Self::ReconnectScheduled => write!(f, "RECONNECT_SCHEDULED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Reason attached to each state transition (for logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionReason {
    Started,
    ConnectSuccess,
    ConnectFailed,
    PongTimeout,
    ServerClose,
    NetworkError,
    SimulatedDisconnect,
    RetriesExhausted,
}

impl std::fmt::Display for TransitionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::ConnectSuccess => write!(f, "connect_ok"),
            Self::ConnectFailed => write!(f, "connect_failed"),
            Self::PongTimeout => write!(f, "pong_timeout"),
            Self::ServerClose => write!(f, "server_close"),
            Self::NetworkError => write!(f, "network_error"),
            Self::SimulatedDisconnect => write!(f, "simulated_disconnect"),
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
        }
    }
}

pub struct ConnectionLifecycleManager<F: TransportFactory> {
    config: WatcherConfig,
    factory: F,
    pipeline: Arc<BlockEventPipeline>,
    policy: ReconnectPolicy,
    state: Arc<RwLock<ConnectionState>>,
    /// Incremented per transport instance; timers are tagged with the
    /// generation that armed them.
    generation: u64,
}

impl<F: TransportFactory> ConnectionLifecycleManager<F> {
    pub fn new(config: WatcherConfig, factory: F, pipeline: Arc<BlockEventPipeline>) -> Self {
        let policy = ReconnectPolicy::new(
            Duration::from_millis(config.reconnect_base_delay_ms),
            config.max_reconnect_attempts,
        );

        Self {
            config,
            factory,
            pipeline,
            policy,
            state: Arc::new(RwLock::new(ConnectionState::Connecting)),
            generation: 0,
        }
    }

    /// Read-only observation handle.
    pub fn state_handle(&self) -> Arc<RwLock<ConnectionState>> {
        self.state.clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn transition(&self, new_state: ConnectionState, reason: TransitionReason) {
        let old_state = {
            let mut state = self.state.write();
            std::mem::replace(&mut *state, new_state)
        };
        info!(
            from = %old_state,
            to = %new_state,
            reason = %reason,
            generation = self.generation,
            "connection_transition"
        );
    }

    /// Drive connections until the reconnect budget is spent. Returns only
    /// once the terminal `Failed` state is reached; the caller decides what
    /// happens to the process.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            self.generation += 1;
            self.transition(ConnectionState::Connecting, TransitionReason::Started);

            let reason = match self.factory.connect().await {
                Ok(transport) => self.drive_connection(transport).await,
                Err(e) => {
                    warn!(error = %e, generation = self.generation, "transport connect failed");
                    TransitionReason::ConnectFailed
                }
            };

            self.transition(ConnectionState::Closed, reason);

            match self.policy.next() {
                ReconnectDecision::Retry { attempt, delay } => {
                    self.transition(ConnectionState::ReconnectScheduled, reason);
                    info!(
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "scheduled reconnection attempt"
                    );
                    sleep(delay).await;
                }
                ReconnectDecision::Exhausted => {
                    self.transition(ConnectionState::Failed, TransitionReason::RetriesExhausted);
                    error!("maximum reconnection attempts reached, aborting");
                    return Err(anyhow!(
                        "reconnect attempts exhausted after {} tries",
                        self.config.max_reconnect_attempts
                    ));
                }
            }
        }
    }

    /// Run one transport instance until it dies, returning why. The watchdog
    /// and simulator timers live inside this call, so leaving it (for any
    /// reason) cancels them synchronously.
    async fn drive_connection(&mut self, mut transport: F::Transport) -> TransitionReason {
        let mut watchdog: Option<KeepAliveWatchdog> = None;
        let mut simulator: Option<DisconnectSimulator> = None;

        loop {
            tokio::select! {
                event = transport.next_event() => match event {
                    Some(TransportEvent::Open) => {
                        self.policy.reset();
                        self.transition(ConnectionState::Open, TransitionReason::ConnectSuccess);

                        watchdog = Some(KeepAliveWatchdog::new(
                            Duration::from_millis(self.config.ping_interval_ms),
                            Duration::from_millis(self.config.pong_timeout_ms),
                        ));
                        if self.config.simulate_disconnect {
                            simulator = Some(DisconnectSimulator::arm(
                                self.generation,
                                Duration::from_millis(self.config.simulate_disconnect_interval_ms),
                            ));
                        }

                        if let Err(e) = transport.subscribe_blocks().await {
                            warn!(error = %e, "block subscription failed");
                            transport.terminate().await;
                            return TransitionReason::NetworkError;
                        }
                    }
                    Some(TransportEvent::Pong) => {
                        debug!("received pong, connection is alive");
                        if let Some(w) = watchdog.as_mut() {
                            w.record_pong();
                        }
                    }
                    Some(TransportEvent::Block(number)) => {
                        let pipeline = self.pipeline.clone();
                        let source = transport.block_source();
                        tokio::spawn(async move {
                            pipeline.on_block(source.as_ref(), number).await;
                        });
                    }
                    Some(TransportEvent::Closed) | None => {
                        error!(generation = self.generation, "the websocket connection was closed");
                        return TransitionReason::ServerClose;
                    }
                    Some(TransportEvent::Errored(e)) => {
                        error!(error = %e, generation = self.generation, "websocket error");
                        return TransitionReason::NetworkError;
                    }
                },

                action = watchdog_action(&mut watchdog) => match action {
                    WatchdogAction::SendPing => {
                        debug!("checking if the connection is alive, sending a ping");
                        if let Err(e) = transport.send_ping().await {
                            warn!(error = %e, "ping send failed");
                            transport.terminate().await;
                            return TransitionReason::NetworkError;
                        }
                        if let Some(w) = watchdog.as_mut() {
                            w.record_ping_sent();
                        }
                    }
                    WatchdogAction::PongTimeout => {
                        error!("no pong received, terminating websocket connection");
                        transport.terminate().await;
                        return TransitionReason::PongTimeout;
                    }
                },

                armed_generation = simulator_fire(&mut simulator) => {
                    simulator = None;
                    if armed_generation == self.generation {
                        warn!(generation = armed_generation, "simulating broken websocket connection");
                        transport.terminate().await;
                        return TransitionReason::SimulatedDisconnect;
                    }
                    // A timer from a superseded connection instance; ignore.
                    debug!(
                        armed_generation,
                        generation = self.generation,
                        "stale simulated disconnect timer ignored"
                    );
                }
            }
        }
    }
}

/// Pending forever while no watchdog is armed, so the select arm only fires
/// in the open state.
async fn watchdog_action(watchdog: &mut Option<KeepAliveWatchdog>) -> WatchdogAction {
    match watchdog.as_mut() {
        Some(w) => w.next_action().await,
        None => std::future::pending().await,
    }
}

async fn simulator_fire(simulator: &mut Option<DisconnectSimulator>) -> u64 {
    match simulator.as_mut() {
        Some(s) => s.fire().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_reasons_render_snake_case() {
        assert_eq!(TransitionReason::PongTimeout.to_string(), "pong_timeout");
        assert_eq!(TransitionReason::ServerClose.to_string(), "server_close");
        assert_eq!(
            TransitionReason::RetriesExhausted.to_string(),
            "retries_exhausted"
        );
    }

    #[test]
    fn states_render_upper_case() {
        assert_eq!(ConnectionState::Open.to_string(), "OPEN");
        assert_eq!(
            ConnectionState::ReconnectScheduled.to_string(),
            "RECONNECT_SCHEDULED"
        );
    }
}
