//! Watcher configuration.
//!
//! Environment-driven with hard-coded defaults matching the constants the
//! service has always run with. `.env` files are honored by the binary via
//! `dotenv` before this module reads anything.

use anyhow::{bail, Context, Result};
use std::env;
use tracing::warn;

/// Configuration surface for one watcher instance.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// WebSocket endpoint of the block source.
    pub ws_url: String,
    /// Auxiliary HTTP JSON-RPC endpoint for diagnostic trace calls.
    pub trace_http_url: Option<String>,

    // Keep-alive parameters
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,

    // Reconnection parameters
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,

    // Chaos harness: forcibly drop the connection once per open
    pub simulate_disconnect: bool,
    pub simulate_disconnect_interval_ms: u64,

    // Per-block diagnostic trace call
    pub trace_enabled: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            ws_url: String::new(),
            trace_http_url: None,
            ping_interval_ms: 7_500,
            pong_timeout_ms: 15_000,
            max_reconnect_attempts: 5,
            reconnect_base_delay_ms: 1_000,
            simulate_disconnect: false,
            simulate_disconnect_interval_ms: 30_000,
            trace_enabled: false,
        }
    }
}

impl WatcherConfig {
    /// Load from environment with defaults. `ETH_NODE_WSS` is required.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        config.ws_url = env::var("ETH_NODE_WSS").context("ETH_NODE_WSS is not set")?;
        config.trace_http_url = env::var("ETH_TRACE_HTTP").ok();

        if let Ok(v) = env::var("BLOCKWATCH_PING_INTERVAL_MS") {
            config.ping_interval_ms = v.parse().unwrap_or(config.ping_interval_ms);
        }
        if let Ok(v) = env::var("BLOCKWATCH_PONG_TIMEOUT_MS") {
            config.pong_timeout_ms = v.parse().unwrap_or(config.pong_timeout_ms);
        }
        if let Ok(v) = env::var("BLOCKWATCH_MAX_RECONNECT_ATTEMPTS") {
            config.max_reconnect_attempts = v.parse().unwrap_or(config.max_reconnect_attempts);
        }
        if let Ok(v) = env::var("BLOCKWATCH_RECONNECT_BASE_MS") {
            config.reconnect_base_delay_ms = v.parse().unwrap_or(config.reconnect_base_delay_ms);
        }
        if let Ok(v) = env::var("BLOCKWATCH_SIMULATE_DISCONNECT") {
            config.simulate_disconnect = parse_flag(&v);
        }
        if let Ok(v) = env::var("BLOCKWATCH_SIMULATE_DISCONNECT_INTERVAL_MS") {
            config.simulate_disconnect_interval_ms =
                v.parse().unwrap_or(config.simulate_disconnect_interval_ms);
        }
        if let Ok(v) = env::var("BLOCKWATCH_TRACE_ENABLED") {
            config.trace_enabled = parse_flag(&v);
        }

        Ok(config)
    }

    /// Reject configurations the watcher cannot run with.
    ///
    /// `ping_interval_ms <= pong_timeout_ms` only warns: the watchdog never
    /// arms a second pong deadline, so the protocol stays correct, it just
    /// skips ping ticks while one is outstanding.
    pub fn validate(&self) -> Result<()> {
        if self.ws_url.is_empty() {
            bail!("websocket endpoint url is empty");
        }
        if self.ping_interval_ms == 0 || self.pong_timeout_ms == 0 {
            bail!("keep-alive timers must be non-zero");
        }
        if self.reconnect_base_delay_ms == 0 {
            bail!("reconnect base delay must be non-zero");
        }
        if self.simulate_disconnect && self.simulate_disconnect_interval_ms == 0 {
            bail!("simulated disconnect interval must be non-zero");
        }
        if self.trace_enabled && self.trace_http_url.is_none() {
            bail!("trace calls enabled but ETH_TRACE_HTTP is not configured");
        }

        if self.ping_interval_ms <= self.pong_timeout_ms {
            warn!(
                ping_interval_ms = self.ping_interval_ms,
                pong_timeout_ms = self.pong_timeout_ms,
                "ping interval does not exceed pong timeout; ping ticks will be skipped while a pong is outstanding"
            );
        }

        Ok(())
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(v, "1" | "true" | "TRUE" | "on" | "ON")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_constants() {
        let config = WatcherConfig::default();
        assert_eq!(config.ping_interval_ms, 7_500);
        assert_eq!(config.pong_timeout_ms, 15_000);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_base_delay_ms, 1_000);
        assert_eq!(config.simulate_disconnect_interval_ms, 30_000);
        assert!(!config.trace_enabled);
    }

    #[test]
    fn validate_rejects_missing_url() {
        let config = WatcherConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_timers() {
        let config = WatcherConfig {
            ws_url: "wss://node.example".to_string(),
            pong_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_trace_without_endpoint() {
        let config = WatcherConfig {
            ws_url: "wss://node.example".to_string(),
            trace_enabled: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_inverted_keepalive_ordering() {
        // The shipped defaults have interval < timeout; the watchdog guard
        // makes that safe, so validation must not reject it.
        let config = WatcherConfig {
            ws_url: "wss://node.example".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn flag_parsing() {
        assert!(parse_flag("1"));
        assert!(parse_flag("true"));
        assert!(parse_flag("ON"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("no"));
    }
}
