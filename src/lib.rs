//! blockwatch - resilient block-notification watcher.
//!
//! Keeps one WebSocket subscription to a block source alive with a ping/pong
//! watchdog, recovers from connection loss with bounded exponential backoff,
//! and turns every new block into a receive-latency observation plus an
//! optional diagnostic trace call against an auxiliary endpoint.

pub mod chaos;
pub mod config;
pub mod manager;
pub mod pipeline;
pub mod reconnect;
pub mod rpc;
pub mod transport;
pub mod watchdog;
