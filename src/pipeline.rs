//! Block event pipeline.
//!
//! Turns each inbound block notification into a receive-latency observation
//! and, when enabled, a best-effort diagnostic trace call. Failures here are
//! logged and dropped; they never escalate to connection state. Notifications
//! are handled concurrently and may complete out of block-number order.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::rpc::{hex_quantity, TraceRpc};
use crate::transport::{BlockRecord, BlockSource};

/// Diagnostic method invoked per block when tracing is enabled.
pub const TRACE_METHOD: &str = "debug_traceBlockByNumber";

/// One latency observation; emitted to the log collector, not retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyMetric {
    pub block_number: u64,
    pub block_timestamp_ms: i64,
    pub server_receive_time_ms: i64,
    pub receive_latency_ms: i64,
}

impl LatencyMetric {
    /// Block timestamps are source-reported seconds. No clock-skew correction
    /// is applied, so a source clock running ahead of us yields a negative
    /// latency.
    pub fn compute(block: &BlockRecord, server_receive_time_ms: i64) -> Self {
        let block_timestamp_ms = block.timestamp_secs as i64 * 1_000;
        Self {
            block_number: block.number,
            block_timestamp_ms,
            server_receive_time_ms,
            receive_latency_ms: server_receive_time_ms - block_timestamp_ms,
        }
    }
}

pub struct BlockEventPipeline {
    trace: Option<Arc<dyn TraceRpc>>,
}

impl BlockEventPipeline {
    /// `trace` present means the diagnostic call runs for every block.
    pub fn new(trace: Option<Arc<dyn TraceRpc>>) -> Self {
        Self { trace }
    }

    /// Handle one new-block notification to completion.
    pub async fn on_block(&self, source: &dyn BlockSource, number: u64) {
        let block = match source.get_block(number).await {
            Ok(block) => block,
            Err(e) => {
                error!(block = number, error = %e, "error fetching block data");
                return;
            }
        };

        let metric = LatencyMetric::compute(&block, Utc::now().timestamp_millis());
        info!(
            block = metric.block_number,
            block_timestamp_ms = metric.block_timestamp_ms,
            server_time_ms = metric.server_receive_time_ms,
            receive_latency_ms = metric.receive_latency_ms,
            "new block"
        );

        if let Some(trace) = &self.trace {
            match trace
                .call(TRACE_METHOD, vec![Value::String(hex_quantity(number))])
                .await
            {
                Ok(_) => debug!(block = number, "diagnostic trace completed"),
                Err(e) => warn!(block = number, error = %e, "diagnostic trace call failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct FixedSource {
        block: Option<BlockRecord>,
        fetched: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl BlockSource for FixedSource {
        async fn get_block(&self, number: u64) -> Result<BlockRecord> {
            self.fetched.lock().push(number);
            self.block.ok_or_else(|| anyhow!("block unavailable"))
        }
    }

    #[derive(Default)]
    struct RecordingTrace {
        calls: Mutex<Vec<(String, Vec<Value>)>>,
        fail: bool,
    }

    #[async_trait]
    impl TraceRpc for RecordingTrace {
        async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
            self.calls.lock().push((method.to_string(), params));
            if self.fail {
                Err(anyhow!("trace backend down"))
            } else {
                Ok(Value::Null)
            }
        }
    }

    #[test]
    fn latency_is_receive_time_minus_timestamp_ms() {
        let block = BlockRecord {
            number: 100,
            timestamp_secs: 1_000,
        };
        let metric = LatencyMetric::compute(&block, 1_000_500);

        assert_eq!(metric.block_number, 100);
        assert_eq!(metric.block_timestamp_ms, 1_000_000);
        assert_eq!(metric.server_receive_time_ms, 1_000_500);
        assert_eq!(metric.receive_latency_ms, 500);
    }

    #[test]
    fn latency_can_go_negative_on_clock_skew() {
        let block = BlockRecord {
            number: 7,
            timestamp_secs: 2_000,
        };
        let metric = LatencyMetric::compute(&block, 1_999_000);
        assert_eq!(metric.receive_latency_ms, -1_000);
    }

    #[tokio::test]
    async fn trace_call_uses_hex_block_number() {
        let source = FixedSource {
            block: Some(BlockRecord {
                number: 255,
                timestamp_secs: 1,
            }),
            fetched: Mutex::new(Vec::new()),
        };
        let trace = Arc::new(RecordingTrace::default());
        let pipeline = BlockEventPipeline::new(Some(trace.clone()));

        pipeline.on_block(&source, 255).await;

        let calls = trace.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, TRACE_METHOD);
        assert_eq!(calls[0].1, vec![Value::String("0xff".to_string())]);
    }

    #[tokio::test]
    async fn fetch_failure_drops_notification_without_tracing() {
        let source = FixedSource {
            block: None,
            fetched: Mutex::new(Vec::new()),
        };
        let trace = Arc::new(RecordingTrace::default());
        let pipeline = BlockEventPipeline::new(Some(trace.clone()));

        pipeline.on_block(&source, 42).await;

        assert_eq!(*source.fetched.lock(), vec![42]);
        assert!(trace.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn trace_failure_does_not_propagate() {
        let source = FixedSource {
            block: Some(BlockRecord {
                number: 9,
                timestamp_secs: 5,
            }),
            fetched: Mutex::new(Vec::new()),
        };
        let trace = Arc::new(RecordingTrace {
            calls: Mutex::new(Vec::new()),
            fail: true,
        });
        let pipeline = BlockEventPipeline::new(Some(trace.clone()));

        // Must return normally despite the trace backend failing.
        pipeline.on_block(&source, 9).await;
        assert_eq!(trace.calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn tracing_disabled_skips_the_call_entirely() {
        let source = FixedSource {
            block: Some(BlockRecord {
                number: 1,
                timestamp_secs: 1,
            }),
            fetched: Mutex::new(Vec::new()),
        };
        let pipeline = BlockEventPipeline::new(None);
        pipeline.on_block(&source, 1).await;
        assert_eq!(*source.fetched.lock(), vec![1]);
    }
}
