//! Transport abstraction and the production WebSocket implementation.
//!
//! The lifecycle manager only sees the [`Transport`] trait: a stream of
//! lifecycle events plus ping, new-head subscription and hard-terminate
//! controls, with block detail fetches going through a shared
//! [`BlockSource`] handle so they can run concurrently with event handling.
//!
//! [`WsTransport`] is the real thing: a `tokio-tungstenite` socket speaking
//! JSON-RPC (`eth_subscribe` newHeads + `eth_getBlockByNumber`), run as a
//! spawned IO task behind command/event channels. One instance per connection
//! attempt; a reconnect always builds a brand-new transport.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::rpc::{hex_quantity, parse_quantity};

/// The two fields we consume from a block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRecord {
    pub number: u64,
    pub timestamp_secs: u64,
}

/// Lifecycle and subscription events a transport emits, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    Closed,
    Errored(String),
    Pong,
    /// A new-head notification carrying the block number.
    Block(u64),
}

/// Request/response side of the transport, shared with in-flight block tasks.
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn get_block(&self, number: u64) -> Result<BlockRecord>;
}

#[async_trait]
pub trait Transport: Send {
    /// Next event from the connection. `None` means the connection is gone
    /// and nothing further will arrive.
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Send a ping control frame.
    async fn send_ping(&mut self) -> Result<()>;

    /// Request the new-head subscription. Called once per connection, after
    /// the open event.
    async fn subscribe_blocks(&mut self) -> Result<()>;

    /// Hard close, no close handshake. Idempotent.
    async fn terminate(&mut self);

    /// Shared handle for concurrent block detail fetches.
    fn block_source(&self) -> Arc<dyn BlockSource>;
}

/// Builds a fresh transport per connection attempt.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    type Transport: Transport + 'static;

    async fn connect(&self) -> Result<Self::Transport>;
}

#[async_trait]
impl<F: TransportFactory> TransportFactory for Arc<F> {
    type Transport = F::Transport;

    async fn connect(&self) -> Result<Self::Transport> {
        (**self).connect().await
    }
}

// =============================================================================
// WEBSOCKET TRANSPORT
// =============================================================================

enum WsCommand {
    Ping,
    Subscribe,
    Request {
        method: &'static str,
        params: Value,
        resp: oneshot::Sender<Result<Value>>,
    },
    Terminate,
}

pub struct WsTransport {
    cmd_tx: mpsc::Sender<WsCommand>,
    event_rx: mpsc::Receiver<TransportEvent>,
    source: Arc<WsBlockSource>,
}

impl WsTransport {
    /// Dial `url` and spawn the IO task. The `Open` event is queued as soon
    /// as the socket upgrade completes.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, response) = connect_async(url)
            .await
            .context("websocket connect failed")?;
        info!(status = %response.status(), "websocket connected");

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(256);

        tokio::spawn(io_task(ws_stream, cmd_rx, event_tx));

        let source = Arc::new(WsBlockSource {
            cmd_tx: cmd_tx.clone(),
        });

        Ok(Self {
            cmd_tx,
            event_rx,
            source,
        })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.event_rx.recv().await
    }

    async fn send_ping(&mut self) -> Result<()> {
        self.cmd_tx
            .send(WsCommand::Ping)
            .await
            .map_err(|_| anyhow!("transport io task is gone"))
    }

    async fn subscribe_blocks(&mut self) -> Result<()> {
        self.cmd_tx
            .send(WsCommand::Subscribe)
            .await
            .map_err(|_| anyhow!("transport io task is gone"))
    }

    async fn terminate(&mut self) {
        let _ = self.cmd_tx.send(WsCommand::Terminate).await;
    }

    fn block_source(&self) -> Arc<dyn BlockSource> {
        self.source.clone()
    }
}

struct WsBlockSource {
    cmd_tx: mpsc::Sender<WsCommand>,
}

#[async_trait]
impl BlockSource for WsBlockSource {
    async fn get_block(&self, number: u64) -> Result<BlockRecord> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(WsCommand::Request {
                method: "eth_getBlockByNumber",
                params: json!([hex_quantity(number), false]),
                resp: resp_tx,
            })
            .await
            .map_err(|_| anyhow!("transport closed"))?;

        let value = resp_rx
            .await
            .map_err(|_| anyhow!("transport closed before block response"))??;

        block_record_from_header(&value)
    }
}

/// Extract the consumed header fields from an `eth_getBlockByNumber` result.
fn block_record_from_header(header: &Value) -> Result<BlockRecord> {
    if header.is_null() {
        bail!("block not found");
    }
    let number = header
        .get("number")
        .and_then(Value::as_str)
        .context("block header missing number")?;
    let timestamp = header
        .get("timestamp")
        .and_then(Value::as_str)
        .context("block header missing timestamp")?;

    Ok(BlockRecord {
        number: parse_quantity(number)?,
        timestamp_secs: parse_quantity(timestamp)?,
    })
}

/// Pull the block number out of an `eth_subscription` newHeads frame, if the
/// frame is one.
fn new_head_number(frame: &Value) -> Option<u64> {
    if frame.get("method").and_then(Value::as_str) != Some("eth_subscription") {
        return None;
    }
    let number = frame
        .get("params")?
        .get("result")?
        .get("number")?
        .as_str()?;
    parse_quantity(number).ok()
}

async fn io_task(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut cmd_rx: mpsc::Receiver<WsCommand>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let (mut write, mut read) = ws_stream.split();

    if event_tx.send(TransportEvent::Open).await.is_err() {
        return;
    }

    let mut next_id: u64 = 1;
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value>>> = HashMap::new();
    let mut subscribe_req_id: Option<u64> = None;

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(WsCommand::Ping) => {
                    if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                        let _ = event_tx.send(TransportEvent::Errored(e.to_string())).await;
                        break;
                    }
                }
                Some(WsCommand::Subscribe) => {
                    let id = next_id;
                    next_id += 1;
                    subscribe_req_id = Some(id);
                    let frame = json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "method": "eth_subscribe",
                        "params": ["newHeads"],
                    });
                    if let Err(e) = write.send(Message::Text(frame.to_string())).await {
                        let _ = event_tx.send(TransportEvent::Errored(e.to_string())).await;
                        break;
                    }
                }
                Some(WsCommand::Request { method, params, resp }) => {
                    let id = next_id;
                    next_id += 1;
                    let frame = json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "method": method,
                        "params": params,
                    });
                    match write.send(Message::Text(frame.to_string())).await {
                        Ok(()) => {
                            pending.insert(id, resp);
                        }
                        Err(e) => {
                            let _ = resp.send(Err(anyhow!("request send failed: {e}")));
                            let _ = event_tx.send(TransportEvent::Errored(e.to_string())).await;
                            break;
                        }
                    }
                }
                // Hard close: drop the socket without a close handshake.
                Some(WsCommand::Terminate) | None => break,
            },

            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    handle_text_frame(&text, &mut pending, subscribe_req_id, &event_tx).await;
                }
                Some(Ok(Message::Pong(_))) => {
                    if event_tx.send(TransportEvent::Pong).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "websocket close frame");
                    let _ = event_tx.send(TransportEvent::Closed).await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let _ = event_tx.send(TransportEvent::Errored(e.to_string())).await;
                    break;
                }
                None => {
                    let _ = event_tx.send(TransportEvent::Closed).await;
                    break;
                }
            }
        }
    }

    // Fail anything still waiting on a response.
    for (_, resp) in pending.drain() {
        let _ = resp.send(Err(anyhow!("connection closed")));
    }
}

async fn handle_text_frame(
    text: &str,
    pending: &mut HashMap<u64, oneshot::Sender<Result<Value>>>,
    subscribe_req_id: Option<u64>,
    event_tx: &mpsc::Sender<TransportEvent>,
) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "ignoring unparseable websocket frame");
            return;
        }
    };

    if let Some(number) = new_head_number(&frame) {
        let _ = event_tx.send(TransportEvent::Block(number)).await;
        return;
    }

    let Some(id) = frame.get("id").and_then(Value::as_u64) else {
        debug!("ignoring websocket frame with neither id nor subscription");
        return;
    };

    if subscribe_req_id == Some(id) {
        match frame.get("result").and_then(Value::as_str) {
            Some(sub_id) => debug!(subscription = sub_id, "newHeads subscription confirmed"),
            None => warn!(frame = %text, "newHeads subscription rejected"),
        }
        return;
    }

    if let Some(resp) = pending.remove(&id) {
        let outcome = match frame.get("error") {
            Some(err) if !err.is_null() => {
                let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
                let message = err
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                Err(anyhow!("rpc error {code}: {message}"))
            }
            _ => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = resp.send(outcome);
    }
}

/// Factory dialing the configured endpoint; one fresh transport per attempt.
pub struct WsTransportFactory {
    url: String,
}

impl WsTransportFactory {
    pub fn new(url: String) -> Self {
        Self { url }
    }
}

#[async_trait]
impl TransportFactory for WsTransportFactory {
    type Transport = WsTransport;

    async fn connect(&self) -> Result<WsTransport> {
        WsTransport::connect(&self.url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_new_head_notification() {
        let frame: Value = serde_json::from_str(
            r#"{
                "jsonrpc": "2.0",
                "method": "eth_subscription",
                "params": {
                    "subscription": "0x9cef478923ff08bf67fde6c64013158d",
                    "result": {
                        "number": "0x10d4f",
                        "timestamp": "0x6578a1c0",
                        "hash": "0xabc"
                    }
                }
            }"#,
        )
        .unwrap();

        assert_eq!(new_head_number(&frame), Some(0x10d4f));
    }

    #[test]
    fn ignores_non_subscription_frames() {
        let frame: Value =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":7,"result":"0xdeadbeef"}"#).unwrap();
        assert_eq!(new_head_number(&frame), None);
    }

    #[test]
    fn block_record_from_full_header() {
        let header: Value = serde_json::from_str(
            r#"{"number":"0x64","timestamp":"0x3e8","hash":"0xabc","miner":"0x0"}"#,
        )
        .unwrap();

        let record = block_record_from_header(&header).unwrap();
        assert_eq!(
            record,
            BlockRecord {
                number: 100,
                timestamp_secs: 1_000
            }
        );
    }

    #[test]
    fn null_header_is_an_error() {
        assert!(block_record_from_header(&Value::Null).is_err());
        let missing: Value = serde_json::from_str(r#"{"number":"0x64"}"#).unwrap();
        assert!(block_record_from_header(&missing).is_err());
    }
}
