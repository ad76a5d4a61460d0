//! WebSocket transport for the signaling channel.
//!
//! The registry talks to the transport through the [`Connector`] trait so
//! tests can substitute an in-memory fake; the production implementation
//! pumps a tokio-tungstenite stream.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::ChannelError;

/// Close code reported when the transport ends without a close frame.
pub const CLOSE_CODE_ABNORMAL: u16 = 1006;

/// Frame handed to the transport pump for transmission.
#[derive(Debug)]
pub enum OutboundFrame {
    Text(String),
    /// Initiate a normal closure (code 1000); no auto-reconnect follows.
    Close,
}

/// Event surfaced by the transport pump.
#[derive(Debug)]
pub enum TransportEvent {
    Text(String),
    Closed { code: u16 },
}

/// A connected duplex transport: a sender for outbound frames and a receiver
/// for inbound events. Delivery order matches transport arrival order.
pub struct SignalingTransport {
    pub outbound: mpsc::UnboundedSender<OutboundFrame>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens signaling transports. One implementation per environment.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SignalingTransport, ChannelError>;
}

/// Production connector backed by tokio-tungstenite.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<SignalingTransport, ChannelError> {
        tracing::info!("Connecting signaling WebSocket");
        tracing::debug!("WS url: {}", url);

        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;

        tracing::info!("Signaling WebSocket connected (status={})", response.status());

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, ev_rx) = mpsc::unbounded_channel();

        tokio::spawn(pump(stream, out_rx, ev_tx));

        Ok(SignalingTransport {
            outbound: out_tx,
            events: ev_rx,
        })
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Drive one WebSocket until it closes: forward outbound frames, answer
/// pings, surface text frames and the final close code.
async fn pump(
    mut stream: WsStream,
    mut out_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    ev_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        tokio::select! {
            out = out_rx.recv() => match out {
                Some(OutboundFrame::Text(text)) => {
                    tracing::debug!("WS send: {}", text);
                    if let Err(e) = stream.send(Message::Text(text)).await {
                        tracing::warn!("WebSocket send failed: {}", e);
                        let _ = ev_tx.send(TransportEvent::Closed { code: CLOSE_CODE_ABNORMAL });
                        break;
                    }
                }
                Some(OutboundFrame::Close) => {
                    let frame = CloseFrame { code: CloseCode::Normal, reason: "".into() };
                    if let Err(e) = stream.send(Message::Close(Some(frame))).await {
                        tracing::debug!("WebSocket close send failed: {}", e);
                    }
                    let _ = ev_tx.send(TransportEvent::Closed { code: 1000 });
                    break;
                }
                None => {
                    // Every sender dropped; shut the socket down cleanly.
                    let _ = stream.close(None).await;
                    let _ = ev_tx.send(TransportEvent::Closed { code: 1000 });
                    break;
                }
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WS recv: {}", text);
                    if ev_tx.send(TransportEvent::Text(text)).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = stream.send(Message::Pong(data)).await {
                        tracing::warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let code = frame
                        .map(|f| u16::from(f.code))
                        .unwrap_or(1005);
                    tracing::info!("WebSocket closed by server (code={})", code);
                    let _ = ev_tx.send(TransportEvent::Closed { code });
                    break;
                }
                Some(Ok(other)) => {
                    tracing::debug!("WS frame (ignored): {:?}", other);
                }
                Some(Err(e)) => {
                    tracing::warn!("WebSocket receive error: {}", e);
                    let _ = ev_tx.send(TransportEvent::Closed { code: CLOSE_CODE_ABNORMAL });
                    break;
                }
                None => {
                    let _ = ev_tx.send(TransportEvent::Closed { code: CLOSE_CODE_ABNORMAL });
                    break;
                }
            }
        }
    }
}
