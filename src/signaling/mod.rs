//! Signaling protocol: wire messages, channel events, and the per-user
//! auto-reconnecting WebSocket channel.

pub mod channel;
pub mod socket;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned directly from signaling-channel operations.
///
/// Fatal conditions discovered asynchronously (auth rejection, server fatal
/// error, retries exhausted) are published as [`ChannelEvent`]s instead, so
/// they reach observers that are not awaiting any call.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("no valid credential available for channel authentication")]
    NoCredential,
    #[error("no open signaling connection for this user")]
    NotConnected,
    #[error("signaling connect attempt timed out")]
    ConnectTimeout,
    #[error("timed out waiting on an in-flight connect attempt")]
    InFlightTimeout,
    #[error("signaling connect attempt failed")]
    ConnectFailed,
    #[error("connect attempt was cancelled by an explicit close")]
    Cancelled,
    #[error("signaling transport error: {0}")]
    Transport(String),
    #[error("failed to serialize signaling message: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Connection state of one user's signaling channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Event published by the registry, scoped to one local user identity.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub user_id: String,
    pub kind: ChannelEventKind,
}

#[derive(Debug, Clone)]
pub enum ChannelEventKind {
    State(ChannelConnectionState),
    Message(ServerMessage),
    /// Credential rejected at transport or application level; no reconnect
    /// will be attempted until the caller re-authenticates and reconnects.
    AuthError,
    /// Server-side fatal error; credentials are fine but the server broke.
    ServerError,
    /// Automatic reconnection gave up after the configured attempt budget.
    RetriesExhausted,
}

/// SDP offer/answer payload, in the browser `RTCSessionDescription` shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

/// ICE candidate payload, in the browser `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_m_line_index: Option<u32>,
}

/// Outbound signaling message, one variant per wire `type`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    CallInitiate {
        callee_id: String,
    },
    CallAccept {
        call_id: String,
        room_name: String,
    },
    CallReject {
        call_id: String,
        room_name: String,
    },
    CallEnd {
        call_id: String,
        room_name: String,
    },
    Offer {
        room_name: String,
        offer: SessionDescription,
    },
    Answer {
        room_name: String,
        answer: SessionDescription,
    },
    IceCandidate {
        room_name: String,
        candidate: IceCandidate,
    },
}

/// Envelope serialized onto the wire: the tagged message plus the client
/// timestamp every outbound message carries.
#[derive(Debug, Serialize)]
pub struct Outbound {
    #[serde(flatten)]
    pub msg: ClientMessage,
    /// Client wall-clock, milliseconds since the epoch
    pub timestamp: i64,
}

impl Outbound {
    pub fn now(msg: ClientMessage) -> Self {
        Self {
            msg,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Inbound signaling message relayed by the server.
///
/// Unrecognized types deserialize to `Unknown` and are forwarded as-is, so a
/// newer server does not break older clients.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    IncomingCall {
        caller_id: String,
        #[serde(default)]
        caller_name: Option<String>,
        call_id: String,
        room_name: String,
    },
    CallAccepted {
        #[serde(default)]
        call_id: Option<String>,
        #[serde(default)]
        room_name: Option<String>,
    },
    CallRejected {
        #[serde(default)]
        call_id: Option<String>,
    },
    CallEnded {
        #[serde(default)]
        call_id: Option<String>,
    },
    Offer {
        room_name: String,
        offer: SessionDescription,
    },
    Answer {
        room_name: String,
        answer: SessionDescription,
    },
    IceCandidate {
        room_name: String,
        candidate: IceCandidate,
    },
    /// Application-level authentication failure; treated like a fatal close.
    AuthError {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}
