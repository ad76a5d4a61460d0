//! RTC capability interface and the thin adapter over it.
//!
//! The browser/engine primitives (getUserMedia, RTCPeerConnection) are
//! consumed through traits so the call logic never touches a concrete media
//! stack; the host application supplies the production implementations.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signaling::{IceCandidate, SessionDescription};

use super::{CallError, MediaState};

/// Failure reported by the RTC capability layer.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct RtcError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Handle to a remote media stream, resolved to actual media by the host UI.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub id: String,
}

/// Event raised by a live peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Locally gathered ICE candidate to relay to the remote peer.
    LocalCandidate(IceCandidate),
    /// Remote media arrived.
    RemoteStream(RemoteStream),
    ConnectionState(PeerConnectionState),
}

/// One local media track (audio or video).
pub trait MediaTrack: Send + Sync {
    fn kind(&self) -> TrackKind;
    /// Enable/disable in place; no renegotiation.
    fn set_enabled(&self, enabled: bool);
    fn stop(&self);
}

/// Local media acquired from the devices layer.
pub struct LocalMediaStream {
    pub id: String,
    pub tracks: Vec<Arc<dyn MediaTrack>>,
}

impl LocalMediaStream {
    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Which device kinds to request.
#[derive(Debug, Clone, Copy)]
pub struct MediaConstraints {
    pub video: bool,
    pub audio: bool,
}

/// Camera/microphone acquisition (getUserMedia).
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMediaStream, RtcError>;
}

/// One underlying peer connection (RTCPeerConnection).
#[async_trait]
pub trait RtcPeerConnection: Send + Sync {
    fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), RtcError>;
    async fn create_offer(&self) -> Result<SessionDescription, RtcError>;
    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), RtcError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), RtcError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;
    async fn close(&self);
}

/// Creates peer connections wired to an event sender.
#[async_trait]
pub trait RtcEngine: Send + Sync {
    async fn create_peer_connection(
        &self,
        ice_servers: &[String],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn RtcPeerConnection>, RtcError>;
}

/// Owns the current call's peer connection and local media.
///
/// The adapter never half-initializes: a failure while attaching media tears
/// the connection back down before the error is returned, and `teardown` is
/// idempotent.
pub struct PeerConnectionAdapter {
    engine: Arc<dyn RtcEngine>,
    connection: Option<Arc<dyn RtcPeerConnection>>,
    local_stream: Option<LocalMediaStream>,
}

impl PeerConnectionAdapter {
    pub fn new(engine: Arc<dyn RtcEngine>) -> Self {
        Self {
            engine,
            connection: None,
            local_stream: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.connection.is_some()
    }

    pub fn connection(&self) -> Option<Arc<dyn RtcPeerConnection>> {
        self.connection.clone()
    }

    pub fn local_stream_id(&self) -> Option<String> {
        self.local_stream.as_ref().map(|s| s.id.clone())
    }

    /// Create the underlying peer connection against the given STUN servers.
    pub async fn create(
        &mut self,
        stun_servers: &[String],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<(), CallError> {
        if self.connection.is_some() {
            return Ok(());
        }
        let connection = self
            .engine
            .create_peer_connection(stun_servers, events)
            .await
            .map_err(|e| CallError::Negotiation(e.to_string()))?;
        self.connection = Some(connection);
        Ok(())
    }

    /// Attach an already-acquired local stream, applying the user's current
    /// mute/camera preference to each track.
    pub async fn adopt_stream(
        &mut self,
        stream: LocalMediaStream,
        media: &MediaState,
    ) -> Result<(), CallError> {
        let connection = match &self.connection {
            Some(c) => c.clone(),
            None => {
                stream.stop_all();
                return Err(CallError::Negotiation(
                    "no peer connection to attach media to".into(),
                ));
            }
        };

        for track in &stream.tracks {
            let enabled = match track.kind() {
                TrackKind::Audio => media.audio_enabled,
                TrackKind::Video => media.video_enabled,
            };
            track.set_enabled(enabled);
            if let Err(e) = connection.add_track(track.clone()) {
                stream.stop_all();
                self.teardown().await;
                return Err(CallError::Media(e.to_string()));
            }
        }

        self.local_stream = Some(stream);
        Ok(())
    }

    /// Flip one local track kind in place. No-op without local media.
    pub fn set_track_enabled(&self, kind: TrackKind, enabled: bool) {
        if let Some(stream) = &self.local_stream {
            for track in &stream.tracks {
                if track.kind() == kind {
                    track.set_enabled(enabled);
                }
            }
        }
    }

    /// Stop local tracks, close the connection, drop every reference.
    /// Safe to call repeatedly.
    pub async fn teardown(&mut self) {
        if let Some(stream) = self.local_stream.take() {
            stream.stop_all();
        }
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
    }
}
