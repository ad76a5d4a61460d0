//! In-memory fakes for the transport and RTC capability seams.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::call::peer::{
    LocalMediaStream, MediaConstraints, MediaDevices, MediaTrack, PeerEvent, RtcEngine,
    RtcError, RtcPeerConnection, TrackKind,
};
use crate::signaling::socket::{Connector, OutboundFrame, SignalingTransport, TransportEvent};
use crate::signaling::{ChannelError, IceCandidate, SessionDescription};

#[derive(Debug, Clone, Copy)]
enum ConnectMode {
    Succeed,
    Fail,
    Pending,
}

/// Connector whose "sockets" are channel pairs the test can drive directly.
pub struct FakeConnector {
    mode: Mutex<ConnectMode>,
    links: Mutex<Vec<Arc<FakeLink>>>,
    urls: Mutex<Vec<String>>,
    count: AtomicUsize,
}

impl FakeConnector {
    fn with_mode(mode: ConnectMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            links: Mutex::new(Vec::new()),
            urls: Mutex::new(Vec::new()),
            count: AtomicUsize::new(0),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::with_mode(ConnectMode::Succeed)
    }

    pub fn pending() -> Arc<Self> {
        Self::with_mode(ConnectMode::Pending)
    }

    /// Make every subsequent dial fail with a transport error.
    pub fn fail_from_now_on(&self) {
        *self.mode.lock().unwrap() = ConnectMode::Fail;
    }

    pub fn connect_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn last_url(&self) -> Option<String> {
        self.urls.lock().unwrap().last().cloned()
    }

    pub fn last_link(&self) -> Option<Arc<FakeLink>> {
        self.links.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<SignalingTransport, ChannelError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.urls.lock().unwrap().push(url.to_string());

        let mode = *self.mode.lock().unwrap();
        match mode {
            ConnectMode::Succeed => {
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                let (ev_tx, ev_rx) = mpsc::unbounded_channel();
                let link = Arc::new(FakeLink {
                    ev_tx,
                    out_rx: Mutex::new(out_rx),
                });
                self.links.lock().unwrap().push(link);
                Ok(SignalingTransport {
                    outbound: out_tx,
                    events: ev_rx,
                })
            }
            ConnectMode::Fail => Err(ChannelError::Transport("connection refused".into())),
            ConnectMode::Pending => std::future::pending().await,
        }
    }
}

/// The server side of one fake connection.
pub struct FakeLink {
    ev_tx: mpsc::UnboundedSender<TransportEvent>,
    out_rx: Mutex<mpsc::UnboundedReceiver<OutboundFrame>>,
}

impl FakeLink {
    pub fn inject_text(&self, text: &str) {
        let _ = self.ev_tx.send(TransportEvent::Text(text.to_string()));
    }

    pub fn close(&self, code: u16) {
        let _ = self.ev_tx.send(TransportEvent::Closed { code });
    }

    /// Drain and return every text frame the client has sent so far.
    pub fn sent_texts(&self) -> Vec<String> {
        let mut out = Vec::new();
        let mut rx = self.out_rx.lock().unwrap();
        while let Ok(frame) = rx.try_recv() {
            if let OutboundFrame::Text(text) = frame {
                out.push(text);
            }
        }
        out
    }
}

pub struct FakeTrack {
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for FakeTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

/// Fake getUserMedia; hands out audio/video track pairs and remembers them.
pub struct FakeDevices {
    fail_next: AtomicBool,
    acquired: AtomicUsize,
    tracks: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeDevices {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_next: AtomicBool::new(false),
            acquired: AtomicUsize::new(0),
            tracks: Mutex::new(Vec::new()),
        })
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn acquired_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn tracks(&self) -> Vec<Arc<FakeTrack>> {
        self.tracks.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMediaStream, RtcError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RtcError("permission denied".into()));
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst);

        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        let mut kinds = Vec::new();
        if constraints.audio {
            kinds.push(TrackKind::Audio);
        }
        if constraints.video {
            kinds.push(TrackKind::Video);
        }
        for kind in kinds {
            let track = Arc::new(FakeTrack {
                kind,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            });
            self.tracks.lock().unwrap().push(track.clone());
            tracks.push(track);
        }

        Ok(LocalMediaStream {
            id: format!("local-{n}"),
            tracks,
        })
    }
}

/// Fake RTCPeerConnection recording the order of operations applied to it.
pub struct FakePeerConnection {
    ops: Mutex<Vec<String>>,
    candidates: Mutex<Vec<IceCandidate>>,
    tracks: AtomicUsize,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl FakePeerConnection {
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Raise an engine-side event, as the real media stack would.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, op: &str) {
        self.ops.lock().unwrap().push(op.to_string());
    }
}

#[async_trait]
impl RtcPeerConnection for FakePeerConnection {
    fn add_track(&self, _track: Arc<dyn MediaTrack>) -> Result<(), RtcError> {
        self.tracks.fetch_add(1, Ordering::SeqCst);
        self.record("add_track");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        self.record("create_offer");
        Ok(SessionDescription {
            sdp_type: "offer".into(),
            sdp: "v=0 fake-offer".into(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        self.record("create_answer");
        Ok(SessionDescription {
            sdp_type: "answer".into(),
            sdp: "v=0 fake-answer".into(),
        })
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), RtcError> {
        self.record("set_local_description");
        Ok(())
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<(), RtcError> {
        self.record("set_remote_description");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.record("add_ice_candidate");
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.record("close");
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeEngine {
    connections: Mutex<Vec<Arc<FakePeerConnection>>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn last_connection(&self) -> Option<Arc<FakePeerConnection>> {
        self.connections.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl RtcEngine for FakeEngine {
    async fn create_peer_connection(
        &self,
        _ice_servers: &[String],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn RtcPeerConnection>, RtcError> {
        let connection = Arc::new(FakePeerConnection {
            ops: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            tracks: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            events,
        });
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}
