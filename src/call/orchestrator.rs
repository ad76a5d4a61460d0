//! Call orchestrator: the only writer of call state.
//!
//! Reacts to inbound signaling events by driving the state machine, the
//! negotiation buffer, and the peer connection adapter; reacts to local user
//! actions by emitting signaling messages and driving the adapter.
//!
//! Offer/answer roles are fixed by message type, not by who dialed: the side
//! that sends `call_accept` always creates the offer immediately afterwards,
//! and the other side only ever answers. Reassigning the offerer by
//! wall-clock race reintroduces glare.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};

use crate::signaling::channel::SignalingRegistry;
use crate::signaling::{
    ChannelConnectionState, ChannelEvent, ChannelEventKind, ClientMessage, IceCandidate,
    ServerMessage, SessionDescription,
};

use super::negotiation::{CandidateDisposition, NegotiationBuffer};
use super::peer::{
    MediaConstraints, MediaDevices, PeerConnectionAdapter, PeerConnectionState, PeerEvent,
    RemoteStream, RtcEngine, TrackKind,
};
use super::state::{CallSession, CallStateMachine, CallStatus};
use super::{CallError, MediaState};

/// How long an ended/rejected call stays visible before resetting to idle.
const TERMINAL_DISPLAY_DELAY: Duration = Duration::from_secs(3);

/// Event surfaced to the UI layer.
#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged {
        status: CallStatus,
        session: Option<CallSession>,
    },
    LocalStreamReady {
        stream_id: String,
    },
    RemoteStreamAdded(RemoteStream),
    MediaStateChanged {
        video_enabled: bool,
        audio_enabled: bool,
    },
    /// Camera/microphone unavailable; user-actionable, distinct from network
    /// failures.
    MediaError(String),
    /// The media path failed or disconnected; the call was torn down.
    ConnectionFailed,
    ChannelAuthError,
    ChannelServerError,
    ChannelRetriesExhausted,
}

struct CallCore {
    machine: CallStateMachine,
    negotiation: NegotiationBuffer,
    adapter: PeerConnectionAdapter,
    media: MediaState,
    /// Incremented whenever a session starts or resets; lets the terminal
    /// display-delay timer detect that it went stale.
    epoch: u64,
}

pub struct CallOrchestrator {
    user_id: String,
    registry: Arc<SignalingRegistry>,
    devices: Arc<dyn MediaDevices>,
    stun_servers: Vec<String>,
    core: Mutex<CallCore>,
    events: broadcast::Sender<CallEvent>,
    peer_tx: mpsc::UnboundedSender<PeerEvent>,
    weak: Weak<Self>,
}

impl CallOrchestrator {
    /// Build the orchestrator and start its event pumps.
    pub fn spawn(
        user_id: impl Into<String>,
        registry: Arc<SignalingRegistry>,
        engine: Arc<dyn RtcEngine>,
        devices: Arc<dyn MediaDevices>,
        stun_servers: Vec<String>,
    ) -> Arc<Self> {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let channel_rx = registry.subscribe();

        let this = Arc::new_cyclic(|weak| Self {
            user_id: user_id.into(),
            registry,
            devices,
            stun_servers,
            core: Mutex::new(CallCore {
                machine: CallStateMachine::new(),
                negotiation: NegotiationBuffer::new(),
                adapter: PeerConnectionAdapter::new(engine),
                media: MediaState::default(),
                epoch: 0,
            }),
            events,
            peer_tx,
            weak: weak.clone(),
        });

        tokio::spawn(Self::run_channel_events(Arc::downgrade(&this), channel_rx));
        tokio::spawn(Self::run_peer_events(Arc::downgrade(&this), peer_rx));
        this
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> CallStatus {
        self.core.lock().await.machine.status()
    }

    pub async fn session(&self) -> Option<CallSession> {
        self.core.lock().await.machine.session().cloned()
    }

    pub async fn media_state(&self) -> MediaState {
        self.core.lock().await.media
    }

    /// Dial `callee_id`. Connects the signaling channel first when absent.
    ///
    /// The peer connection is not created here: the accepting side is the
    /// offerer, so RTC setup waits for the remote accept to arrive as an
    /// `offer` message.
    pub async fn initiate_call(&self, callee_id: &str) -> Result<(), CallError> {
        {
            let core = self.core.lock().await;
            let status = core.machine.status();
            if status != CallStatus::Idle {
                return Err(CallError::InvalidState {
                    action: "initiate a call",
                    status,
                });
            }
        }

        self.registry.connect(&self.user_id).await?;

        let mut core = self.core.lock().await;
        core.machine.begin_outgoing(callee_id)?;
        core.epoch += 1;
        if let Err(e) = self.registry.send(
            &self.user_id,
            ClientMessage::CallInitiate {
                callee_id: callee_id.to_string(),
            },
        ) {
            core.machine.reset();
            return Err(e.into());
        }
        self.emit_state(&core);
        Ok(())
    }

    /// Accept the ringing call: send `call_accept`, bring up the peer
    /// connection and local media, then create and send the offer.
    ///
    /// Media acquisition happens outside the core lock so a concurrent
    /// reject is not blocked; the state is re-validated after every await
    /// and the attempt aborts cleanly if the call went away meanwhile.
    pub async fn accept_call(&self) -> Result<(), CallError> {
        let (call_id, room_name) = {
            let core = self.core.lock().await;
            let status = core.machine.status();
            if status != CallStatus::Ringing {
                return Err(CallError::InvalidState {
                    action: "accept the call",
                    status,
                });
            }
            let session = core.machine.session().ok_or(CallError::MissingCallContext)?;
            session.context()?
        };

        self.registry.send(
            &self.user_id,
            ClientMessage::CallAccept {
                call_id: call_id.clone(),
                room_name: room_name.clone(),
            },
        )?;

        let stream = match self
            .devices
            .acquire(MediaConstraints {
                video: true,
                audio: true,
            })
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                let _ = self.events.send(CallEvent::MediaError(e.to_string()));
                // The accept already went out; tell the remote we dropped.
                if let Err(send_err) = self.registry.send(
                    &self.user_id,
                    ClientMessage::CallEnd {
                        call_id,
                        room_name,
                    },
                ) {
                    tracing::warn!("Failed to send call_end after media failure: {}", send_err);
                }
                self.fail_active_call().await;
                return Err(CallError::Media(e.to_string()));
            }
        };

        let connection = {
            let mut core = self.core.lock().await;
            if core.machine.status() != CallStatus::Ringing {
                stream.stop_all();
                return Err(CallError::Aborted);
            }
            if let Err(e) = core
                .adapter
                .create(&self.stun_servers, self.peer_tx.clone())
                .await
            {
                stream.stop_all();
                return Err(e);
            }
            let media = core.media;
            if let Err(e) = core.adapter.adopt_stream(stream, &media).await {
                drop(core);
                self.fail_active_call().await;
                return Err(e);
            }
            if let Some(stream_id) = core.adapter.local_stream_id() {
                let _ = self.events.send(CallEvent::LocalStreamReady { stream_id });
            }
            core.adapter.connection().ok_or(CallError::Aborted)?
        };

        // Accepting side is the offerer.
        let offer = match connection.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail_active_call().await;
                return Err(CallError::Negotiation(e.to_string()));
            }
        };
        if let Err(e) = connection.set_local_description(offer.clone()).await {
            self.fail_active_call().await;
            return Err(CallError::Negotiation(e.to_string()));
        }

        let mut core = self.core.lock().await;
        if core.machine.status() != CallStatus::Ringing {
            return Err(CallError::Aborted);
        }
        if let Err(e) = self.registry.send(
            &self.user_id,
            ClientMessage::Offer {
                room_name,
                offer,
            },
        ) {
            drop(core);
            self.fail_active_call().await;
            return Err(e.into());
        }
        core.machine.local_accepted()?;
        self.emit_state(&core);
        Ok(())
    }

    /// Reject the ringing call, or cancel an outgoing one.
    pub async fn reject_call(&self) -> Result<(), CallError> {
        let mut core = self.core.lock().await;
        let status = core.machine.status();
        if !matches!(status, CallStatus::Ringing | CallStatus::Calling) {
            return Err(CallError::InvalidState {
                action: "reject the call",
                status,
            });
        }

        // Best-effort: a send failure never blocks local teardown, and an
        // outgoing call cancelled before the server assigned ids has
        // nothing to send yet.
        if let Some(session) = core.machine.session() {
            if let Ok((call_id, room_name)) = session.context() {
                if let Err(e) = self.registry.send(
                    &self.user_id,
                    ClientMessage::CallReject { call_id, room_name },
                ) {
                    tracing::warn!("Failed to send call_reject: {}", e);
                }
            }
        }

        self.finish_call(&mut core, CallStatus::Rejected).await;
        Ok(())
    }

    /// Hang up the connected call.
    pub async fn end_call(&self) -> Result<(), CallError> {
        let mut core = self.core.lock().await;
        let status = core.machine.status();
        if status != CallStatus::Connected {
            return Err(CallError::InvalidState {
                action: "end the call",
                status,
            });
        }

        if let Some(session) = core.machine.session() {
            match session.context() {
                Ok((call_id, room_name)) => {
                    if let Err(e) = self.registry.send(
                        &self.user_id,
                        ClientMessage::CallEnd { call_id, room_name },
                    ) {
                        tracing::warn!("Failed to send call_end: {}", e);
                    }
                }
                Err(_) => tracing::warn!("Ending a call that never received its ids"),
            }
        }

        self.finish_call(&mut core, CallStatus::Ended).await;
        Ok(())
    }

    /// Flip the camera preference and the live video track, if any.
    /// The preference outlives the call.
    pub async fn toggle_video(&self) -> bool {
        let mut core = self.core.lock().await;
        core.media.video_enabled = !core.media.video_enabled;
        let enabled = core.media.video_enabled;
        core.adapter.set_track_enabled(TrackKind::Video, enabled);
        self.emit_media_state(&core);
        enabled
    }

    /// Flip the microphone preference and the live audio track, if any.
    pub async fn toggle_audio(&self) -> bool {
        let mut core = self.core.lock().await;
        core.media.audio_enabled = !core.media.audio_enabled;
        let enabled = core.media.audio_enabled;
        core.adapter.set_track_enabled(TrackKind::Audio, enabled);
        self.emit_media_state(&core);
        enabled
    }

    async fn run_channel_events(this: Weak<Self>, mut rx: broadcast::Receiver<ChannelEvent>) {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Call orchestrator dropped {} channel events", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(this) = this.upgrade() else { break };
            if event.user_id != this.user_id {
                continue;
            }
            match event.kind {
                ChannelEventKind::Message(msg) => this.handle_message(msg).await,
                ChannelEventKind::AuthError => {
                    let _ = this.events.send(CallEvent::ChannelAuthError);
                    this.fail_active_call().await;
                }
                ChannelEventKind::ServerError => {
                    let _ = this.events.send(CallEvent::ChannelServerError);
                    this.fail_active_call().await;
                }
                ChannelEventKind::RetriesExhausted => {
                    let _ = this.events.send(CallEvent::ChannelRetriesExhausted);
                    this.fail_active_call().await;
                }
                ChannelEventKind::State(ChannelConnectionState::Disconnected) => {
                    this.on_channel_disconnected().await;
                }
                ChannelEventKind::State(_) => {}
            }
        }
    }

    async fn run_peer_events(this: Weak<Self>, mut rx: mpsc::UnboundedReceiver<PeerEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(this) = this.upgrade() else { break };
            match event {
                PeerEvent::LocalCandidate(candidate) => {
                    this.relay_local_candidate(candidate).await;
                }
                PeerEvent::RemoteStream(stream) => {
                    let _ = this.events.send(CallEvent::RemoteStreamAdded(stream));
                }
                PeerEvent::ConnectionState(state) => {
                    this.on_peer_connection_state(state).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::IncomingCall {
                caller_id,
                caller_name,
                call_id,
                room_name,
            } => {
                self.on_incoming_call(caller_id, caller_name, call_id, room_name)
                    .await;
            }
            ServerMessage::CallAccepted { call_id, room_name } => {
                self.on_call_accepted(call_id, room_name).await;
            }
            ServerMessage::Offer { room_name, offer } => self.on_offer(room_name, offer).await,
            ServerMessage::Answer { answer, .. } => self.on_answer(answer).await,
            ServerMessage::IceCandidate { candidate, .. } => {
                self.on_remote_candidate(candidate).await;
            }
            ServerMessage::CallEnded { .. } => {
                self.on_remote_terminated(CallStatus::Ended).await;
            }
            ServerMessage::CallRejected { .. } => {
                self.on_remote_terminated(CallStatus::Rejected).await;
            }
            // The channel already surfaced this as a typed AuthError event.
            ServerMessage::AuthError { .. } => {}
            ServerMessage::Unknown => tracing::debug!("Ignoring unknown signaling message"),
        }
    }

    async fn on_incoming_call(
        &self,
        caller_id: String,
        caller_name: Option<String>,
        call_id: String,
        room_name: String,
    ) {
        let mut core = self.core.lock().await;
        // A terminal display state does not hold the line busy.
        if matches!(
            core.machine.status(),
            CallStatus::Ended | CallStatus::Rejected
        ) {
            core.machine.reset();
            core.epoch += 1;
        }
        let session = CallSession {
            call_id: Some(call_id),
            room_name: Some(room_name),
            peer_id: caller_id,
            peer_name: caller_name,
        };
        match core.machine.begin_incoming(session) {
            Ok(()) => {
                core.epoch += 1;
                self.emit_state(&core);
            }
            Err(CallError::Busy) => {
                tracing::info!("Ignoring incoming call while another call is active");
            }
            Err(e) => tracing::warn!("Incoming call rejected: {}", e),
        }
    }

    async fn on_call_accepted(&self, call_id: Option<String>, room_name: Option<String>) {
        let mut core = self.core.lock().await;
        match core.machine.remote_accepted(call_id, room_name) {
            Ok(()) => self.emit_state(&core),
            Err(e) => tracing::debug!("Ignoring call_accepted: {}", e),
        }
    }

    /// Inbound offer: bring up the connection and media if this side has
    /// none yet, apply the remote description, drain buffered candidates,
    /// then answer.
    async fn on_offer(&self, room_name: String, offer: SessionDescription) {
        let needs_media = {
            let core = self.core.lock().await;
            if core.machine.is_idle() {
                tracing::debug!("Ignoring offer with no active call");
                return;
            }
            !core.adapter.is_active()
        };

        let stream = if needs_media {
            match self
                .devices
                .acquire(MediaConstraints {
                    video: true,
                    audio: true,
                })
                .await
            {
                Ok(stream) => Some(stream),
                Err(e) => {
                    tracing::warn!("Media acquisition failed while answering: {}", e);
                    let _ = self.events.send(CallEvent::MediaError(e.to_string()));
                    self.fail_active_call().await;
                    return;
                }
            }
        } else {
            None
        };

        let connection = {
            let mut core = self.core.lock().await;
            if core.machine.is_idle() {
                if let Some(stream) = stream {
                    stream.stop_all();
                }
                return;
            }
            if let Some(session) = core.machine.session_mut() {
                if session.room_name.is_none() {
                    session.room_name = Some(room_name.clone());
                }
            }
            if !core.adapter.is_active() {
                if let Err(e) = core
                    .adapter
                    .create(&self.stun_servers, self.peer_tx.clone())
                    .await
                {
                    tracing::warn!("Peer connection setup failed: {}", e);
                    if let Some(stream) = stream {
                        stream.stop_all();
                    }
                    return;
                }
                if let Some(stream) = stream {
                    let media = core.media;
                    if let Err(e) = core.adapter.adopt_stream(stream, &media).await {
                        drop(core);
                        let _ = self.events.send(CallEvent::MediaError(e.to_string()));
                        self.fail_active_call().await;
                        return;
                    }
                }
                if let Some(stream_id) = core.adapter.local_stream_id() {
                    let _ = self.events.send(CallEvent::LocalStreamReady { stream_id });
                }
            }
            match core.adapter.connection() {
                Some(connection) => connection,
                None => return,
            }
        };

        if let Err(e) = connection.set_remote_description(offer).await {
            // A malformed offer is dropped; it must not take the call down.
            tracing::warn!("Dropping malformed offer: {}", e);
            return;
        }

        let drained = {
            let mut core = self.core.lock().await;
            if core.machine.is_idle() {
                return;
            }
            core.negotiation.remote_description_set()
        };
        for candidate in drained {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                tracing::warn!("Skipping bad ICE candidate: {}", e);
            }
        }

        let answer = match connection.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!("Failed to create answer: {}", e);
                return;
            }
        };
        if let Err(e) = connection.set_local_description(answer.clone()).await {
            tracing::warn!("Failed to apply local answer: {}", e);
            return;
        }
        if let Err(e) = self.registry.send(
            &self.user_id,
            ClientMessage::Answer { room_name, answer },
        ) {
            tracing::warn!("Failed to send answer: {}", e);
        }
    }

    async fn on_answer(&self, answer: SessionDescription) {
        let connection = {
            let core = self.core.lock().await;
            if core.machine.is_idle() {
                tracing::debug!("Ignoring answer with no active call");
                return;
            }
            match core.adapter.connection() {
                Some(connection) => connection,
                None => {
                    tracing::warn!("Answer arrived before any offer was made");
                    return;
                }
            }
        };

        if let Err(e) = connection.set_remote_description(answer).await {
            tracing::warn!("Dropping malformed answer: {}", e);
            return;
        }

        let drained = {
            let mut core = self.core.lock().await;
            if core.machine.is_idle() {
                return;
            }
            core.negotiation.remote_description_set()
        };
        for candidate in drained {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                tracing::warn!("Skipping bad ICE candidate: {}", e);
            }
        }
    }

    async fn on_remote_candidate(&self, candidate: IceCandidate) {
        let apply = {
            let mut core = self.core.lock().await;
            if core.machine.is_idle() {
                tracing::debug!("Ignoring ICE candidate with no active call");
                return;
            }
            match core.negotiation.candidate_received(candidate) {
                CandidateDisposition::Apply(candidate) => {
                    Some((candidate, core.adapter.connection()))
                }
                CandidateDisposition::Queued => None,
            }
        };

        if let Some((candidate, connection)) = apply {
            match connection {
                Some(connection) => {
                    if let Err(e) = connection.add_ice_candidate(candidate).await {
                        tracing::warn!("Skipping bad ICE candidate: {}", e);
                    }
                }
                None => tracing::warn!("No peer connection to apply ICE candidate to"),
            }
        }
    }

    /// Remote ended or rejected: full local teardown, idempotent.
    async fn on_remote_terminated(&self, terminal: CallStatus) {
        let mut core = self.core.lock().await;
        if core.machine.is_idle() {
            return;
        }
        self.finish_call(&mut core, terminal).await;
    }

    async fn relay_local_candidate(&self, candidate: IceCandidate) {
        let room_name = {
            let core = self.core.lock().await;
            core.machine
                .session()
                .and_then(|session| session.room_name.clone())
        };
        match room_name {
            Some(room_name) => {
                if let Err(e) = self.registry.send(
                    &self.user_id,
                    ClientMessage::IceCandidate {
                        room_name,
                        candidate,
                    },
                ) {
                    tracing::warn!("Failed to relay local ICE candidate: {}", e);
                }
            }
            None => tracing::debug!("Dropping local ICE candidate with no room"),
        }
    }

    async fn on_peer_connection_state(&self, state: PeerConnectionState) {
        match state {
            PeerConnectionState::Connected => {
                // Media came up before signaling settled; promote the call.
                let mut core = self.core.lock().await;
                if core.machine.promote_connected() {
                    self.emit_state(&core);
                }
            }
            PeerConnectionState::Failed | PeerConnectionState::Disconnected => {
                let mut core = self.core.lock().await;
                if core.machine.is_idle() {
                    return;
                }
                tracing::warn!("Peer connection {:?}; tearing down the call", state);
                let _ = self.events.send(CallEvent::ConnectionFailed);
                self.finish_call(&mut core, CallStatus::Ended).await;
            }
            _ => {}
        }
    }

    /// A signaling drop mid-negotiation loses in-flight SDP/candidates, so
    /// the call cannot be resumed; a call with an established media path
    /// keeps running on it.
    ///
    /// A session can be `Connected` while negotiation is still in flight
    /// (a caller is marked connected on `call_accepted`, before the offer
    /// arrives), so connected sessions without a peer connection or without
    /// the remote description applied count as mid-negotiation too.
    async fn on_channel_disconnected(&self) {
        let mut core = self.core.lock().await;
        let mid_negotiation = match core.machine.status() {
            CallStatus::Calling | CallStatus::Ringing => true,
            CallStatus::Connected => {
                !core.adapter.is_active() || !core.negotiation.remote_description_is_set()
            }
            _ => false,
        };
        if mid_negotiation {
            tracing::warn!("Signaling dropped mid-negotiation; tearing down the call");
            self.finish_call(&mut core, CallStatus::Ended).await;
        }
    }

    /// Tear the call down into a terminal display state, then reset to idle
    /// after the display delay.
    async fn finish_call(&self, core: &mut CallCore, terminal: CallStatus) {
        core.negotiation.reset();
        core.adapter.teardown().await;
        if core.machine.finish(terminal).is_ok() {
            self.emit_state(core);
            self.schedule_idle_reset(core.epoch);
        }
    }

    /// Immediate teardown to idle with no display delay (fatal channel
    /// errors, aborted call attempts).
    async fn fail_active_call(&self) {
        let mut core = self.core.lock().await;
        core.negotiation.reset();
        core.adapter.teardown().await;
        if !core.machine.is_idle() {
            core.machine.reset();
            core.epoch += 1;
            self.emit_state(&core);
        }
    }

    fn schedule_idle_reset(&self, epoch: u64) {
        let Some(this) = self.weak.upgrade() else { return };
        tokio::spawn(async move {
            tokio::time::sleep(TERMINAL_DISPLAY_DELAY).await;
            let mut core = this.core.lock().await;
            // A newer session may have started; only reset our own.
            if core.epoch != epoch {
                return;
            }
            if matches!(
                core.machine.status(),
                CallStatus::Ended | CallStatus::Rejected
            ) {
                core.machine.reset();
                core.epoch += 1;
                this.emit_state(&core);
            }
        });
    }

    fn emit_state(&self, core: &CallCore) {
        let _ = self.events.send(CallEvent::StateChanged {
            status: core.machine.status(),
            session: core.machine.session().cloned(),
        });
    }

    fn emit_media_state(&self, core: &CallCore) {
        let _ = self.events.send(CallEvent::MediaStateChanged {
            video_enabled: core.media.video_enabled,
            audio_enabled: core.media.audio_enabled,
        });
    }
}
