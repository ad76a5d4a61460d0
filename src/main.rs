//! Telecare call client
//!
//! Signaling and call-lifecycle client for the Telecare telemedicine app.

mod auth;
mod call;
mod config;
mod signaling;
#[cfg(test)]
mod testutil;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use call::orchestrator::{CallEvent, CallOrchestrator};
use call::peer::{
    LocalMediaStream, MediaConstraints, MediaDevices, MediaTrack, PeerConnectionState, PeerEvent,
    RtcEngine, RtcError, RtcPeerConnection, TrackKind,
};
use call::state::CallStatus;
use config::{ChannelTuning, Config, FileCredentials};
use signaling::channel::SignalingRegistry;
use signaling::socket::WsConnector;
use signaling::{IceCandidate, SessionDescription};

#[derive(Parser)]
#[command(name = "telecare-call")]
#[command(about = "Video-call signaling client for Telecare", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a bearer token for signaling authentication
    Login {
        /// Bearer token issued by the Telecare backend
        token: String,

        /// Token lifetime in seconds (omit for no local expiry tracking)
        #[arg(short, long)]
        expires_in: Option<u64>,
    },

    /// Clear the stored credential
    Logout,

    /// Show credential and configuration status
    Status,

    /// Connect the signaling channel and wait for incoming calls
    Listen {
        /// Local user id registered with the signaling server
        user_id: String,

        /// Accept incoming calls automatically (signaling smoke test)
        #[arg(long)]
        auto_accept: bool,
    },

    /// Place a call to another user
    Call {
        /// Local user id registered with the signaling server
        user_id: String,

        /// User id to call
        callee_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Login { token, expires_in } => {
            let mut config = Config::load()?;
            config.set_token(token, expires_in);
            config.save()?;
            println!("Token stored.");
        }
        Commands::Logout => {
            let mut config = Config::load()?;
            config.token = None;
            config.save()?;
            println!("Credential cleared.");
        }
        Commands::Status => {
            let config = Config::load()?;
            println!("Signaling URL: {}", config.signaling_url);
            match &config.token {
                Some(token) if token.is_expired() => println!("Token: stored, but expired"),
                Some(_) => println!("Token: stored"),
                None => println!("Token: none (run `login` first)"),
            }
        }
        Commands::Listen {
            user_id,
            auto_accept,
        } => {
            run_session(&user_id, None, auto_accept).await?;
        }
        Commands::Call { user_id, callee_id } => {
            run_session(&user_id, Some(&callee_id), false).await?;
        }
    }

    Ok(())
}

/// Connect signaling for `user_id`, optionally dial `callee_id`, and print
/// call events until the session ends or Ctrl-C.
async fn run_session(user_id: &str, callee_id: Option<&str>, auto_accept: bool) -> Result<()> {
    let config = Config::load()?;
    let registry = SignalingRegistry::new(
        config.signaling_url.clone(),
        Arc::new(WsConnector),
        Arc::new(FileCredentials),
        ChannelTuning::default(),
    );
    let orchestrator = CallOrchestrator::spawn(
        user_id,
        registry.clone(),
        Arc::new(NullEngine),
        Arc::new(NullDevices),
        config.stun_servers.clone(),
    );
    let mut events = orchestrator.subscribe();

    registry
        .connect(user_id)
        .await
        .context("Failed to connect the signaling channel")?;

    if let Some(callee_id) = callee_id {
        orchestrator.initiate_call(callee_id).await?;
        println!("Calling {}...", callee_id);
    } else {
        println!("Listening for calls as {} (Ctrl-C to quit)", user_id);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down.");
                break;
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(_) => break,
                };
                match event {
                    CallEvent::StateChanged { status, session } => {
                        let peer = session
                            .as_ref()
                            .map(|s| s.peer_id.clone())
                            .unwrap_or_default();
                        match status {
                            CallStatus::Ringing => {
                                println!("Incoming call from {}", peer);
                                if auto_accept {
                                    orchestrator.accept_call().await?;
                                }
                            }
                            CallStatus::Connected => println!("Call connected with {}", peer),
                            CallStatus::Ended => println!("Call ended"),
                            CallStatus::Rejected => println!("Call rejected"),
                            CallStatus::Calling => {}
                            CallStatus::Idle => {
                                // A dialed session that returned to idle is over.
                                if callee_id.is_some() {
                                    break;
                                }
                            }
                        }
                    }
                    CallEvent::MediaError(msg) => println!("Media error: {}", msg),
                    CallEvent::ConnectionFailed => println!("Media connection failed"),
                    CallEvent::ChannelAuthError => {
                        println!("Signaling authentication failed; run `login` again");
                        break;
                    }
                    CallEvent::ChannelServerError => println!("Signaling server error"),
                    CallEvent::ChannelRetriesExhausted => {
                        println!("Signaling reconnection gave up");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    registry.close(None);
    Ok(())
}

// ---------------------------------------------------------------------------
// Placeholder RTC stack: exchanges placeholder SDP so the signaling flow can
// be exercised end to end against a dev server without a real media engine.
// ---------------------------------------------------------------------------

struct NullTrack {
    kind: TrackKind,
}

impl MediaTrack for NullTrack {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    // No real device behind the track.
    fn set_enabled(&self, _enabled: bool) {}

    fn stop(&self) {}
}

struct NullDevices;

#[async_trait]
impl MediaDevices for NullDevices {
    async fn acquire(&self, constraints: MediaConstraints) -> Result<LocalMediaStream, RtcError> {
        let mut tracks: Vec<Arc<dyn MediaTrack>> = Vec::new();
        if constraints.audio {
            tracks.push(Arc::new(NullTrack {
                kind: TrackKind::Audio,
            }));
        }
        if constraints.video {
            tracks.push(Arc::new(NullTrack {
                kind: TrackKind::Video,
            }));
        }
        Ok(LocalMediaStream {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        })
    }
}

struct NullConnection {
    session_id: String,
    events: mpsc::UnboundedSender<PeerEvent>,
}

impl NullConnection {
    fn placeholder_sdp(&self, kind: &str) -> SessionDescription {
        SessionDescription {
            sdp_type: kind.to_string(),
            sdp: format!("v=0\r\no=- {} 0 IN IP4 0.0.0.0\r\ns=-\r\n", self.session_id),
        }
    }
}

#[async_trait]
impl RtcPeerConnection for NullConnection {
    fn add_track(&self, _track: Arc<dyn MediaTrack>) -> Result<(), RtcError> {
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        Ok(self.placeholder_sdp("offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        Ok(self.placeholder_sdp("answer"))
    }

    async fn set_local_description(&self, _desc: SessionDescription) -> Result<(), RtcError> {
        Ok(())
    }

    async fn set_remote_description(&self, _desc: SessionDescription) -> Result<(), RtcError> {
        // Both descriptions exchanged; report the "media" path as up so the
        // call promotes to connected.
        let _ = self
            .events
            .send(PeerEvent::ConnectionState(PeerConnectionState::Connected));
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), RtcError> {
        Ok(())
    }

    async fn close(&self) {
        let _ = self
            .events
            .send(PeerEvent::ConnectionState(PeerConnectionState::Closed));
    }
}

struct NullEngine;

#[async_trait]
impl RtcEngine for NullEngine {
    async fn create_peer_connection(
        &self,
        _ice_servers: &[String],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn RtcPeerConnection>, RtcError> {
        Ok(Arc::new(NullConnection {
            session_id: uuid::Uuid::new_v4().simple().to_string(),
            events,
        }))
    }
}
