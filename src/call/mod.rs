//! Call lifecycle: state machine, ICE negotiation buffering, the peer
//! connection adapter, and the orchestrator that ties them to signaling.

pub mod negotiation;
pub mod orchestrator;
pub mod peer;
pub mod state;

use thiserror::Error;

use crate::signaling::ChannelError;
use state::CallStatus;

/// Errors returned from direct call actions (`initiate`, `accept`, ...).
///
/// Asynchronous failures discovered outside any caller's await (peer
/// connection loss, channel auth errors) surface as
/// [`orchestrator::CallEvent`]s instead.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("cannot {action}: call is {status:?}")]
    InvalidState {
        action: &'static str,
        status: CallStatus,
    },
    #[error("another call is already active")]
    Busy,
    #[error("call is missing its call id or room name")]
    MissingCallContext,
    #[error("call attempt was aborted before completing")]
    Aborted,
    #[error("media acquisition failed: {0}")]
    Media(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("signaling channel: {0}")]
    Channel(#[from] ChannelError),
}

/// Local media preference; persists across calls.
#[derive(Debug, Clone, Copy)]
pub struct MediaState {
    pub video_enabled: bool,
    pub audio_enabled: bool,
}

impl Default for MediaState {
    fn default() -> Self {
        Self {
            video_enabled: true,
            audio_enabled: true,
        }
    }
}
