//! Call state machine: one active call per local identity, driven only by
//! inbound signaling messages and local user actions.

use super::CallError;

/// Lifecycle status of the active call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Idle,
    /// Local-initiated, awaiting remote accept
    Calling,
    /// Remote-initiated, awaiting local accept/reject
    Ringing,
    Connected,
    Ended,
    Rejected,
}

/// Identifiers of the active call.
///
/// An outgoing call has no call id or room name until the server assigns
/// them (they arrive with `call_accepted` or the relayed `offer`).
#[derive(Debug, Clone)]
pub struct CallSession {
    pub call_id: Option<String>,
    pub room_name: Option<String>,
    pub peer_id: String,
    pub peer_name: Option<String>,
}

impl CallSession {
    /// Call id and room name, required for room-scoped actions.
    pub fn context(&self) -> Result<(String, String), CallError> {
        match (&self.call_id, &self.room_name) {
            (Some(call_id), Some(room)) => Ok((call_id.clone(), room.clone())),
            _ => Err(CallError::MissingCallContext),
        }
    }
}

/// The single active call's status plus its session identifiers.
///
/// Transitions validate the source state and reject misuse with a
/// descriptive error; they never panic. Timers (the terminal-state display
/// delay) live in the orchestrator, keeping this type synchronous and
/// directly testable.
#[derive(Debug, Default)]
pub struct CallStateMachine {
    status: Option<(CallStatus, CallSession)>,
}

impl CallStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> CallStatus {
        self.status
            .as_ref()
            .map(|(s, _)| *s)
            .unwrap_or(CallStatus::Idle)
    }

    pub fn session(&self) -> Option<&CallSession> {
        self.status.as_ref().map(|(_, s)| s)
    }

    pub fn session_mut(&mut self) -> Option<&mut CallSession> {
        self.status.as_mut().map(|(_, s)| s)
    }

    pub fn is_idle(&self) -> bool {
        self.status.is_none()
    }

    /// idle → calling (local user dials `callee_id`)
    pub fn begin_outgoing(&mut self, callee_id: &str) -> Result<(), CallError> {
        self.require(CallStatus::Idle, "initiate a call")?;
        self.status = Some((
            CallStatus::Calling,
            CallSession {
                call_id: None,
                room_name: None,
                peer_id: callee_id.to_string(),
                peer_name: None,
            },
        ));
        Ok(())
    }

    /// idle → ringing (inbound `incoming_call`); `Busy` when any call is
    /// already active, so a second incoming call never overwrites the first.
    pub fn begin_incoming(&mut self, session: CallSession) -> Result<(), CallError> {
        if self.status.is_some() {
            return Err(CallError::Busy);
        }
        self.status = Some((CallStatus::Ringing, session));
        Ok(())
    }

    /// calling → connected (inbound `call_accepted`)
    pub fn remote_accepted(
        &mut self,
        call_id: Option<String>,
        room_name: Option<String>,
    ) -> Result<(), CallError> {
        self.require(CallStatus::Calling, "mark the call accepted")?;
        if let Some((status, session)) = self.status.as_mut() {
            *status = CallStatus::Connected;
            if call_id.is_some() {
                session.call_id = call_id;
            }
            if room_name.is_some() {
                session.room_name = room_name;
            }
        }
        Ok(())
    }

    /// ringing → connected (local accept finished)
    pub fn local_accepted(&mut self) -> Result<(), CallError> {
        self.require(CallStatus::Ringing, "accept the call")?;
        if let Some((status, _)) = self.status.as_mut() {
            *status = CallStatus::Connected;
        }
        Ok(())
    }

    /// The media path reported `connected` before signaling settled; promote
    /// a calling/ringing session. No-op when already connected.
    pub fn promote_connected(&mut self) -> bool {
        match self.status.as_mut() {
            Some((status @ (CallStatus::Calling | CallStatus::Ringing), _)) => {
                *status = CallStatus::Connected;
                true
            }
            _ => false,
        }
    }

    /// Move a non-idle call to a terminal display state (ended/rejected).
    /// Idempotent for an already-terminal call.
    pub fn finish(&mut self, terminal: CallStatus) -> Result<(), CallError> {
        debug_assert!(matches!(terminal, CallStatus::Ended | CallStatus::Rejected));
        match self.status.as_mut() {
            Some((status, _)) => {
                *status = terminal;
                Ok(())
            }
            None => Err(CallError::InvalidState {
                action: "finish the call",
                status: CallStatus::Idle,
            }),
        }
    }

    /// Any state → idle, immediately. Used on explicit reset, after the
    /// terminal display delay, and on fatal channel errors.
    pub fn reset(&mut self) {
        self.status = None;
    }

    fn require(&self, expected: CallStatus, action: &'static str) -> Result<(), CallError> {
        let status = self.status();
        if status != expected {
            return Err(CallError::InvalidState { action, status });
        }
        Ok(())
    }
}
