//! ICE candidate buffering for one call.
//!
//! Candidates may be relayed before the offer/answer they belong to has been
//! applied locally. The buffer queues them until the remote description is
//! set, then releases them once, in arrival order; afterwards candidates
//! pass straight through. The queue is never reused within a session.

use crate::signaling::IceCandidate;

/// What to do with a candidate that just arrived.
#[derive(Debug, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Remote description already applied; apply the candidate now.
    Apply(IceCandidate),
    /// Remote description still pending; the candidate was queued.
    Queued,
}

#[derive(Debug, Default)]
pub struct NegotiationBuffer {
    queue: Vec<IceCandidate>,
    remote_description_set: bool,
}

impl NegotiationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remote_description_is_set(&self) -> bool {
        self.remote_description_set
    }

    /// Record an inbound candidate, preserving arrival order.
    pub fn candidate_received(&mut self, candidate: IceCandidate) -> CandidateDisposition {
        if self.remote_description_set {
            CandidateDisposition::Apply(candidate)
        } else {
            self.queue.push(candidate);
            CandidateDisposition::Queued
        }
    }

    /// The remote description was just applied: flip the flag and drain the
    /// queue in FIFO order. A second call yields nothing; the queue is
    /// retired for the rest of the session.
    pub fn remote_description_set(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        std::mem::take(&mut self.queue)
    }

    /// Unconditional teardown, including abnormal call endings, so a stale
    /// queue never leaks into the next call.
    pub fn reset(&mut self) {
        self.queue.clear();
        self.remote_description_set = false;
    }
}
