//! Per-peer negotiation state machine
//!
//! One [`NegotiationSession`] exists per (local, remote) pair, held in a map
//! owned by the endpoint — never shared, never a closure. The session does
//! no I/O: every input returns the [`SessionAction`]s to perform, which the
//! endpoint executes against its [`crate::transport::PeerConnector`] and the
//! relay socket. Stale messages (an offer while already negotiating, an
//! answer nobody is waiting for) are dropped without a state change.
//!
//! Candidates routinely race ahead of the answer across the relay, so a
//! candidate that arrives before the remote description is buffered and
//! flushed, in arrival order, the instant the description is applied.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, warn};

use crate::transport::{Candidate, Description};

/// Negotiation payload carried opaquely inside relay `signal` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer { description: Description },
    Answer { description: Description },
    Candidate { candidate: Candidate },
    Cancel,
}

/// Session lifecycle. `Closed` is terminal and reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No exchange started.
    Idle,
    /// We asked the transport for a local offer.
    Offering,
    /// Offer relayed, waiting for the peer's answer.
    AwaitingAnswer,
    /// Peer's offer received, being applied.
    Offered,
    /// Remote offer applied, producing our answer.
    Answering,
    /// Both descriptions committed; the direct channel is usable.
    Connected,
    /// Torn down by cancel, disconnect or transport failure.
    Closed,
}

/// What the owner must do next. Actions are executed in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Ask the connector for an outbound link and a local offer.
    CreateOffer,
    /// Ask the connector to apply the peer's offer and produce an answer.
    AcceptOffer(Description),
    /// Ask the connector to complete the link with the peer's answer.
    ApplyAnswer(Description),
    /// Feed one candidate to the connector.
    ApplyCandidate(Candidate),
    /// Relay a payload to the peer.
    SendSignal(SignalPayload),
    /// Release the link and everything riding on it.
    Close,
}

pub struct NegotiationSession {
    peer_id: String,
    state: SessionState,
    remote_described: bool,
    pending_candidates: VecDeque<Candidate>,
}

impl NegotiationSession {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            state: SessionState::Idle,
            remote_described: false,
            pending_candidates: VecDeque::new(),
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Start negotiating with the peer. A no-op unless `Idle`: one session
    /// per peer, never two simultaneous exchanges.
    pub fn initiate(&mut self) -> Vec<SessionAction> {
        if self.state != SessionState::Idle {
            warn!(
                "ignoring initiate to {} while {:?}",
                self.peer_id, self.state
            );
            return Vec::new();
        }
        self.state = SessionState::Offering;
        vec![SessionAction::CreateOffer]
    }

    /// The connector produced our local offer.
    pub fn local_offer_ready(&mut self, offer: Description) -> Vec<SessionAction> {
        if self.state != SessionState::Offering {
            debug!(
                "dropping local offer for {} while {:?}",
                self.peer_id, self.state
            );
            return Vec::new();
        }
        self.state = SessionState::AwaitingAnswer;
        vec![SessionAction::SendSignal(SignalPayload::Offer {
            description: offer,
        })]
    }

    /// The connector applied the remote offer; candidates may flow now.
    pub fn remote_offer_applied(&mut self) -> Vec<SessionAction> {
        if self.state != SessionState::Offered {
            return Vec::new();
        }
        self.state = SessionState::Answering;
        self.remote_described = true;
        self.flush_candidates()
    }

    /// The connector produced our local answer: the exchange is committed on
    /// both sides and the session is connected.
    pub fn local_answer_ready(&mut self, answer: Description) -> Vec<SessionAction> {
        if self.state != SessionState::Answering {
            debug!(
                "dropping local answer for {} while {:?}",
                self.peer_id, self.state
            );
            return Vec::new();
        }
        self.state = SessionState::Connected;
        vec![SessionAction::SendSignal(SignalPayload::Answer {
            description: answer,
        })]
    }

    /// Route one relayed payload from this peer.
    pub fn handle_signal(&mut self, payload: SignalPayload) -> Vec<SessionAction> {
        match payload {
            SignalPayload::Offer { description } => self.on_offer(description),
            SignalPayload::Answer { description } => self.on_answer(description),
            SignalPayload::Candidate { candidate } => self.on_candidate(candidate),
            SignalPayload::Cancel => self.on_cancel(),
        }
    }

    /// An offer is only acceptable while `Idle`; anything else means we are
    /// already negotiating with this peer and the frame is stale.
    fn on_offer(&mut self, offer: Description) -> Vec<SessionAction> {
        if self.state != SessionState::Idle {
            debug!(
                "dropping stale offer from {} while {:?}",
                self.peer_id, self.state
            );
            return Vec::new();
        }
        self.state = SessionState::Offered;
        vec![SessionAction::AcceptOffer(offer)]
    }

    /// An answer is only meaningful while we wait for one.
    fn on_answer(&mut self, answer: Description) -> Vec<SessionAction> {
        if self.state != SessionState::AwaitingAnswer {
            debug!(
                "dropping stale answer from {} while {:?}",
                self.peer_id, self.state
            );
            return Vec::new();
        }
        self.state = SessionState::Connected;
        self.remote_described = true;
        let mut actions = vec![SessionAction::ApplyAnswer(answer)];
        actions.extend(self.flush_candidates());
        actions
    }

    /// Candidates apply immediately once the remote description is set;
    /// until then they queue FIFO.
    fn on_candidate(&mut self, candidate: Candidate) -> Vec<SessionAction> {
        if self.state == SessionState::Closed {
            debug!("dropping candidate from {} after close", self.peer_id);
            return Vec::new();
        }
        if self.remote_described {
            vec![SessionAction::ApplyCandidate(candidate)]
        } else {
            self.pending_candidates.push_back(candidate);
            Vec::new()
        }
    }

    fn on_cancel(&mut self) -> Vec<SessionAction> {
        self.close("cancelled by peer")
    }

    /// The underlying transport reported disconnected, failed or closed.
    pub fn transport_closed(&mut self) -> Vec<SessionAction> {
        self.close("transport closed")
    }

    /// Locally-initiated teardown.
    pub fn cancel(&mut self) -> Vec<SessionAction> {
        self.close("cancelled locally")
    }

    fn close(&mut self, reason: &str) -> Vec<SessionAction> {
        if self.state == SessionState::Closed {
            return Vec::new();
        }
        debug!("session with {} closed: {}", self.peer_id, reason);
        self.state = SessionState::Closed;
        self.pending_candidates.clear();
        vec![SessionAction::Close]
    }

    fn flush_candidates(&mut self) -> Vec<SessionAction> {
        self.pending_candidates
            .drain(..)
            .map(SessionAction::ApplyCandidate)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(s: &str) -> Description {
        Description(s.to_string())
    }

    fn cand(s: &str) -> Candidate {
        Candidate(s.to_string())
    }

    #[test]
    fn test_initiator_happy_path() {
        let mut s = NegotiationSession::new("bob");
        assert_eq!(s.initiate(), vec![SessionAction::CreateOffer]);
        assert_eq!(s.state(), SessionState::Offering);

        let actions = s.local_offer_ready(desc("offer"));
        assert_eq!(
            actions,
            vec![SessionAction::SendSignal(SignalPayload::Offer {
                description: desc("offer")
            })]
        );
        assert_eq!(s.state(), SessionState::AwaitingAnswer);

        let actions = s.handle_signal(SignalPayload::Answer {
            description: desc("answer"),
        });
        assert_eq!(actions, vec![SessionAction::ApplyAnswer(desc("answer"))]);
        assert!(s.is_connected());
    }

    #[test]
    fn test_responder_happy_path() {
        let mut s = NegotiationSession::new("alice");
        let actions = s.handle_signal(SignalPayload::Offer {
            description: desc("offer"),
        });
        assert_eq!(actions, vec![SessionAction::AcceptOffer(desc("offer"))]);
        assert_eq!(s.state(), SessionState::Offered);

        assert!(s.remote_offer_applied().is_empty());
        assert_eq!(s.state(), SessionState::Answering);

        let actions = s.local_answer_ready(desc("answer"));
        assert_eq!(
            actions,
            vec![SessionAction::SendSignal(SignalPayload::Answer {
                description: desc("answer")
            })]
        );
        assert!(s.is_connected());
    }

    #[test]
    fn test_second_initiate_is_a_noop() {
        let mut s = NegotiationSession::new("bob");
        s.initiate();
        assert!(s.initiate().is_empty());
        assert_eq!(s.state(), SessionState::Offering);

        s.local_offer_ready(desc("offer"));
        assert!(s.initiate().is_empty());
        assert_eq!(s.state(), SessionState::AwaitingAnswer);
    }

    #[test]
    fn test_stale_offer_is_dropped() {
        let mut s = NegotiationSession::new("bob");
        s.initiate();
        s.local_offer_ready(desc("offer"));
        // already negotiating: an inbound offer is a stale duplicate
        let actions = s.handle_signal(SignalPayload::Offer {
            description: desc("their-offer"),
        });
        assert!(actions.is_empty());
        assert_eq!(s.state(), SessionState::AwaitingAnswer);
    }

    #[test]
    fn test_stale_answer_does_not_change_state() {
        let mut s = NegotiationSession::new("bob");
        let actions = s.handle_signal(SignalPayload::Answer {
            description: desc("answer"),
        });
        assert!(actions.is_empty());
        assert_eq!(s.state(), SessionState::Idle);

        // a second answer after connecting is equally dead
        s.initiate();
        s.local_offer_ready(desc("offer"));
        s.handle_signal(SignalPayload::Answer {
            description: desc("answer"),
        });
        assert!(s
            .handle_signal(SignalPayload::Answer {
                description: desc("answer-again"),
            })
            .is_empty());
        assert!(s.is_connected());
    }

    #[test]
    fn test_candidates_buffer_until_answer_then_flush_in_order() {
        let mut s = NegotiationSession::new("bob");
        s.initiate();
        s.local_offer_ready(desc("offer"));

        for i in 0..3 {
            let actions = s.handle_signal(SignalPayload::Candidate {
                candidate: cand(&format!("c{}", i)),
            });
            assert!(actions.is_empty(), "candidate must buffer before answer");
        }

        let actions = s.handle_signal(SignalPayload::Answer {
            description: desc("answer"),
        });
        assert_eq!(
            actions,
            vec![
                SessionAction::ApplyAnswer(desc("answer")),
                SessionAction::ApplyCandidate(cand("c0")),
                SessionAction::ApplyCandidate(cand("c1")),
                SessionAction::ApplyCandidate(cand("c2")),
            ]
        );

        // once described, candidates apply immediately
        let actions = s.handle_signal(SignalPayload::Candidate {
            candidate: cand("late"),
        });
        assert_eq!(actions, vec![SessionAction::ApplyCandidate(cand("late"))]);
    }

    #[test]
    fn test_responder_candidates_flush_when_offer_applied() {
        let mut s = NegotiationSession::new("alice");
        s.handle_signal(SignalPayload::Candidate {
            candidate: cand("early"),
        });
        s.handle_signal(SignalPayload::Offer {
            description: desc("offer"),
        });
        let actions = s.remote_offer_applied();
        assert_eq!(actions, vec![SessionAction::ApplyCandidate(cand("early"))]);
    }

    #[test]
    fn test_cancel_reaches_closed_from_any_state() {
        let mut s = NegotiationSession::new("bob");
        assert_eq!(s.handle_signal(SignalPayload::Cancel), vec![SessionAction::Close]);
        assert!(s.is_closed());
        // terminal: further inputs are inert
        assert!(s.handle_signal(SignalPayload::Cancel).is_empty());
        assert!(s
            .handle_signal(SignalPayload::Offer {
                description: desc("offer")
            })
            .is_empty());
        assert!(s
            .handle_signal(SignalPayload::Candidate {
                candidate: cand("c")
            })
            .is_empty());
        assert!(s.initiate().is_empty());

        let mut s = NegotiationSession::new("bob");
        s.initiate();
        s.local_offer_ready(desc("offer"));
        assert_eq!(s.transport_closed(), vec![SessionAction::Close]);
        assert!(s.is_closed());

        let mut s = NegotiationSession::new("bob");
        assert_eq!(s.cancel(), vec![SessionAction::Close]);
        assert!(s.is_closed());
    }

    #[test]
    fn test_close_releases_buffered_candidates() {
        let mut s = NegotiationSession::new("bob");
        s.initiate();
        s.local_offer_ready(desc("offer"));
        s.handle_signal(SignalPayload::Candidate {
            candidate: cand("c0"),
        });
        s.handle_signal(SignalPayload::Cancel);
        assert!(s.pending_candidates.is_empty());
    }

    #[test]
    fn test_signal_payload_wire_shape() {
        let json = serde_json::to_string(&SignalPayload::Offer {
            description: desc("sdp"),
        })
        .unwrap();
        assert_eq!(json, r#"{"kind":"offer","description":"sdp"}"#);
        let json = serde_json::to_string(&SignalPayload::Cancel).unwrap();
        assert_eq!(json, r#"{"kind":"cancel"}"#);
    }
}
