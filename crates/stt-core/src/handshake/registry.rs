//! Registry of in-flight handshakes.
//!
//! Multiple handshakes may be in flight at once. Handshake frames carry a
//! zeroed header session id, so routing keys on the peer address: responder
//! state machines live here until promoted or expired, and initiator
//! exchanges register a channel that inbound CHALLENGE/FINAL frames are
//! forwarded through, so the dispatcher and `connect` never race on the
//! socket.

use super::ResponderHandshake;
use crate::frame::Frame;
use crate::session::TransportKind;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;

/// Initiator reply channel depth: a CHALLENGE and a FINAL, plus slack for a
/// duplicated datagram.
const INITIATOR_QUEUE_DEPTH: usize = 4;

/// A responder-side handshake awaiting its AUTH_PROOF
pub struct PendingResponder {
    /// The responder state machine
    pub handshake: ResponderHandshake,
    /// Transport the HELLO arrived on
    pub transport_kind: TransportKind,
    /// When this exchange expires
    pub deadline: Instant,
}

/// In-flight handshake registry, keyed by peer address.
#[derive(Default)]
pub struct HandshakeRegistry {
    responders: DashMap<SocketAddr, PendingResponder>,
    initiators: DashMap<SocketAddr, mpsc::Sender<Frame>>,
}

impl HandshakeRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an initiator exchange and get the channel its inbound
    /// handshake frames will be forwarded through.
    pub fn register_initiator(&self, peer: SocketAddr) -> mpsc::Receiver<Frame> {
        let (tx, rx) = mpsc::channel(INITIATOR_QUEUE_DEPTH);
        self.initiators.insert(peer, tx);
        rx
    }

    /// Drop an initiator registration
    pub fn remove_initiator(&self, peer: SocketAddr) {
        self.initiators.remove(&peer);
    }

    /// Forward an inbound handshake frame to a registered initiator.
    ///
    /// Returns false if no initiator is waiting on this peer or its queue
    /// is full; the caller drops the frame.
    pub fn route_to_initiator(&self, peer: SocketAddr, frame: Frame) -> bool {
        match self.initiators.get(&peer) {
            Some(tx) => tx.try_send(frame).is_ok(),
            None => false,
        }
    }

    /// Park a responder handshake until its proof arrives or the deadline
    /// passes. A replacement (e.g. a retried HELLO) supersedes the old
    /// entry.
    pub fn insert_responder(
        &self,
        peer: SocketAddr,
        handshake: ResponderHandshake,
        transport_kind: TransportKind,
        deadline: Instant,
    ) {
        self.responders.insert(
            peer,
            PendingResponder {
                handshake,
                transport_kind,
                deadline,
            },
        );
    }

    /// Take the responder entry for a peer, if any. Proof processing is
    /// single-shot: failures drop the exchange.
    pub fn take_responder(&self, peer: SocketAddr) -> Option<PendingResponder> {
        self.responders.remove(&peer).map(|(_, entry)| entry)
    }

    /// Whether a responder exchange is pending for this peer
    #[must_use]
    pub fn has_responder(&self, peer: SocketAddr) -> bool {
        self.responders.contains_key(&peer)
    }

    /// Drop expired responder entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.responders.len();
        self.responders.retain(|peer, entry| {
            let keep = entry.deadline > now;
            if !keep {
                tracing::debug!("handshake with {} expired", peer);
            }
            keep
        });
        before - self.responders.len()
    }

    /// Number of in-flight handshakes (both roles)
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.responders.len() + self.initiators.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameType;
    use crate::handshake::InitiatorHandshake;
    use crate::session::SessionId;
    use std::time::Duration;
    use stt_crypto::TransmissionCrypto;

    fn responder_entry() -> ResponderHandshake {
        let crypto = TransmissionCrypto::new(&[0x42; 32]).unwrap();
        let node_id_i = crypto.derive_node_id(&[0xAA; 32]);
        let node_id_r = crypto.derive_node_id(&[0xBB; 32]);
        let (_initiator, hello) = InitiatorHandshake::start(&crypto, node_id_i).unwrap();
        let (responder, _challenge) =
            ResponderHandshake::respond(&crypto, node_id_r, &hello).unwrap();
        responder
    }

    #[test]
    fn test_initiator_routing() {
        let registry = HandshakeRegistry::new();
        let peer: SocketAddr = "127.0.0.1:9000".parse().unwrap();

        let mut rx = registry.register_initiator(peer);
        assert_eq!(registry.in_flight(), 1);

        let frame = Frame::new(FrameType::Challenge, SessionId::ZERO);
        assert!(registry.route_to_initiator(peer, frame));
        assert!(rx.try_recv().is_ok());

        registry.remove_initiator(peer);
        let frame = Frame::new(FrameType::Challenge, SessionId::ZERO);
        assert!(!registry.route_to_initiator(peer, frame));
        assert_eq!(registry.in_flight(), 0);
    }

    #[test]
    fn test_route_to_unknown_peer() {
        let registry = HandshakeRegistry::new();
        let frame = Frame::new(FrameType::Confirm, SessionId::ZERO);
        assert!(!registry.route_to_initiator("127.0.0.1:1".parse().unwrap(), frame));
    }

    #[test]
    fn test_responder_lifecycle() {
        let registry = HandshakeRegistry::new();
        let peer: SocketAddr = "127.0.0.1:9001".parse().unwrap();

        registry.insert_responder(
            peer,
            responder_entry(),
            TransportKind::Datagram,
            Instant::now() + Duration::from_secs(10),
        );
        assert!(registry.has_responder(peer));

        let entry = registry.take_responder(peer).unwrap();
        assert_eq!(entry.transport_kind, TransportKind::Datagram);
        assert!(!registry.has_responder(peer));
        assert!(registry.take_responder(peer).is_none());
    }

    #[test]
    fn test_purge_expired() {
        let registry = HandshakeRegistry::new();
        let expired: SocketAddr = "127.0.0.1:9002".parse().unwrap();
        let live: SocketAddr = "127.0.0.1:9003".parse().unwrap();

        registry.insert_responder(
            expired,
            responder_entry(),
            TransportKind::Datagram,
            Instant::now() - Duration::from_secs(1),
        );
        registry.insert_responder(
            live,
            responder_entry(),
            TransportKind::Datagram,
            Instant::now() + Duration::from_secs(10),
        );

        assert_eq!(registry.purge_expired(), 1);
        assert!(!registry.has_responder(expired));
        assert!(registry.has_responder(live));
    }
}
