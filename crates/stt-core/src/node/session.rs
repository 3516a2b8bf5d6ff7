//! Runtime handles around sessions and streams.
//!
//! The registries are the ownership roots: the node's [`SessionRegistry`]
//! exclusively owns every [`SessionHandle`], and each handle exclusively
//! owns its stream table. Locks guard only short, non-awaiting sections;
//! the per-stream send path serializes on an async mutex so sequence
//! assignment matches on-wire order.

use crate::session::{Session, SessionId, SessionState, TransportKind};
use crate::stream::{Stream, StreamMode};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// A stream plus its runtime machinery.
pub struct StreamHandle {
    /// Stream id within the session
    pub stream_id: u64,
    /// Stream state machine; never held across an await
    pub(crate) state: Mutex<Stream>,
    /// Serializes the send path so sequence order equals send order
    pub(crate) send_lock: tokio::sync::Mutex<()>,
    /// Flow-control credits; one permit per in-flight segment
    pub(crate) credits: Arc<Semaphore>,
}

impl StreamHandle {
    pub(crate) fn new(stream: Stream, initial_credits: usize) -> Self {
        Self {
            stream_id: stream.stream_id(),
            state: Mutex::new(stream),
            send_lock: tokio::sync::Mutex::new(()),
            credits: Arc::new(Semaphore::new(initial_credits)),
        }
    }

    /// Run a closure against the stream state
    pub(crate) fn with_stream<R>(&self, f: impl FnOnce(&mut Stream) -> R) -> R {
        let mut stream = self.state.lock().expect("stream lock poisoned");
        f(&mut stream)
    }

    /// Close the stream and wake any sender blocked on credits.
    pub(crate) fn close(&self) {
        self.with_stream(Stream::finish_close);
        self.credits.close();
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> crate::stream::StreamStats {
        self.with_stream(|s| s.stats())
    }
}

/// A session plus its stream table.
pub struct SessionHandle {
    /// Session id
    pub session_id: SessionId,
    pub(crate) session: Mutex<Session>,
    pub(crate) streams: DashMap<u64, Arc<StreamHandle>>,
    next_stream_id: AtomicU64,
}

impl SessionHandle {
    pub(crate) fn new(session: Session) -> Self {
        Self {
            session_id: session.session_id(),
            session: Mutex::new(session),
            streams: DashMap::new(),
            next_stream_id: AtomicU64::new(1),
        }
    }

    /// Run a closure against the session state
    pub(crate) fn with_session<R>(&self, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut session = self.session.lock().expect("session lock poisoned");
        f(&mut session)
    }

    /// Peer address
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.with_session(|s| s.peer_addr())
    }

    /// Transport carrying this session
    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        self.with_session(|s| s.transport_kind())
    }

    /// Peer node id
    #[must_use]
    pub fn peer_node_id(&self) -> [u8; 32] {
        self.with_session(|s| *s.peer_node_id())
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.with_session(|s| s.state())
    }

    /// Allocate a locally unique stream id. Stream id 0 is reserved for
    /// session-level control.
    pub(crate) fn allocate_stream_id(&self) -> u64 {
        self.next_stream_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Look up a stream
    pub(crate) fn stream(&self, stream_id: u64) -> Option<Arc<StreamHandle>> {
        self.streams.get(&stream_id).map(|entry| Arc::clone(entry.value()))
    }

    /// Look up a stream, creating it in the `Open` state if absent.
    /// Implicit creation on inbound DATA for an unknown id is allowed.
    pub(crate) fn stream_or_open(
        &self,
        stream_id: u64,
        mode: StreamMode,
        reorder_limit: u64,
        initial_credits: usize,
    ) -> Arc<StreamHandle> {
        let entry = self.streams.entry(stream_id).or_insert_with(|| {
            tracing::debug!(
                session = %self.session_id,
                "opening stream {} ({:?})",
                stream_id,
                mode
            );
            Arc::new(StreamHandle::new(
                Stream::new(stream_id, self.session_id, mode, reorder_limit),
                initial_credits,
            ))
        });
        Arc::clone(entry.value())
    }

    /// All streams of this session
    pub(crate) fn stream_handles(&self) -> Vec<Arc<StreamHandle>> {
        self.streams
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Remove a stream from the table. Closed ids are never reused: the id
    /// allocator only moves forward.
    pub(crate) fn remove_stream(&self, stream_id: u64) -> Option<Arc<StreamHandle>> {
        self.streams.remove(&stream_id).map(|(_, handle)| handle)
    }

    /// Close every stream
    pub(crate) fn close_all_streams(&self) {
        for handle in self.stream_handles() {
            handle.close();
        }
        self.streams.clear();
    }

    /// Number of open streams
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

/// Map of session id to session handle.
///
/// Creation happens only from handshake completion; mutations serialize
/// with lookups through the concurrent map.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session promoted from a handshake
    pub fn insert(&self, handle: Arc<SessionHandle>) {
        self.sessions.insert(handle.session_id, handle);
    }

    /// Look up a session
    #[must_use]
    pub fn get(&self, session_id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a session
    pub fn remove(&self, session_id: SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.remove(&session_id).map(|(_, handle)| handle)
    }

    /// All sessions
    #[must_use]
    pub fn list(&self) -> Vec<Arc<SessionHandle>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Total session count
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Number of sessions in the `Active` state
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().state() == SessionState::Active)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::RotationPolicy;
    use stt_crypto::SessionKey;

    fn handle() -> SessionHandle {
        SessionHandle::new(Session::new(
            SessionId::from_bytes([5; 8]),
            [6; 32],
            SessionKey::from_bytes([7; 32]),
            "127.0.0.1:4000".parse().unwrap(),
            TransportKind::Datagram,
            RotationPolicy::DISABLED,
        ))
    }

    #[test]
    fn test_stream_id_allocation_never_reuses() {
        let handle = handle();
        let first = handle.allocate_stream_id();
        let second = handle.allocate_stream_id();
        assert_eq!(first, 1);
        assert_eq!(second, 2);

        // Removing a stream does not recycle its id.
        let stream = handle.stream_or_open(first, StreamMode::Live, 64, 16);
        assert_eq!(stream.stream_id, first);
        handle.remove_stream(first);
        assert_eq!(handle.allocate_stream_id(), 3);
    }

    #[test]
    fn test_implicit_stream_open() {
        let handle = handle();
        assert!(handle.stream(9).is_none());

        let stream = handle.stream_or_open(9, StreamMode::Live, 64, 16);
        assert_eq!(stream.with_stream(|s| s.next_expected_recv_seq()), 0);
        assert!(handle.stream(9).is_some());

        // Second lookup returns the same stream.
        let again = handle.stream_or_open(9, StreamMode::Bounded, 64, 16);
        assert!(Arc::ptr_eq(&stream, &again));
        assert_eq!(handle.stream_count(), 1);
    }

    #[test]
    fn test_close_all_streams_closes_credits() {
        let handle = handle();
        let stream = handle.stream_or_open(1, StreamMode::Live, 64, 16);
        handle.close_all_streams();
        assert_eq!(handle.stream_count(), 0);
        assert!(stream.credits.is_closed());
        assert_eq!(
            stream.with_stream(|s| s.state()),
            crate::stream::StreamState::Closed
        );
    }

    #[test]
    fn test_registry_lifecycle() {
        let registry = SessionRegistry::new();
        assert!(registry.is_empty());

        let handle = Arc::new(handle());
        let id = handle.session_id;
        registry.insert(Arc::clone(&handle));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(id).is_some());

        // Still handshaking, so not active yet.
        assert_eq!(registry.active_count(), 0);
        handle.with_session(|s| s.transition_to(SessionState::Active).unwrap());
        assert_eq!(registry.active_count(), 1);

        assert!(registry.remove(id).is_some());
        assert!(registry.get(id).is_none());
        assert!(registry.remove(id).is_none());
    }
}
