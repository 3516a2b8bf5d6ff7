//! Node implementation - the per-process protocol coordinator.
//!
//! A [`Node`] owns the crypto adapter, the transports, the session and
//! handshake registries, and the application-visible event queue. All
//! inbound frames funnel through the dispatcher in `dispatch.rs`; all
//! outbound data funnels through the segment send path here.

use crate::error::{SessionError, StreamError};
use crate::frame::{Frame, FrameFlags, FrameType};
use crate::handshake::{HandshakeRegistry, InitiatorHandshake, InitiatorState};
use crate::node::config::NodeConfig;
use crate::node::error::{NodeError, Result};
use crate::node::session::{SessionHandle, SessionRegistry, StreamHandle};
use crate::session::{Session, SessionId, SessionState, TransportKind};
use crate::stream::{Stream, StreamMode};
use crate::storage::StorageProvider;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use stt_crypto::TransmissionCrypto;
use stt_transport::{MessageTransport, Transport, TransportError, TransportStats, UdpTransport};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

/// Worst-case frame overhead around one segment's plaintext: fixed header,
/// two full varints, sealing metadata, and the AEAD tag.
const SEGMENT_OVERHEAD: usize = 96;

/// Receive-loop poll granularity, so loops notice `stop`
const RECV_POLL: Duration = Duration::from_millis(100);

/// Why a session went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Orderly local or remote close
    Normal,
    /// Idle timeout expired
    Idle,
    /// A decryption or authentication failure
    CryptoFailure,
    /// A protocol violation
    ProtocolError,
    /// The node is shutting down
    Stopped,
}

impl DisconnectReason {
    /// Wire code carried in DISCONNECT payloads
    #[must_use]
    pub fn as_code(self) -> i64 {
        match self {
            Self::Normal => 0,
            Self::Idle => 1,
            Self::CryptoFailure => 2,
            Self::ProtocolError => 3,
            Self::Stopped => 4,
        }
    }

    /// Parse a wire code; unknown codes collapse to `Normal`
    #[must_use]
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Idle,
            2 => Self::CryptoFailure,
            3 => Self::ProtocolError,
            4 => Self::Stopped,
            _ => Self::Normal,
        }
    }
}

/// Why a stream went away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCloseReason {
    /// Bounded stream delivered its final segment
    Finished,
    /// Closed locally
    LocalClose,
    /// Closed by the peer
    RemoteClose,
    /// Reorder buffer overflowed
    ReorderOverflow,
}

/// Application-visible events from `Node::receive`
#[derive(Debug)]
pub enum NodeEvent {
    /// Ordered plaintext from a stream
    Data {
        /// Owning session
        session_id: SessionId,
        /// Stream within the session
        stream_id: u64,
        /// Decrypted, in-order bytes
        payload: Vec<u8>,
    },
    /// A frame in the pass-through ranges (0x20-0x22, 0x80-0xFF)
    UserFrame {
        /// Session the frame arrived on; zero when unbound
        session_id: SessionId,
        /// Raw frame type byte
        frame_type: u8,
        /// Payload, decrypted when it was session-scoped
        payload: Vec<u8>,
    },
    /// A stream ended
    StreamClosed {
        /// Owning session
        session_id: SessionId,
        /// The stream that closed
        stream_id: u64,
        /// Why
        reason: StreamCloseReason,
    },
    /// A session ended; this is the last event for its streams
    SessionClosed {
        /// The session that closed
        session_id: SessionId,
        /// Why
        reason: DisconnectReason,
    },
}

/// Handler for user-defined frame types (0x80-0xFF).
///
/// Registered handlers receive matching frames instead of the event queue.
pub trait UserFrameHandler: Send + Sync {
    /// Called with the (decrypted, when session-scoped) payload
    fn on_frame(&self, session_id: SessionId, frame_type: u8, payload: &[u8]);
}

/// Node statistics snapshot
#[derive(Debug, Clone)]
pub struct NodeStats {
    /// Total sessions in the registry
    pub sessions: usize,
    /// Sessions in the Active state
    pub active_sessions: usize,
    /// Handshakes in flight (both roles)
    pub handshakes_in_flight: usize,
    /// Inbound frames dropped (malformed, unknown type, no session)
    pub frames_dropped: u64,
    /// Datagram transport counters, when started
    pub datagram: Option<TransportStats>,
    /// Message transport counters, when configured and started
    pub message: Option<TransportStats>,
}

pub(crate) struct NodeInner {
    pub(crate) config: NodeConfig,
    pub(crate) crypto: TransmissionCrypto,
    pub(crate) node_id: [u8; 32],
    pub(crate) sessions: SessionRegistry,
    pub(crate) handshakes: HandshakeRegistry,
    pub(crate) datagram: Mutex<Option<Arc<UdpTransport>>>,
    pub(crate) message: Mutex<Option<Arc<MessageTransport>>>,
    pub(crate) accept_inbound: AtomicBool,
    pub(crate) running: AtomicBool,
    pub(crate) events_tx: std::sync::Mutex<Option<mpsc::Sender<NodeEvent>>>,
    pub(crate) events_rx: Mutex<mpsc::Receiver<NodeEvent>>,
    pub(crate) frame_handlers: DashMap<u8, Arc<dyn UserFrameHandler>>,
    pub(crate) storage: std::sync::Mutex<Option<Arc<dyn StorageProvider>>>,
    pub(crate) frames_dropped: AtomicU64,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// STT protocol node.
///
/// Cheap to clone; all clones share one runtime state. There is no global
/// state: multiple nodes in one process are fully independent.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

impl Node {
    /// Construct a node.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Config` for an invalid configuration (seed too
    /// short, unusable packet size, zero limits).
    pub fn new(config: NodeConfig) -> Result<Self> {
        config.validate()?;

        let crypto = TransmissionCrypto::new(&config.shared_seed)?;
        let node_id = crypto.derive_node_id(&config.node_seed);
        let accept_inbound = config.accept_inbound;
        let (events_tx, events_rx) = mpsc::channel(config.inbound_queue_capacity);

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                crypto,
                node_id,
                sessions: SessionRegistry::new(),
                handshakes: HandshakeRegistry::new(),
                datagram: Mutex::new(None),
                message: Mutex::new(None),
                accept_inbound: AtomicBool::new(accept_inbound),
                running: AtomicBool::new(false),
                events_tx: std::sync::Mutex::new(Some(events_tx)),
                events_rx: Mutex::new(events_rx),
                frame_handlers: DashMap::new(),
                storage: std::sync::Mutex::new(None),
                frames_dropped: AtomicU64::new(0),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// This node's 32-byte identifier
    #[must_use]
    pub fn node_id(&self) -> &[u8; 32] {
        &self.inner.node_id
    }

    /// Whether the node has been started and not stopped
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Accept inbound HELLO frames again
    pub fn enable_accept_inbound(&self) {
        self.inner.accept_inbound.store(true, Ordering::SeqCst);
    }

    /// Drop inbound HELLO frames; existing sessions continue to function
    pub fn disable_accept_inbound(&self) {
        self.inner.accept_inbound.store(false, Ordering::SeqCst);
    }

    /// Bind a storage provider; the core never touches it
    pub fn set_storage(&self, storage: Arc<dyn StorageProvider>) {
        *self.inner.storage.lock().expect("storage lock poisoned") = Some(storage);
    }

    /// The bound storage provider, if any
    #[must_use]
    pub fn storage(&self) -> Option<Arc<dyn StorageProvider>> {
        self.inner
            .storage
            .lock()
            .expect("storage lock poisoned")
            .clone()
    }

    /// Register a handler for a user-defined frame type (0x80-0xFF).
    ///
    /// # Errors
    ///
    /// Returns `NodeError::NotUserFrameType` outside the user range.
    pub fn register_frame_handler(
        &self,
        frame_type: u8,
        handler: Arc<dyn UserFrameHandler>,
    ) -> Result<()> {
        if frame_type < 0x80 {
            return Err(NodeError::NotUserFrameType(frame_type));
        }
        self.inner.frame_handlers.insert(frame_type, handler);
        Ok(())
    }

    /// Start the node: bind the transports and spawn the receive and
    /// maintenance tasks.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::AlreadyRunning` on a double start, or a
    /// transport error if binding fails.
    pub async fn start(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::AlreadyRunning);
        }

        // Fresh event queue per run.
        let (tx, rx) = mpsc::channel(self.inner.config.inbound_queue_capacity);
        *self.inner.events_tx.lock().expect("events lock poisoned") = Some(tx);
        *self.inner.events_rx.lock().await = rx;

        let datagram = match UdpTransport::bind(
            self.inner.config.listen_addr(),
            self.inner.config.max_packet_size,
            self.inner.config.flow_credits_initial,
        )
        .await
        {
            Ok(t) => Arc::new(t),
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        *self.inner.datagram.lock().await = Some(Arc::clone(&datagram));

        let mut tasks = Vec::new();
        let node = self.clone();
        tasks.push(tokio::spawn(async move {
            node.receive_loop(datagram as Arc<dyn Transport>, TransportKind::Datagram)
                .await;
        }));

        if let Some(addr) = self.inner.config.message_listen_addr() {
            let message =
                match MessageTransport::bind(addr, self.inner.config.max_frame_size).await {
                    Ok(t) => Arc::new(t),
                    Err(e) => {
                        self.inner.running.store(false, Ordering::SeqCst);
                        if let Some(t) = self.inner.datagram.lock().await.take() {
                            let _ = t.stop().await;
                        }
                        return Err(e.into());
                    }
                };
            *self.inner.message.lock().await = Some(Arc::clone(&message));

            let node = self.clone();
            tasks.push(tokio::spawn(async move {
                node.receive_loop(message as Arc<dyn Transport>, TransportKind::Message)
                    .await;
            }));
        }

        let node = self.clone();
        tasks.push(tokio::spawn(async move {
            node.maintenance_loop().await;
        }));
        self.inner.tasks.lock().await.extend(tasks);

        tracing::info!(
            "node {} started on {}",
            hex::encode(self.inner.node_id),
            self.inner
                .datagram
                .lock()
                .await
                .as_ref()
                .and_then(|t| t.local_addr().ok())
                .map_or_else(|| "<unbound>".to_string(), |a| a.to_string())
        );
        Ok(())
    }

    /// Stop the node: close every session, then the transports, in the
    /// reverse of start order.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::NotRunning` if the node was not started.
    pub async fn stop(&self) -> Result<()> {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(NodeError::NotRunning);
        }

        for handle in self.inner.sessions.list() {
            self.close_session_inner(&handle, DisconnectReason::Stopped, true)
                .await;
        }

        if let Some(t) = self.inner.message.lock().await.take() {
            let _ = t.stop().await;
        }
        if let Some(t) = self.inner.datagram.lock().await.take() {
            let _ = t.stop().await;
        }

        // Ends the application event feed once drained.
        self.inner
            .events_tx
            .lock()
            .expect("events lock poisoned")
            .take();

        for task in self.inner.tasks.lock().await.drain(..) {
            task.abort();
        }

        tracing::info!("node {} stopped", hex::encode(self.inner.node_id));
        Ok(())
    }

    /// The datagram transport's bound address.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::NotRunning` before `start`.
    pub async fn local_addr(&self) -> Result<SocketAddr> {
        match self.inner.datagram.lock().await.as_ref() {
            Some(t) => Ok(t.local_addr()?),
            None => Err(NodeError::NotRunning),
        }
    }

    /// The message transport's bound address.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::MessageTransportDisabled` when not configured.
    pub async fn message_addr(&self) -> Result<SocketAddr> {
        match self.inner.message.lock().await.as_ref() {
            Some(t) => Ok(t.local_addr()?),
            None => Err(NodeError::MessageTransportDisabled),
        }
    }

    /// Next application event: ordered stream data, pass-through frames,
    /// stream and session closures. Returns `None` once the node has
    /// stopped and the queue is drained.
    pub async fn receive(&self) -> Option<NodeEvent> {
        let mut rx = self.inner.events_rx.lock().await;
        rx.recv().await
    }

    /// Establish a session with a peer over the datagram transport.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Handshake` if any step fails or
    /// `NodeError::Timeout` when the deadline expires.
    pub async fn connect(&self, peer: SocketAddr) -> Result<SessionId> {
        self.connect_inner(peer, TransportKind::Datagram).await
    }

    /// Establish a session with a peer over the message transport,
    /// dialing its WebSocket listener first.
    ///
    /// # Errors
    ///
    /// As [`Self::connect`], plus `NodeError::MessageTransportDisabled`.
    pub async fn connect_message(&self, peer: SocketAddr) -> Result<SessionId> {
        let transport = {
            let guard = self.inner.message.lock().await;
            guard
                .as_ref()
                .cloned()
                .ok_or(NodeError::MessageTransportDisabled)?
        };
        transport.connect(peer).await?;
        self.connect_inner(peer, TransportKind::Message).await
    }

    async fn connect_inner(&self, peer: SocketAddr, kind: TransportKind) -> Result<SessionId> {
        if !self.is_running() {
            return Err(NodeError::NotRunning);
        }

        let transport = self.transport_for(kind).await?;
        let mut replies = self.inner.handshakes.register_initiator(peer);
        let result = self.drive_initiator(transport, peer, &mut replies).await;
        self.inner.handshakes.remove_initiator(peer);
        let outcome = result?;

        let session = Session::new(
            outcome.session_id,
            outcome.peer_node_id,
            outcome.session_key,
            peer,
            kind,
            self.inner.config.rotation,
        );
        let handle = Arc::new(SessionHandle::new(session));
        handle
            .with_session(|s| s.transition_to(SessionState::Active))
            .map_err(NodeError::Session)?;
        self.inner.sessions.insert(Arc::clone(&handle));

        tracing::info!(
            session = %outcome.session_id,
            "session established with {} over {:?}",
            peer,
            kind
        );
        Ok(outcome.session_id)
    }

    async fn drive_initiator(
        &self,
        transport: Arc<dyn Transport>,
        peer: SocketAddr,
        replies: &mut mpsc::Receiver<Frame>,
    ) -> Result<crate::handshake::HandshakeOutcome> {
        let (mut handshake, hello) =
            InitiatorHandshake::start(&self.inner.crypto, self.inner.node_id)?;
        transport
            .send_to(&hello.encode(self.inner.config.max_frame_size)?, peer)
            .await?;

        let deadline = tokio::time::Instant::now() + self.inner.config.handshake_timeout;
        loop {
            let frame = tokio::time::timeout_at(deadline, replies.recv())
                .await
                .map_err(|_| NodeError::Timeout("handshake"))?
                .ok_or(NodeError::Timeout("handshake"))?;

            match (frame.frame_type, handshake.state()) {
                (FrameType::Challenge, InitiatorState::SentHello) => {
                    let proof = handshake.on_challenge(&self.inner.crypto, &frame)?;
                    transport
                        .send_to(&proof.encode(self.inner.config.max_frame_size)?, peer)
                        .await?;
                }
                (FrameType::Confirm, InitiatorState::SentProof) => {
                    return Ok(handshake.on_confirm(&self.inner.crypto, &frame)?);
                }
                // Duplicated datagrams replay earlier steps; ignore them.
                _ => {}
            }
        }
    }

    /// Open a stream on a session and announce it to the peer.
    ///
    /// # Errors
    ///
    /// Returns a session error for an unknown or inactive session, or a
    /// transport error if the announcement cannot be sent.
    pub async fn open_stream(&self, session_id: SessionId, mode: StreamMode) -> Result<u64> {
        let handle = self.session(session_id)?;
        handle
            .with_session(|s| s.ensure_active())
            .map_err(NodeError::Session)?;

        let stream_id = handle.allocate_stream_id();
        handle.streams.insert(
            stream_id,
            Arc::new(StreamHandle::new(
                Stream::new(
                    stream_id,
                    session_id,
                    mode,
                    self.inner.config.reorder_buffer_limit,
                ),
                self.inner.config.flow_credits_initial,
            )),
        );

        let payload = crate::codec::Value::Map(vec![
            (
                crate::codec::Value::str("mode"),
                crate::codec::Value::Int(mode.as_code()),
            ),
            (
                crate::codec::Value::str("stream_id"),
                crate::codec::Value::Int(stream_id as i64),
            ),
        ])
        .encode()?;
        self.send_control(&handle, FrameType::StreamOpen, payload)
            .await?;
        Ok(stream_id)
    }

    /// Send bytes on a stream, opening it implicitly if needed. Cuts the
    /// input into MTU-sized segments; awaits flow-control credits.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UnknownSession`, `SessionError::Closed`,
    /// `StreamError::Closed`/`Ended`, or a transport error.
    pub async fn send_to_session(
        &self,
        session_id: SessionId,
        stream_id: u64,
        bytes: &[u8],
    ) -> Result<()> {
        let handle = self.session(session_id)?;
        handle
            .with_session(|s| s.ensure_active())
            .map_err(NodeError::Session)?;
        let stream = handle.stream_or_open(
            stream_id,
            StreamMode::Live,
            self.inner.config.reorder_buffer_limit,
            self.inner.config.flow_credits_initial,
        );

        let _guard = stream.send_lock.lock().await;
        let max_segment = self.max_segment_len(handle.transport_kind());
        for chunk in bytes.chunks(max_segment) {
            self.send_segment(&handle, &stream, chunk, false).await?;
        }
        Ok(())
    }

    /// End a bounded stream: emit the final segment. Further sends fail
    /// with `StreamError::Ended`.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::NotBounded` for a live stream, plus the usual
    /// send-path errors.
    pub async fn end_stream(&self, session_id: SessionId, stream_id: u64) -> Result<()> {
        let handle = self.session(session_id)?;
        let stream = handle
            .stream(stream_id)
            .ok_or(NodeError::Session(SessionError::UnknownStream(stream_id)))?;

        let _guard = stream.send_lock.lock().await;
        stream
            .with_stream(|s| {
                if s.mode() != StreamMode::Bounded {
                    return Err(StreamError::NotBounded);
                }
                s.ensure_sendable()
            })
            .map_err(NodeError::Stream)?;

        self.send_segment(&handle, &stream, &[], true).await?;
        stream.with_stream(Stream::mark_ended);
        Ok(())
    }

    /// Close a stream and tell the peer.
    ///
    /// # Errors
    ///
    /// Returns a session error for unknown ids; the close itself cannot
    /// fail.
    pub async fn close_stream(&self, session_id: SessionId, stream_id: u64) -> Result<()> {
        let handle = self.session(session_id)?;
        let stream = handle
            .stream(stream_id)
            .ok_or(NodeError::Session(SessionError::UnknownStream(stream_id)))?;

        let payload = crate::codec::Value::Map(vec![
            (
                crate::codec::Value::str("reason"),
                crate::codec::Value::Int(0),
            ),
            (
                crate::codec::Value::str("stream_id"),
                crate::codec::Value::Int(stream_id as i64),
            ),
        ])
        .encode()?;
        // Best effort: the stream closes locally either way.
        let _ = self.send_control(&handle, FrameType::StreamClose, payload).await;

        stream.close();
        self.emit(NodeEvent::StreamClosed {
            session_id,
            stream_id,
            reason: StreamCloseReason::LocalClose,
        })
        .await;
        Ok(())
    }

    /// Close a session: notify the peer, close every stream, remove the
    /// session. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UnknownSession` if the id is not registered.
    pub async fn close_session(&self, session_id: SessionId) -> Result<()> {
        let handle = self.session(session_id)?;
        self.close_session_inner(&handle, DisconnectReason::Normal, true)
            .await;
        Ok(())
    }

    /// Send to one stream id on every session; per-session errors are
    /// collected and do not abort the others.
    pub async fn send_to_all(
        &self,
        stream_id: u64,
        bytes: &[u8],
    ) -> Vec<(SessionId, Result<()>)> {
        let mut results = Vec::new();
        for handle in self.inner.sessions.list() {
            let session_id = handle.session_id;
            let result = self.send_to_session(session_id, stream_id, bytes).await;
            results.push((session_id, result));
        }
        results
    }

    /// Send a user-defined frame (0x80-0xFF), sealed under the session key.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::NotUserFrameType` outside the user range, plus
    /// the usual send-path errors.
    pub async fn send_user_frame(
        &self,
        session_id: SessionId,
        frame_type: u8,
        payload: &[u8],
    ) -> Result<()> {
        if frame_type < 0x80 {
            return Err(NodeError::NotUserFrameType(frame_type));
        }
        let handle = self.session(session_id)?;
        handle
            .with_session(|s| s.ensure_active())
            .map_err(NodeError::Session)?;
        self.send_control(&handle, FrameType::User(frame_type), payload.to_vec())
            .await
    }

    /// Statistics snapshot
    pub async fn stats(&self) -> NodeStats {
        NodeStats {
            sessions: self.inner.sessions.len(),
            active_sessions: self.inner.sessions.active_count(),
            handshakes_in_flight: self.inner.handshakes.in_flight(),
            frames_dropped: self.inner.frames_dropped.load(Ordering::Relaxed),
            datagram: self
                .inner
                .datagram
                .lock()
                .await
                .as_ref()
                .map(|t| t.stats()),
            message: self.inner.message.lock().await.as_ref().map(|t| t.stats()),
        }
    }

    /// Statistics snapshot for one session, if it is registered
    #[must_use]
    pub fn session_stats(&self, session_id: SessionId) -> Option<crate::session::SessionStats> {
        self.inner
            .sessions
            .get(session_id)
            .map(|handle| handle.with_session(|s| s.stats()))
    }

    /// Statistics snapshot for one stream, if it is registered
    #[must_use]
    pub fn stream_stats(
        &self,
        session_id: SessionId,
        stream_id: u64,
    ) -> Option<crate::stream::StreamStats> {
        self.inner
            .sessions
            .get(session_id)
            .and_then(|handle| handle.stream(stream_id))
            .map(|stream| stream.stats())
    }

    // ---- internal plumbing ----

    pub(crate) fn session(&self, session_id: SessionId) -> Result<Arc<SessionHandle>> {
        self.inner
            .sessions
            .get(session_id)
            .ok_or(NodeError::Session(SessionError::UnknownSession(session_id)))
    }

    pub(crate) async fn transport_for(&self, kind: TransportKind) -> Result<Arc<dyn Transport>> {
        match kind {
            TransportKind::Datagram => self
                .inner
                .datagram
                .lock()
                .await
                .as_ref()
                .map(|t| Arc::clone(t) as Arc<dyn Transport>)
                .ok_or(NodeError::NotRunning),
            TransportKind::Message => self
                .inner
                .message
                .lock()
                .await
                .as_ref()
                .map(|t| Arc::clone(t) as Arc<dyn Transport>)
                .ok_or(NodeError::MessageTransportDisabled),
        }
    }

    pub(crate) fn max_segment_len(&self, kind: TransportKind) -> usize {
        let unit = match kind {
            TransportKind::Datagram => self.inner.config.max_packet_size,
            TransportKind::Message => self.inner.config.max_frame_size,
        };
        unit.saturating_sub(SEGMENT_OVERHEAD).max(1)
    }

    pub(crate) async fn emit(&self, event: NodeEvent) {
        let tx = self
            .inner
            .events_tx
            .lock()
            .expect("events lock poisoned")
            .clone();
        if let Some(tx) = tx {
            // Bounded queue: a full application queue backpressures the
            // inbound path rather than dropping.
            let _ = tx.send(event).await;
        }
    }

    /// One segment through the send path: await a credit, assign the next
    /// sequence, seal, transmit, then commit.
    ///
    /// Cancellation at the credit await consumes nothing; cancellation
    /// during transmission leaves the sequence uncommitted, so the stream
    /// never develops a gap.
    pub(crate) async fn send_segment(
        &self,
        handle: &Arc<SessionHandle>,
        stream: &Arc<StreamHandle>,
        chunk: &[u8],
        fin: bool,
    ) -> Result<()> {
        let permit = Arc::clone(&stream.credits)
            .acquire_owned()
            .await
            .map_err(|_| NodeError::Stream(StreamError::Closed))?;

        let sequence = stream
            .with_stream(|s| {
                s.ensure_sendable()?;
                s.peek_send_seq()
            })
            .map_err(NodeError::Stream)?;

        let (ctx, rotation_nonce) = handle.with_session(|s| {
            s.ensure_active()?;
            if s.rotation_enabled() && s.rotation_due() {
                s.rotate_send_key(&self.inner.crypto);
            }
            Ok::<_, SessionError>((
                s.send_cipher()
                    .stream_context(s.session_id().as_bytes(), stream.stream_id),
                s.rotation_nonce(),
            ))
        })
        .map_err(NodeError::Session)?;

        let mut frame = Frame {
            frame_type: FrameType::Data,
            flags: if fin {
                FrameFlags::new().with_fin()
            } else {
                FrameFlags::new()
            },
            session_id: handle.session_id,
            stream_id: stream.stream_id,
            sequence,
            metadata: Vec::new(),
            payload: chunk.to_vec(),
        };
        frame.encrypt_payload(&ctx, &rotation_nonce)?;
        let bytes = frame.encode(self.inner.config.max_frame_size)?;

        let transport = self.transport_for(handle.transport_kind()).await?;
        match transport.send_to(&bytes, handle.peer_addr()).await {
            Ok(_) => {
                permit.forget();
                stream.with_stream(|s| s.commit_segment_sent(chunk.len() as u64));
                handle.with_session(|s| s.record_sent(bytes.len() as u64));
                Ok(())
            }
            Err(e) => {
                handle.with_session(Session::record_send_error);
                Err(e.into())
            }
        }
    }

    /// Seal and send a session-scope control frame (stream id 0).
    pub(crate) async fn send_control(
        &self,
        handle: &Arc<SessionHandle>,
        frame_type: FrameType,
        payload: Vec<u8>,
    ) -> Result<()> {
        let (ctx, rotation_nonce) = handle.with_session(|s| {
            (
                s.send_cipher()
                    .stream_context(s.session_id().as_bytes(), 0),
                s.rotation_nonce(),
            )
        });

        let mut frame = Frame::new(frame_type, handle.session_id);
        frame.payload = payload;
        frame.encrypt_payload(&ctx, &rotation_nonce)?;
        let bytes = frame.encode(self.inner.config.max_frame_size)?;

        let transport = self.transport_for(handle.transport_kind()).await?;
        match transport.send_to(&bytes, handle.peer_addr()).await {
            Ok(_) => {
                handle.with_session(|s| s.record_sent(bytes.len() as u64));
                Ok(())
            }
            Err(e) => {
                handle.with_session(Session::record_send_error);
                Err(e.into())
            }
        }
    }

    /// Send an unencrypted, empty keepalive.
    pub(crate) async fn send_keepalive(&self, handle: &Arc<SessionHandle>) -> Result<()> {
        let frame = Frame::new(FrameType::Keepalive, handle.session_id);
        let bytes = frame.encode(self.inner.config.max_frame_size)?;
        let transport = self.transport_for(handle.transport_kind()).await?;
        transport.send_to(&bytes, handle.peer_addr()).await?;
        handle.with_session(|s| s.record_sent(bytes.len() as u64));
        Ok(())
    }

    /// Close a session: transition Closing, close streams, notify the peer
    /// when asked, transition Closed, deregister, emit the closure event.
    /// Idempotent for already-removed sessions.
    pub(crate) async fn close_session_inner(
        &self,
        handle: &Arc<SessionHandle>,
        reason: DisconnectReason,
        notify_peer: bool,
    ) {
        let session_id = handle.session_id;
        let was_closed = handle.with_session(|s| {
            if s.state() == SessionState::Closed {
                true
            } else {
                let _ = s.transition_to(SessionState::Closing);
                false
            }
        });
        if was_closed {
            return;
        }

        if notify_peer {
            let payload = crate::codec::Value::Map(vec![(
                crate::codec::Value::str("reason"),
                crate::codec::Value::Int(reason.as_code()),
            )])
            .encode()
            .unwrap_or_default();
            if let Err(e) = self.send_control(handle, FrameType::Disconnect, payload).await {
                tracing::debug!(session = %session_id, "disconnect notify failed: {}", e);
            }
        }

        handle.close_all_streams();
        handle.with_session(|s| {
            let _ = s.transition_to(SessionState::Closed);
        });
        self.inner.sessions.remove(session_id);

        tracing::info!(session = %session_id, "session closed: {:?}", reason);
        self.emit(NodeEvent::SessionClosed { session_id, reason })
            .await;
    }

    async fn receive_loop(&self, transport: Arc<dyn Transport>, kind: TransportKind) {
        tracing::debug!("receive loop started ({:?})", kind);
        loop {
            if !self.is_running() {
                break;
            }
            match tokio::time::timeout(RECV_POLL, transport.recv()).await {
                Ok(Ok((data, from))) => {
                    // Processed inline: the bounded event queue backpressures
                    // through here to the transport.
                    self.handle_incoming(data, from, kind).await;
                }
                Ok(Err(TransportError::Closed)) => break,
                Ok(Err(e)) => {
                    tracing::warn!("transport receive error ({:?}): {}", kind, e);
                }
                Err(_) => {} // poll timeout; re-check running
            }
        }
        tracing::debug!("receive loop terminated ({:?})", kind);
    }

    async fn maintenance_loop(&self) {
        let tick = self
            .inner
            .config
            .ack_flush_interval
            .max(Duration::from_millis(50));
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_slow = Instant::now();

        loop {
            interval.tick().await;
            if !self.is_running() {
                break;
            }

            // Flush pending ACKs on every tick.
            for handle in self.inner.sessions.list() {
                for stream in handle.stream_handles() {
                    if let Some(ack) = stream.with_stream(|s| s.pending_ack()) {
                        let _ = self.send_ack(&handle, stream.stream_id, ack).await;
                    }
                }
            }

            // Slower housekeeping roughly once a second.
            if last_slow.elapsed() < Duration::from_secs(1) {
                continue;
            }
            last_slow = Instant::now();

            let purged = self.inner.handshakes.purge_expired();
            if purged > 0 {
                tracing::debug!("purged {} expired handshakes", purged);
            }

            for handle in self.inner.sessions.list() {
                let (state, idle, quiet) = handle.with_session(|s| {
                    (
                        s.state(),
                        s.is_idle(self.inner.config.session_idle_timeout),
                        s.idle_for() >= self.inner.config.keepalive_interval,
                    )
                });
                if state != SessionState::Active {
                    continue;
                }
                if idle {
                    self.close_session_inner(&handle, DisconnectReason::Idle, true)
                        .await;
                } else if quiet {
                    if let Err(e) = self.send_keepalive(&handle).await {
                        tracing::debug!(
                            session = %handle.session_id,
                            "keepalive failed: {}",
                            e
                        );
                    }
                }
            }
        }
    }

    pub(crate) async fn send_ack(
        &self,
        handle: &Arc<SessionHandle>,
        stream_id: u64,
        ack_up_to: u64,
    ) -> Result<()> {
        let payload = crate::codec::Value::Map(vec![
            (
                crate::codec::Value::str("ack"),
                crate::codec::Value::Int(ack_up_to as i64),
            ),
            (
                crate::codec::Value::str("stream_id"),
                crate::codec::Value::Int(stream_id as i64),
            ),
        ])
        .encode()?;
        self.send_control(handle, FrameType::Ack, payload).await
    }
}
