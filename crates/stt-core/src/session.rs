//! Session state and lifecycle.
//!
//! A session is an authenticated, encrypted connection between two nodes,
//! identified by an 8-byte id both peers derive from handshake material.
//! Sessions are constructed only by handshake completion and owned by the
//! node's session registry; streams and handshake entries refer to them by
//! id.

use crate::error::SessionError;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use stt_crypto::{SessionCipher, SessionKey, TransmissionCrypto};

/// How many receive-key versions a decrypt may advance past the current one
/// before a failure is treated as fatal. Bounds the damage of datagram loss
/// across a sender-side rotation burst.
const MAX_ROTATION_SKEW: u64 = 3;

/// 8-byte session identifier, mixed from both peers' handshake nonces and
/// node ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SessionId([u8; 8]);

impl SessionId {
    /// The all-zero id used by handshake frames
    pub const ZERO: Self = Self([0u8; 8]);

    /// Construct from raw bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// Borrow the raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Whether this is the zero (handshake) id
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionId({})", hex::encode(self.0))
    }
}

/// Which transport carries a session's frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// UDP datagrams
    Datagram,
    /// WebSocket binary messages
    Message,
}

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake in progress
    Handshaking,
    /// Established; streams may send and receive
    Active,
    /// Close requested; draining streams
    Closing,
    /// Terminal
    Closed,
}

/// Key rotation policy.
///
/// Any present threshold triggers rotation; all absent disables automatic
/// rotation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationPolicy {
    /// Rotate after this many payload bytes since the last rotation
    pub bytes: Option<u64>,
    /// Rotate after this many frames since the last rotation
    pub frames: Option<u64>,
    /// Rotate after this many seconds since the last rotation
    pub seconds: Option<u64>,
}

impl RotationPolicy {
    /// Policy with every threshold disabled
    pub const DISABLED: Self = Self {
        bytes: None,
        frames: None,
        seconds: None,
    };

    /// Whether any threshold is configured
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.bytes.is_some() || self.frames.is_some() || self.seconds.is_some()
    }

    /// Whether the given counters hit any configured threshold
    #[must_use]
    pub fn should_rotate(&self, bytes: u64, frames: u64, elapsed: Duration) -> bool {
        if self.bytes.is_some_and(|limit| bytes >= limit) {
            return true;
        }
        if self.frames.is_some_and(|limit| frames >= limit) {
            return true;
        }
        self.seconds
            .is_some_and(|limit| elapsed >= Duration::from_secs(limit))
    }
}

/// One authenticated, encrypted connection with a peer.
pub struct Session {
    session_id: SessionId,
    peer_node_id: [u8; 32],
    key: SessionKey,
    key_version: u64,
    recv_key: SessionKey,
    recv_key_version: u64,
    state: SessionState,
    transport_kind: TransportKind,
    peer_addr: SocketAddr,
    created_at: Instant,
    last_active: Instant,
    bytes_sent: u64,
    bytes_received: u64,
    packets_sent: u64,
    packets_received: u64,
    send_errors: u64,
    receive_errors: u64,
    rotation: RotationPolicy,
    bytes_since_rotation: u64,
    frames_since_rotation: u64,
    rotated_at: Instant,
}

impl Session {
    /// Construct a session from handshake output. Starts in `Handshaking`;
    /// the runtime activates it once the exchange is fully confirmed.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        peer_node_id: [u8; 32],
        key: SessionKey,
        peer_addr: SocketAddr,
        transport_kind: TransportKind,
        rotation: RotationPolicy,
    ) -> Self {
        let now = Instant::now();
        Self {
            session_id,
            peer_node_id,
            recv_key: key.clone(),
            key,
            key_version: 0,
            recv_key_version: 0,
            state: SessionState::Handshaking,
            transport_kind,
            peer_addr,
            created_at: now,
            last_active: now,
            bytes_sent: 0,
            bytes_received: 0,
            packets_sent: 0,
            packets_received: 0,
            send_errors: 0,
            receive_errors: 0,
            rotation,
            bytes_since_rotation: 0,
            frames_since_rotation: 0,
            rotated_at: now,
        }
    }

    /// Session id
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Peer's node id
    #[must_use]
    pub fn peer_node_id(&self) -> &[u8; 32] {
        &self.peer_node_id
    }

    /// Peer's transport address
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Transport carrying this session
    #[must_use]
    pub fn transport_kind(&self) -> TransportKind {
        self.transport_kind
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current send-key version
    #[must_use]
    pub fn key_version(&self) -> u64 {
        self.key_version
    }

    /// Whether a transition is allowed from the current state
    #[must_use]
    pub fn can_transition(&self, to: SessionState) -> bool {
        use SessionState::{Active, Closed, Closing, Handshaking};
        matches!(
            (self.state, to),
            (Handshaking, Active | Closing | Closed)
                | (Active, Closing | Closed)
                | (Closing, Closing | Closed)
                | (Closed, Closed)
        )
    }

    /// Transition to a new state.
    ///
    /// Closing an already-closed session is idempotent.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidState` for a disallowed transition.
    pub fn transition_to(&mut self, new_state: SessionState) -> Result<(), SessionError> {
        if !self.can_transition(new_state) {
            return Err(SessionError::InvalidState);
        }
        if self.state != new_state {
            tracing::debug!(
                session = %self.session_id,
                "session state {:?} -> {:?}",
                self.state,
                new_state
            );
        }
        self.state = new_state;
        Ok(())
    }

    /// Check that the session accepts outbound data.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Closed` if the session is closing or closed,
    /// `SessionError::InvalidState` if still handshaking.
    pub fn ensure_active(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Active => Ok(()),
            SessionState::Handshaking => Err(SessionError::InvalidState),
            SessionState::Closing | SessionState::Closed => Err(SessionError::Closed),
        }
    }

    /// Record an outbound frame
    pub fn record_sent(&mut self, bytes: u64) {
        self.bytes_sent += bytes;
        self.packets_sent += 1;
        self.bytes_since_rotation += bytes;
        self.frames_since_rotation += 1;
        self.touch();
    }

    /// Record an inbound frame
    pub fn record_received(&mut self, bytes: u64) {
        self.bytes_received += bytes;
        self.packets_received += 1;
        self.touch();
    }

    /// Record a send-path error
    pub fn record_send_error(&mut self) {
        self.send_errors += 1;
    }

    /// Record a receive-path error
    pub fn record_receive_error(&mut self) {
        self.receive_errors += 1;
    }

    /// Update the activity timestamp
    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    /// Time since the last recorded activity
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_active.elapsed()
    }

    /// Whether the session has been idle longer than `timeout`
    #[must_use]
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.idle_for() >= timeout
    }

    /// Whether automatic rotation is configured
    #[must_use]
    pub fn rotation_enabled(&self) -> bool {
        self.rotation.is_enabled()
    }

    /// Whether the send-side rotation policy has tripped
    #[must_use]
    pub fn rotation_due(&self) -> bool {
        self.rotation.should_rotate(
            self.bytes_since_rotation,
            self.frames_since_rotation,
            self.rotated_at.elapsed(),
        )
    }

    /// Advance the send key one version and reset the rotation counters.
    pub fn rotate_send_key(&mut self, crypto: &TransmissionCrypto) {
        let next_version = self.key_version + 1;
        self.key = crypto.rotate_session_key(&self.key, &next_version.to_le_bytes());
        self.key_version = next_version;
        self.bytes_since_rotation = 0;
        self.frames_since_rotation = 0;
        self.rotated_at = Instant::now();
        tracing::debug!(
            session = %self.session_id,
            "send key rotated to version {}",
            self.key_version
        );
    }

    /// Rotation nonce bound into outbound associated data
    #[must_use]
    pub fn rotation_nonce(&self) -> [u8; 8] {
        self.key_version.to_le_bytes()
    }

    /// Rotation nonce expected on inbound associated data
    #[must_use]
    pub fn recv_rotation_nonce(&self) -> [u8; 8] {
        self.recv_key_version.to_le_bytes()
    }

    /// Cipher over the current send key
    #[must_use]
    pub fn send_cipher(&self) -> SessionCipher {
        SessionCipher::new(&self.key)
    }

    /// Cipher over the current receive key
    #[must_use]
    pub fn recv_cipher(&self) -> SessionCipher {
        SessionCipher::new(&self.recv_key)
    }

    /// Candidate receive keys ahead of the current version, oldest first.
    ///
    /// Used to recover when the peer rotated before we saw the boundary
    /// frame; bounded so a true authentication failure stays fatal.
    #[must_use]
    pub fn recv_rotation_candidates(
        &self,
        crypto: &TransmissionCrypto,
    ) -> Vec<(SessionKey, u64)> {
        if !self.rotation_enabled() {
            return Vec::new();
        }
        let mut candidates = Vec::new();
        let mut key = self.recv_key.clone();
        for step in 1..=MAX_ROTATION_SKEW {
            let version = self.recv_key_version + step;
            key = crypto.rotate_session_key(&key, &version.to_le_bytes());
            candidates.push((key.clone(), version));
        }
        candidates
    }

    /// Adopt a rotated receive key after a successful trial decryption.
    pub fn commit_recv_rotation(&mut self, key: SessionKey, version: u64) {
        self.recv_key = key;
        self.recv_key_version = version;
        tracing::debug!(
            session = %self.session_id,
            "receive key rotated to version {}",
            version
        );
    }

    /// Creation timestamp
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            state: self.state,
            transport_kind: self.transport_kind,
            key_version: self.key_version,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            packets_sent: self.packets_sent,
            packets_received: self.packets_received,
            send_errors: self.send_errors,
            receive_errors: self.receive_errors,
        }
    }
}

/// Session statistics snapshot
#[derive(Debug, Clone)]
pub struct SessionStats {
    /// Current state
    pub state: SessionState,
    /// Transport carrying the session
    pub transport_kind: TransportKind,
    /// Current send-key version
    pub key_version: u64,
    /// Total payload bytes sent
    pub bytes_sent: u64,
    /// Total payload bytes received
    pub bytes_received: u64,
    /// Frames sent
    pub packets_sent: u64,
    /// Frames received
    pub packets_received: u64,
    /// Send-path errors
    pub send_errors: u64,
    /// Receive-path errors
    pub receive_errors: u64,
}
