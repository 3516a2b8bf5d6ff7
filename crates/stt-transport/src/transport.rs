//! Transport trait abstraction over the datagram and message backends.
//!
//! The node treats a transport as a source and sink of opaque buffers
//! tagged with a peer address. Reliability guarantees differ per backend
//! and are documented on the implementations.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("transport is closed")]
    Closed,

    /// Address binding failed
    #[error("failed to bind to address: {0}")]
    BindFailed(String),

    /// No connection to the requested peer
    #[error("no connection to peer {0}")]
    NoConnection(SocketAddr),

    /// Connection attempt failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Outbound buffer exceeds what the transport can carry in one unit
    #[error("message too large: {size} bytes exceeds limit of {limit}")]
    MessageTooLarge {
        /// Size of the rejected buffer
        size: usize,
        /// Transport unit limit
        limit: usize,
    },
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Async transport contract shared by the datagram and message adapters.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one buffer to a peer.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the transport is closed or the send fails.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Receive the next `(buffer, peer_address)` pair.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Closed` once the transport has been stopped
    /// and its queue drained.
    async fn recv(&self) -> TransportResult<(Vec<u8>, SocketAddr)>;

    /// Local address this transport is bound to.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if the address cannot be determined.
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop the transport and release resources.
    ///
    /// # Errors
    ///
    /// Returns `TransportError` if shutdown fails.
    async fn stop(&self) -> TransportResult<()>;

    /// Check whether the transport has been stopped.
    fn is_closed(&self) -> bool;

    /// Snapshot of transport counters.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total packets sent
    pub packets_sent: u64,
    /// Total packets received
    pub packets_received: u64,
    /// Send errors
    pub send_errors: u64,
    /// Receive errors
    pub recv_errors: u64,
}

/// Atomic counter set behind every transport's stats snapshot.
#[derive(Default)]
pub(crate) struct Counters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl Counters {
    pub(crate) fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_send_error(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}
