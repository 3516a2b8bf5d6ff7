//! Datagram transport over UDP.
//!
//! Delivers whole datagrams tagged with the sender's address. Loss,
//! reordering, and duplication are all possible; callers must not assume
//! any delivery guarantee beyond "a datagram arrives whole or not at all".
//!
//! Socket buffers are sized from the protocol configuration rather than a
//! fixed constant: one full flow-control window of maximum-size datagrams
//! per direction, clamped to a sane range. A node with small segments and
//! a modest credit window gets correspondingly small kernel buffers.

use crate::transport::{Counters, Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;

/// Largest datagram the receive path will accept
const MAX_DATAGRAM_SIZE: usize = 65535;

/// Lower clamp for the derived socket buffer size
const MIN_SOCKET_BUFFER: usize = 64 * 1024;

/// Upper clamp for the derived socket buffer size
const MAX_SOCKET_BUFFER: usize = 8 * 1024 * 1024;

/// Async UDP datagram transport.
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    max_packet_size: usize,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

fn open_socket(addr: SocketAddr, buffer_bytes: usize) -> io::Result<std::net::UdpSocket> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_recv_buffer_size(buffer_bytes)?;
    socket.set_send_buffer_size(buffer_bytes)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

impl UdpTransport {
    /// Bind a datagram transport to the given address.
    ///
    /// Use port 0 for automatic port selection. `max_packet_size` bounds
    /// the size of a single outbound datagram; oversized sends are rejected
    /// rather than fragmented. `burst_capacity` is the number of
    /// maximum-size datagrams the kernel buffers should absorb per
    /// direction — the node passes its initial flow-credit window here, so
    /// a sender exhausting its credits in one burst does not overrun the
    /// peer's socket.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::BindFailed` if the socket cannot be created
    /// or bound.
    pub async fn bind(
        addr: SocketAddr,
        max_packet_size: usize,
        burst_capacity: usize,
    ) -> TransportResult<Self> {
        let buffer_bytes = max_packet_size
            .saturating_mul(burst_capacity)
            .clamp(MIN_SOCKET_BUFFER, MAX_SOCKET_BUFFER);

        let std_socket = open_socket(addr, buffer_bytes)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let socket = UdpSocket::from_std(std_socket)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        if let Ok(local) = socket.local_addr() {
            tracing::debug!(
                "datagram transport bound to {} ({} byte socket buffers)",
                local,
                buffer_bytes
            );
        }

        Ok(Self {
            socket: Arc::new(socket),
            max_packet_size,
            closed: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        })
    }

    /// Configured single-datagram size limit
    #[must_use]
    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        if buf.len() > self.max_packet_size {
            self.counters.record_send_error();
            return Err(TransportError::MessageTooLarge {
                size: buf.len(),
                limit: self.max_packet_size,
            });
        }

        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.counters.record_send(sent);
                Ok(sent)
            }
            Err(e) => {
                self.counters.record_send_error();
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv(&self) -> TransportResult<(Vec<u8>, SocketAddr)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        match self.socket.recv_from(&mut buf).await {
            Ok((size, addr)) => {
                self.counters.record_recv(size);
                buf.truncate(size);
                Ok((buf, addr))
            }
            Err(e) => {
                self.counters.record_recv_error();
                Err(TransportError::Io(e))
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        self.socket.local_addr().map_err(TransportError::Io)
    }

    async fn stop(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn bind_local() -> UdpTransport {
        UdpTransport::bind("127.0.0.1:0".parse().unwrap(), 1472, 64)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_bind_assigns_port() {
        let transport = bind_local().await;
        let addr = transport.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert!(addr.is_ipv4());
        assert_eq!(transport.max_packet_size(), 1472);
    }

    #[tokio::test]
    async fn test_bind_with_tiny_and_huge_windows() {
        // The derived buffer size clamps at both ends; binding must still
        // succeed.
        let small = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), 128, 1)
            .await
            .unwrap();
        assert!(!small.is_closed());

        let large = UdpTransport::bind("127.0.0.1:0".parse().unwrap(), 65507, 100_000)
            .await
            .unwrap();
        assert!(!large.is_closed());
    }

    #[tokio::test]
    async fn test_datagram_roundtrip() {
        let server = bind_local().await;
        let server_addr = server.local_addr().unwrap();
        let client = bind_local().await;

        let sent = client.send_to(b"hello stt", server_addr).await.unwrap();
        assert_eq!(sent, 9);

        let (buf, from) = timeout(Duration::from_secs(1), server.recv())
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(buf, b"hello stt");
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_oversized_send_rejected() {
        let transport = bind_local().await;
        let result = transport
            .send_to(&vec![0u8; 2000], "127.0.0.1:9".parse().unwrap())
            .await;
        assert!(matches!(
            result,
            Err(TransportError::MessageTooLarge { size: 2000, limit: 1472 })
        ));
        assert_eq!(transport.stats().send_errors, 1);
        assert_eq!(transport.stats().packets_sent, 0);
    }

    #[tokio::test]
    async fn test_counters_track_traffic() {
        let server = bind_local().await;
        let server_addr = server.local_addr().unwrap();
        let client = bind_local().await;

        for i in 0..4u8 {
            client.send_to(&[i; 8], server_addr).await.unwrap();
        }
        for _ in 0..4 {
            timeout(Duration::from_secs(1), server.recv())
                .await
                .expect("timeout")
                .unwrap();
        }

        let sent = client.stats();
        assert_eq!(sent.packets_sent, 4);
        assert_eq!(sent.bytes_sent, 32);
        let received = server.stats();
        assert_eq!(received.packets_received, 4);
        assert_eq!(received.bytes_received, 32);
    }

    #[tokio::test]
    async fn test_stop_rejects_io() {
        let transport = bind_local().await;
        assert!(!transport.is_closed());

        transport.stop().await.unwrap();
        assert!(transport.is_closed());

        let result = transport
            .send_to(b"test", "127.0.0.1:1234".parse().unwrap())
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(matches!(transport.recv().await, Err(TransportError::Closed)));
    }
}
