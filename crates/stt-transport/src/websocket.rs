//! Message transport over WebSocket binary frames.
//!
//! Each peer connection is a WebSocket; one outbound binary message carries
//! one protocol frame. Delivery is reliable and ordered at the message
//! level. Inbound messages from every connection funnel into a single
//! bounded queue tagged with the peer's address.

use crate::transport::{Counters, Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async, client_async};

/// Per-connection outbound queue depth
const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Inbound queue depth shared across connections
const INBOUND_QUEUE_DEPTH: usize = 256;

/// WebSocket message transport.
///
/// Accepts inbound connections on a bound listener and can dial out to
/// peers; both kinds of connection feed the same receive queue.
#[derive(Clone)]
pub struct MessageTransport {
    local_addr: SocketAddr,
    max_message_size: usize,
    conns: Arc<DashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>,
    inbound_tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
    inbound_rx: Arc<Mutex<mpsc::Receiver<(Vec<u8>, SocketAddr)>>>,
    accept_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    closed: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl MessageTransport {
    /// Bind a listener and start accepting WebSocket connections.
    ///
    /// `max_message_size` bounds a single outbound message.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::BindFailed` if the TCP listener cannot bind.
    pub async fn bind(addr: SocketAddr, max_message_size: usize) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);

        let transport = Self {
            local_addr,
            max_message_size,
            conns: Arc::new(DashMap::new()),
            inbound_tx,
            inbound_rx: Arc::new(Mutex::new(inbound_rx)),
            accept_task: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(Counters::default()),
        };

        let accept = transport.clone();
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if accept.closed.load(Ordering::Relaxed) {
                            break;
                        }
                        let transport = accept.clone();
                        tokio::spawn(async move {
                            match accept_async(stream).await {
                                Ok(ws) => transport.spawn_connection(ws, peer),
                                Err(e) => {
                                    tracing::debug!("websocket accept from {} failed: {}", peer, e);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("websocket listener error: {}", e);
                        break;
                    }
                }
            }
        });
        *transport.accept_task.lock().await = Some(handle);

        Ok(transport)
    }

    /// Dial a peer's message transport listener.
    ///
    /// Returns the peer address used as the connection identifier for
    /// subsequent `send_to` calls.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::ConnectionFailed` if the TCP connection or
    /// the WebSocket upgrade fails.
    pub async fn connect(&self, addr: SocketAddr) -> TransportResult<SocketAddr> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        let url = format!("ws://{addr}/");
        let (ws, _response) = client_async(url.as_str(), stream)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        // Registered before returning, so a send right after connect
        // cannot miss the connection.
        self.spawn_connection(ws, addr);
        Ok(addr)
    }

    /// Close the connection to one peer; other connections are unaffected.
    pub fn close_peer(&self, addr: SocketAddr) {
        if self.conns.remove(&addr).is_some() {
            tracing::debug!("closed websocket connection to {}", addr);
        }
    }

    /// Number of live connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    fn spawn_connection(&self, ws: WebSocketStream<TcpStream>, peer: SocketAddr) {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE_DEPTH);
        self.conns.insert(peer, outbound_tx);
        tracing::debug!("websocket connection established with {}", peer);

        let transport = self.clone();
        tokio::spawn(async move {
            transport.run_connection(ws, peer, outbound_rx).await;
        });
    }

    async fn run_connection(
        &self,
        ws: WebSocketStream<TcpStream>,
        peer: SocketAddr,
        mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    ) {
        let (mut sink, mut stream) = ws.split();

        let writer = tokio::spawn(async move {
            while let Some(bytes) = outbound_rx.recv().await {
                if sink.send(Message::Binary(bytes)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    self.counters.record_recv(data.len());
                    // Backpressure: a full inbound queue stalls this
                    // connection's reads, not the whole transport.
                    if self.inbound_tx.send((data, peer)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("websocket read error from {}: {}", peer, e);
                    self.counters.record_recv_error();
                    break;
                }
            }
        }

        self.conns.remove(&peer);
        writer.abort();
        tracing::debug!("websocket connection with {} closed", peer);
    }
}

#[async_trait]
impl Transport for MessageTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        if buf.len() > self.max_message_size {
            self.counters.record_send_error();
            return Err(TransportError::MessageTooLarge {
                size: buf.len(),
                limit: self.max_message_size,
            });
        }

        let sender = self
            .conns
            .get(&addr)
            .map(|entry| entry.value().clone())
            .ok_or(TransportError::NoConnection(addr))?;

        match sender.send(buf.to_vec()).await {
            Ok(()) => {
                self.counters.record_send(buf.len());
                Ok(buf.len())
            }
            Err(_) => {
                self.counters.record_send_error();
                self.conns.remove(&addr);
                Err(TransportError::NoConnection(addr))
            }
        }
    }

    async fn recv(&self) -> TransportResult<(Vec<u8>, SocketAddr)> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn stop(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(handle) = self.accept_task.lock().await.take() {
            handle.abort();
        }
        self.conns.clear();
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

    async fn bind_local() -> MessageTransport {
        MessageTransport::bind("127.0.0.1:0".parse().unwrap(), 2 * 1024 * 1024)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_ws_bind() {
        let transport = bind_local().await;
        assert_ne!(transport.local_addr().unwrap().port(), 0);
    }

    #[tokio::test]
    async fn test_ws_connect_and_exchange() {
        let server = bind_local().await;
        let server_addr = server.local_addr().unwrap();
        let client = bind_local().await;

        let peer = client.connect(server_addr).await.unwrap();
        client.send_to(b"binary frame", peer).await.unwrap();

        let (data, from) = timeout(Duration::from_secs(2), server.recv())
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(data, b"binary frame");

        // Reply over the same connection
        server.send_to(b"reply", from).await.unwrap();
        let (data, _) = timeout(Duration::from_secs(2), client.recv())
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(data, b"reply");
    }

    #[tokio::test]
    async fn test_ws_send_to_unknown_peer() {
        let transport = bind_local().await;
        let result = transport
            .send_to(b"data", "127.0.0.1:1".parse().unwrap())
            .await;
        assert!(matches!(result, Err(TransportError::NoConnection(_))));
    }

    #[tokio::test]
    async fn test_ws_oversized_message_rejected() {
        let server = bind_local().await;
        let server_addr = server.local_addr().unwrap();
        let client = MessageTransport::bind("127.0.0.1:0".parse().unwrap(), 16)
            .await
            .unwrap();

        let peer = client.connect(server_addr).await.unwrap();
        let result = client.send_to(&[0u8; 64], peer).await;
        assert!(matches!(
            result,
            Err(TransportError::MessageTooLarge { size: 64, limit: 16 })
        ));
    }

    #[tokio::test]
    async fn test_ws_stop() {
        let transport = bind_local().await;
        transport.stop().await.unwrap();
        assert!(transport.is_closed());
        assert!(matches!(
            transport.recv().await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_ws_close_peer() {
        let server = bind_local().await;
        let server_addr = server.local_addr().unwrap();
        let client = bind_local().await;

        let peer = client.connect(server_addr).await.unwrap();
        client.send_to(b"ping", peer).await.unwrap();
        timeout(Duration::from_secs(2), server.recv())
            .await
            .expect("timeout")
            .unwrap();
        assert_eq!(client.connection_count(), 1);

        client.close_peer(peer);
        assert_eq!(client.connection_count(), 0);
        assert!(matches!(
            client.send_to(b"after close", peer).await,
            Err(TransportError::NoConnection(_))
        ));
    }
}
