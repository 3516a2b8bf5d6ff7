//! Inbound frame dispatch.
//!
//! Every buffer a transport delivers lands here: parse the frame, then
//! route by type — handshake frames to the handshake registry, data and
//! control frames to the owning session, pass-through ranges to the user
//! layer. Malformed input is dropped and counted, never propagated to the
//! application; anything that compromises a session's integrity closes
//! exactly that session.

use crate::codec::Value;
use crate::error::StreamError;
use crate::frame::{Frame, FrameFlags, FrameType};
use crate::handshake::ResponderHandshake;
use crate::node::node::{DisconnectReason, Node, NodeEvent, StreamCloseReason};
use crate::node::session::SessionHandle;
use crate::session::{Session, SessionId, SessionState, TransportKind};
use crate::stream::{InboundSegment, SegmentOutcome, StreamMode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use stt_crypto::SessionCipher;

impl Node {
    /// Handle one inbound buffer from a transport.
    pub(crate) async fn handle_incoming(
        &self,
        data: Vec<u8>,
        from: SocketAddr,
        kind: TransportKind,
    ) {
        let frame = match Frame::decode(&data, self.inner.config.max_frame_size) {
            Ok(frame) => frame,
            Err(e) => {
                // Malformed inbound data is recovered locally: dropped and
                // counted, never fatal to any session.
                self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("dropping malformed frame from {}: {}", from, e);
                return;
            }
        };

        match frame.frame_type {
            FrameType::Hello => self.handle_hello(frame, from, kind).await,
            FrameType::Challenge | FrameType::Confirm => {
                if !self.inner.handshakes.route_to_initiator(from, frame) {
                    self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("no initiator handshake pending for {}", from);
                }
            }
            FrameType::Proof => self.handle_proof(frame, from).await,
            FrameType::Data => self.handle_data(frame, data.len() as u64).await,
            FrameType::StreamOpen => self.handle_stream_open(frame, data.len() as u64).await,
            FrameType::StreamClose => self.handle_stream_close(frame, data.len() as u64).await,
            FrameType::Ack => self.handle_ack(frame, data.len() as u64).await,
            FrameType::Keepalive => self.handle_keepalive(frame, data.len() as u64),
            FrameType::Disconnect => self.handle_disconnect(frame, data.len() as u64).await,
            FrameType::Endpoint(byte) | FrameType::User(byte) => {
                self.handle_passthrough(frame, byte).await;
            }
            FrameType::Unknown(byte) => {
                self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("dropping frame with unknown type 0x{:02X}", byte);
            }
        }
    }

    async fn handle_hello(&self, frame: Frame, from: SocketAddr, kind: TransportKind) {
        if !self.inner.accept_inbound.load(Ordering::SeqCst) {
            tracing::debug!("inbound handshakes disabled; dropping HELLO from {}", from);
            return;
        }

        // Responders drop silently on any failed check.
        let (responder, challenge) =
            match ResponderHandshake::respond(&self.inner.crypto, self.inner.node_id, &frame) {
                Ok(pair) => pair,
                Err(e) => {
                    self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!("rejecting HELLO from {}: {}", from, e);
                    return;
                }
            };

        let bytes = match challenge.encode(self.inner.config.max_frame_size) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("challenge encode failed: {}", e);
                return;
            }
        };
        let Ok(transport) = self.transport_for(kind).await else {
            return;
        };
        if let Err(e) = transport.send_to(&bytes, from).await {
            tracing::debug!("challenge send to {} failed: {}", from, e);
            return;
        }

        self.inner.handshakes.insert_responder(
            from,
            responder,
            kind,
            Instant::now() + self.inner.config.handshake_timeout,
        );
        tracing::debug!("handshake challenge sent to {}", from);
    }

    async fn handle_proof(&self, frame: Frame, from: SocketAddr) {
        let Some(mut entry) = self.inner.handshakes.take_responder(from) else {
            self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("no responder handshake pending for {}", from);
            return;
        };

        let (confirm, outcome) = match entry.handshake.on_proof(&self.inner.crypto, &frame) {
            Ok(result) => result,
            Err(e) => {
                self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("rejecting proof from {}: {}", from, e);
                return;
            }
        };

        let bytes = match confirm.encode(self.inner.config.max_frame_size) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::debug!("confirm encode failed: {}", e);
                return;
            }
        };
        let Ok(transport) = self.transport_for(entry.transport_kind).await else {
            return;
        };
        if let Err(e) = transport.send_to(&bytes, from).await {
            tracing::debug!("confirm send to {} failed: {}", from, e);
            return;
        }

        let session = Session::new(
            outcome.session_id,
            outcome.peer_node_id,
            outcome.session_key,
            from,
            entry.transport_kind,
            self.inner.config.rotation,
        );
        let handle = Arc::new(SessionHandle::new(session));
        handle.with_session(|s| {
            let _ = s.transition_to(SessionState::Active);
        });
        self.inner.sessions.insert(handle);

        tracing::info!(
            session = %outcome.session_id,
            "session established with {} over {:?} (responder)",
            from,
            entry.transport_kind
        );
    }

    async fn handle_data(&self, frame: Frame, wire_len: u64) {
        let Some(handle) = self.lookup_session(frame.session_id) else {
            return;
        };
        handle.with_session(|s| s.record_received(wire_len));

        let stream_id = frame.stream_id;
        let stream = handle.stream_or_open(
            stream_id,
            StreamMode::Live,
            self.inner.config.reorder_buffer_limit,
            self.inner.config.flow_credits_initial,
        );

        let segment = InboundSegment {
            ciphertext: frame.payload,
            metadata: frame.metadata,
            flags: frame.flags.as_u8(),
            fin: frame.flags.is_fin(),
        };
        let outcome = stream.with_stream(|s| s.accept_segment(frame.sequence, segment));

        match outcome {
            Ok(SegmentOutcome::Duplicate | SegmentOutcome::AfterClose) => {
                tracing::trace!(
                    session = %handle.session_id,
                    "dropping duplicate/late segment {} on stream {}",
                    frame.sequence,
                    stream_id
                );
            }
            Ok(SegmentOutcome::Buffered) => {}
            Ok(SegmentOutcome::Ready(run)) => {
                self.deliver_run(&handle, &stream, run).await;
            }
            Err(StreamError::ReorderBufferOverflow { sequence, limit }) => {
                tracing::warn!(
                    session = %handle.session_id,
                    "reorder buffer overflow on stream {} (sequence {}, window {})",
                    stream_id,
                    sequence,
                    limit
                );
                // Closes the offending stream only; the session survives.
                stream.close();
                let payload = Value::Map(vec![
                    (Value::str("reason"), Value::Int(1)),
                    (Value::str("stream_id"), Value::Int(stream_id as i64)),
                ])
                .encode()
                .unwrap_or_default();
                let _ = self
                    .send_control(&handle, FrameType::StreamClose, payload)
                    .await;
                self.emit(NodeEvent::StreamClosed {
                    session_id: handle.session_id,
                    stream_id,
                    reason: StreamCloseReason::ReorderOverflow,
                })
                .await;
            }
            Err(e) => {
                stream.with_stream(|s| s.record_receive_error());
                tracing::debug!(session = %handle.session_id, "segment rejected: {}", e);
            }
        }
    }

    /// Decrypt and deliver an in-order run of segments. A decryption
    /// failure here is fatal to the session.
    async fn deliver_run(
        &self,
        handle: &Arc<SessionHandle>,
        stream: &Arc<crate::node::session::StreamHandle>,
        run: Vec<(u64, InboundSegment)>,
    ) {
        let session_id = handle.session_id;
        let stream_id = stream.stream_id;

        for (sequence, segment) in run {
            let fin = segment.fin;
            let sealed = Frame {
                frame_type: FrameType::Data,
                flags: match FrameFlags::from_byte(segment.flags) {
                    Ok(flags) => flags,
                    Err(_) => FrameFlags::new().with_encrypted(),
                },
                session_id,
                stream_id,
                sequence,
                metadata: segment.metadata,
                payload: segment.ciphertext,
            };

            match self.open_sealed(handle, &sealed, stream_id) {
                Ok(plaintext) => {
                    stream.with_stream(|s| s.record_delivered(plaintext.len() as u64));
                    if !plaintext.is_empty() {
                        self.emit(NodeEvent::Data {
                            session_id,
                            stream_id,
                            payload: plaintext,
                        })
                        .await;
                    }
                    if let Some(ack) = stream
                        .with_stream(|s| s.ack_due(self.inner.config.ack_segment_interval))
                    {
                        let _ = self.send_ack(handle, stream_id, ack).await;
                    }
                    if fin {
                        // Acknowledge everything up to and including FIN.
                        if let Some(ack) = stream.with_stream(|s| s.pending_ack()) {
                            let _ = self.send_ack(handle, stream_id, ack).await;
                        }
                        self.emit(NodeEvent::StreamClosed {
                            session_id,
                            stream_id,
                            reason: StreamCloseReason::Finished,
                        })
                        .await;
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        session = %session_id,
                        "segment decryption failed on stream {}: {}; closing session",
                        stream_id,
                        e
                    );
                    stream.with_stream(|s| s.record_receive_error());
                    handle.with_session(|s| s.record_receive_error());
                    self.close_session_inner(handle, DisconnectReason::CryptoFailure, true)
                        .await;
                    return;
                }
            }
        }
    }

    async fn handle_stream_open(&self, frame: Frame, wire_len: u64) {
        let Some((handle, map)) = self.open_control(frame, wire_len).await else {
            return;
        };
        let Some(stream_id) = map.map_get("stream_id").and_then(Value::as_int) else {
            self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let mode = map
            .map_get("mode")
            .and_then(Value::as_int)
            .and_then(StreamMode::from_code)
            .unwrap_or(StreamMode::Live);

        handle.stream_or_open(
            stream_id as u64,
            mode,
            self.inner.config.reorder_buffer_limit,
            self.inner.config.flow_credits_initial,
        );
    }

    async fn handle_stream_close(&self, frame: Frame, wire_len: u64) {
        let Some((handle, map)) = self.open_control(frame, wire_len).await else {
            return;
        };
        let Some(stream_id) = map.map_get("stream_id").and_then(Value::as_int) else {
            self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };
        let stream_id = stream_id as u64;

        if let Some(stream) = handle.stream(stream_id) {
            stream.close();
            self.emit(NodeEvent::StreamClosed {
                session_id: handle.session_id,
                stream_id,
                reason: StreamCloseReason::RemoteClose,
            })
            .await;
        }
    }

    async fn handle_ack(&self, frame: Frame, wire_len: u64) {
        let Some((handle, map)) = self.open_control(frame, wire_len).await else {
            return;
        };
        let (Some(stream_id), Some(ack)) = (
            map.map_get("stream_id").and_then(Value::as_int),
            map.map_get("ack").and_then(Value::as_int),
        ) else {
            self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if let Some(stream) = handle.stream(stream_id as u64) {
            let granted = stream.with_stream(|s| s.grant_ack(ack as u64));
            if granted > 0 {
                stream.credits.add_permits(granted as usize);
            }
        }
    }

    fn handle_keepalive(&self, frame: Frame, wire_len: u64) {
        if let Some(handle) = self.lookup_session(frame.session_id) {
            handle.with_session(|s| s.record_received(wire_len));
        }
    }

    async fn handle_disconnect(&self, frame: Frame, wire_len: u64) {
        let Some((handle, map)) = self.open_control(frame, wire_len).await else {
            return;
        };
        let reason = map
            .map_get("reason")
            .and_then(Value::as_int)
            .map_or(DisconnectReason::Normal, DisconnectReason::from_code);

        tracing::debug!(session = %handle.session_id, "peer disconnect: {:?}", reason);
        self.close_session_inner(&handle, reason, false).await;
    }

    /// Frames in the endpoint (0x20-0x22) and user (0x80-0xFF) ranges:
    /// decrypted when session-scoped, then handed to a registered handler
    /// or the event queue, never interpreted.
    async fn handle_passthrough(&self, frame: Frame, type_byte: u8) {
        let session_id = frame.session_id;
        let payload = if frame.flags.is_encrypted() {
            let Some(handle) = self.lookup_session(session_id) else {
                return;
            };
            handle.with_session(|s| s.record_received(frame.payload.len() as u64));
            match self.open_sealed(&handle, &frame, 0) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    tracing::warn!(
                        session = %session_id,
                        "pass-through decryption failed: {}; closing session",
                        e
                    );
                    handle.with_session(|s| s.record_receive_error());
                    self.close_session_inner(&handle, DisconnectReason::CryptoFailure, true)
                        .await;
                    return;
                }
            }
        } else {
            frame.payload
        };

        if let Some(handler) = self
            .inner
            .frame_handlers
            .get(&type_byte)
            .map(|entry| Arc::clone(entry.value()))
        {
            handler.on_frame(session_id, type_byte, &payload);
        } else {
            self.emit(NodeEvent::UserFrame {
                session_id,
                frame_type: type_byte,
                payload,
            })
            .await;
        }
    }

    /// Decrypt a session-scope control frame and parse its payload map.
    /// A decryption failure is fatal to the session, like any other.
    async fn open_control(
        &self,
        frame: Frame,
        wire_len: u64,
    ) -> Option<(Arc<SessionHandle>, Value)> {
        let handle = self.lookup_session(frame.session_id)?;
        handle.with_session(|s| s.record_received(wire_len));

        if !frame.flags.is_encrypted() {
            self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let plaintext = match self.open_sealed(&handle, &frame, 0) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                tracing::warn!(
                    session = %handle.session_id,
                    "control decryption failed: {}; closing session",
                    e
                );
                handle.with_session(|s| s.record_receive_error());
                self.close_session_inner(&handle, DisconnectReason::CryptoFailure, true)
                    .await;
                return None;
            }
        };

        match Value::decode(&plaintext) {
            Ok(map) => Some((handle, map)),
            Err(e) => {
                self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("malformed control payload: {}", e);
                None
            }
        }
    }

    /// Open a sealed payload with the session's receive key, retrying a
    /// bounded number of rotated key versions when rotation is enabled.
    pub(crate) fn open_sealed(
        &self,
        handle: &Arc<SessionHandle>,
        frame: &Frame,
        stream_scope: u64,
    ) -> std::result::Result<Vec<u8>, stt_crypto::CryptoError> {
        let ad_base = frame.associated_data();
        let (cipher, nonce, session_id) = handle.with_session(|s| {
            (s.recv_cipher(), s.recv_rotation_nonce(), s.session_id())
        });

        let ctx = cipher.stream_context(session_id.as_bytes(), stream_scope);
        let mut ad = ad_base.clone();
        ad.extend_from_slice(&nonce);
        let first_err = match ctx.open(&frame.payload, &frame.metadata, &ad) {
            Ok(plaintext) => return Ok(plaintext),
            Err(e) => e,
        };

        // The peer may have rotated its send key; try the next versions
        // and adopt the one that authenticates.
        let candidates = handle.with_session(|s| s.recv_rotation_candidates(&self.inner.crypto));
        for (key, version) in candidates {
            let ctx = SessionCipher::new(&key).stream_context(session_id.as_bytes(), stream_scope);
            let mut ad = ad_base.clone();
            ad.extend_from_slice(&version.to_le_bytes());
            if let Ok(plaintext) = ctx.open(&frame.payload, &frame.metadata, &ad) {
                handle.with_session(|s| s.commit_recv_rotation(key, version));
                return Ok(plaintext);
            }
        }
        Err(first_err)
    }

    fn lookup_session(&self, session_id: SessionId) -> Option<Arc<SessionHandle>> {
        match self.inner.sessions.get(session_id) {
            Some(handle) => Some(handle),
            None => {
                self.inner.frames_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(session = %session_id, "frame for unknown session dropped");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::config::NodeConfig;
    use crate::session::RotationPolicy;
    use std::time::Duration;

    fn rotating_config(node_seed: u8) -> NodeConfig {
        let mut config = NodeConfig::new(vec![node_seed; 32], vec![0x42; 32]);
        // Rotation enabled so the receive path searches rotated candidates,
        // with thresholds high enough that only explicit rotations occur.
        config.rotation = RotationPolicy {
            frames: Some(1_000_000),
            ..RotationPolicy::DISABLED
        };
        config
    }

    async fn next_event(node: &Node) -> NodeEvent {
        tokio::time::timeout(Duration::from_secs(5), node.receive())
            .await
            .expect("timed out waiting for event")
            .expect("event feed ended")
    }

    /// Several sender-side rotations elapse before the peer sees a frame —
    /// as if every rotation-boundary frame was lost in flight. The receiver
    /// must walk the candidate versions up to `MAX_ROTATION_SKEW` and adopt
    /// the one that authenticates.
    #[tokio::test]
    async fn test_receiver_recovers_from_rotation_burst() {
        let a = Node::new(rotating_config(0xAA)).unwrap();
        let b = Node::new(rotating_config(0xBB)).unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        let session = b.connect(a.local_addr().await.unwrap()).await.unwrap();

        let handle = b.session(session).unwrap();
        handle.with_session(|s| {
            for _ in 0..3 {
                s.rotate_send_key(&b.inner.crypto);
            }
        });
        assert_eq!(b.session_stats(session).unwrap().key_version, 3);

        // The next frame is sealed three versions ahead of the receiver's
        // current key; a single-step retry would strand the session.
        b.send_to_session(session, 1, b"after burst").await.unwrap();
        loop {
            match next_event(&a).await {
                NodeEvent::Data { payload, .. } => {
                    assert_eq!(payload, b"after burst");
                    break;
                }
                NodeEvent::SessionClosed { .. } => {
                    panic!("session closed instead of recovering from the burst")
                }
                _ => {}
            }
        }

        // The rotation was committed: traffic keeps flowing on the new key.
        b.send_to_session(session, 1, b"steady state").await.unwrap();
        loop {
            match next_event(&a).await {
                NodeEvent::Data { payload, .. } => {
                    assert_eq!(payload, b"steady state");
                    break;
                }
                NodeEvent::SessionClosed { .. } => panic!("session lost after recovery"),
                _ => {}
            }
        }

        b.stop().await.unwrap();
        a.stop().await.unwrap();
    }

    /// A frame sealed beyond the candidate window must stay undecryptable:
    /// the bounded search keeps a true authentication failure fatal.
    #[tokio::test]
    async fn test_rotation_skew_beyond_window_is_fatal() {
        let a = Node::new(rotating_config(0xAA)).unwrap();
        let b = Node::new(rotating_config(0xBB)).unwrap();
        a.start().await.unwrap();
        b.start().await.unwrap();

        let session = b.connect(a.local_addr().await.unwrap()).await.unwrap();

        let handle = b.session(session).unwrap();
        handle.with_session(|s| {
            for _ in 0..4 {
                s.rotate_send_key(&b.inner.crypto);
            }
        });

        b.send_to_session(session, 1, b"too far ahead").await.unwrap();
        loop {
            match next_event(&a).await {
                NodeEvent::SessionClosed { session_id, reason } => {
                    assert_eq!(session_id, session);
                    assert_eq!(reason, DisconnectReason::CryptoFailure);
                    break;
                }
                NodeEvent::Data { .. } => {
                    panic!("frame beyond the rotation window must not decrypt")
                }
                _ => {}
            }
        }
        assert!(a.session_stats(session).is_none());

        b.stop().await.unwrap();
        a.stop().await.unwrap();
    }
}

