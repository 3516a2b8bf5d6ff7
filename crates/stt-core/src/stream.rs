//! Ordered, reliable, encrypted byte channels within a session.
//!
//! A stream cuts outbound bytes into sequenced segments (one DATA frame
//! each) and reassembles inbound segments through a bounded reorder buffer,
//! delivering a gap-free byte stream to the application.
//!
//! The send counter is advanced with peek/commit: a segment's sequence is
//! only committed after the transport accepted it, so a cancelled send can
//! never leave a gap in the sequence space.

use crate::error::StreamError;
use crate::session::SessionId;
use std::collections::BTreeMap;

/// Stream lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Open for sending and receiving
    Open,
    /// Local close requested; draining
    Closing,
    /// Terminal; the id is never reused
    Closed,
}

/// Stream delivery modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// No terminal marker; only an explicit close ends the stream
    Live,
    /// `end` emits a final segment; the stream completes once everything
    /// before it has been delivered
    Bounded,
}

impl StreamMode {
    /// Wire code used in STREAM_OPEN payloads
    #[must_use]
    pub fn as_code(self) -> i64 {
        match self {
            Self::Live => 0,
            Self::Bounded => 1,
        }
    }

    /// Parse a wire code
    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Live),
            1 => Some(Self::Bounded),
            _ => None,
        }
    }
}

/// An inbound segment held until its turn in the delivery order.
///
/// Ciphertext stays sealed inside the buffer; decryption happens in
/// delivery order.
#[derive(Debug, Clone)]
pub struct InboundSegment {
    /// Sealed segment bytes
    pub ciphertext: Vec<u8>,
    /// Opaque crypto metadata from the frame
    pub metadata: Vec<u8>,
    /// Raw flags byte from the frame header
    pub flags: u8,
    /// Final-segment marker
    pub fin: bool,
}

/// What became of an accepted segment
#[derive(Debug)]
pub enum SegmentOutcome {
    /// Already delivered or already buffered; dropped silently
    Duplicate,
    /// Arrived after the stream closed; dropped and counted
    AfterClose,
    /// Ahead of the delivery cursor; parked in the reorder buffer
    Buffered,
    /// The delivery cursor advanced: these segments are ready, in order
    Ready(Vec<(u64, InboundSegment)>),
}

/// Per-stream state machine.
pub struct Stream {
    stream_id: u64,
    session_id: SessionId,
    state: StreamState,
    mode: StreamMode,
    next_send_seq: u64,
    next_expected_recv_seq: u64,
    reorder: BTreeMap<u64, InboundSegment>,
    reorder_limit: u64,
    bytes_sent: u64,
    bytes_received: u64,
    segments_sent: u64,
    segments_received: u64,
    duplicate_segments: u64,
    receive_errors: u64,
    ended: bool,
    fin_delivered: bool,
    delivered_unacked: u64,
    acked_in: u64,
}

impl Stream {
    /// Create a stream within a session
    #[must_use]
    pub fn new(stream_id: u64, session_id: SessionId, mode: StreamMode, reorder_limit: u64) -> Self {
        Self {
            stream_id,
            session_id,
            state: StreamState::Open,
            mode,
            next_send_seq: 0,
            next_expected_recv_seq: 0,
            reorder: BTreeMap::new(),
            reorder_limit,
            bytes_sent: 0,
            bytes_received: 0,
            segments_sent: 0,
            segments_received: 0,
            duplicate_segments: 0,
            receive_errors: 0,
            ended: false,
            fin_delivered: false,
            delivered_unacked: 0,
            acked_in: 0,
        }
    }

    /// Stream id
    #[must_use]
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    /// Owning session's id
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Delivery mode
    #[must_use]
    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    /// Whether a bounded stream's local `end` has been sent
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Next sequence the receive side will deliver
    #[must_use]
    pub fn next_expected_recv_seq(&self) -> u64 {
        self.next_expected_recv_seq
    }

    /// Plaintext bytes delivered to the application
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Plaintext bytes accepted from the application
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Check that the stream accepts outbound data.
    ///
    /// # Errors
    ///
    /// `StreamError::Closed` after close, `StreamError::Ended` after a
    /// bounded `end`.
    pub fn ensure_sendable(&self) -> Result<(), StreamError> {
        match self.state {
            StreamState::Open => {
                if self.ended {
                    Err(StreamError::Ended)
                } else {
                    Ok(())
                }
            }
            StreamState::Closing | StreamState::Closed => Err(StreamError::Closed),
        }
    }

    /// Sequence the next outbound segment would take, without committing it.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::SequenceExhausted` if the counter would wrap;
    /// such a stream must be closed.
    pub fn peek_send_seq(&self) -> Result<u64, StreamError> {
        if self.next_send_seq == u64::MAX {
            return Err(StreamError::SequenceExhausted);
        }
        Ok(self.next_send_seq)
    }

    /// Commit one sent segment: advance the counter by exactly 1.
    pub fn commit_segment_sent(&mut self, bytes: u64) {
        self.next_send_seq += 1;
        self.segments_sent += 1;
        self.bytes_sent += bytes;
    }

    /// Mark a bounded stream ended after its final segment was sent.
    pub fn mark_ended(&mut self) {
        self.ended = true;
    }

    /// Enter the closing state
    pub fn begin_close(&mut self) {
        if self.state == StreamState::Open {
            self.state = StreamState::Closing;
        }
    }

    /// Enter the terminal state and drop any undelivered segments
    pub fn finish_close(&mut self) {
        self.state = StreamState::Closed;
        self.reorder.clear();
    }

    /// Accept an inbound segment.
    ///
    /// Duplicates are dropped, future segments are buffered, and the
    /// in-order run starting at the delivery cursor is returned for
    /// decryption.
    ///
    /// # Errors
    ///
    /// Returns `StreamError::ReorderBufferOverflow` when the segment lies
    /// beyond the reorder window; the caller must close this stream (and
    /// only this stream).
    pub fn accept_segment(
        &mut self,
        sequence: u64,
        segment: InboundSegment,
    ) -> Result<SegmentOutcome, StreamError> {
        if self.state == StreamState::Closed {
            self.receive_errors += 1;
            return Ok(SegmentOutcome::AfterClose);
        }

        if sequence < self.next_expected_recv_seq {
            self.duplicate_segments += 1;
            return Ok(SegmentOutcome::Duplicate);
        }

        if sequence > self.next_expected_recv_seq {
            if sequence - self.next_expected_recv_seq > self.reorder_limit {
                self.receive_errors += 1;
                return Err(StreamError::ReorderBufferOverflow {
                    sequence,
                    limit: self.reorder_limit,
                });
            }
            if self.reorder.insert(sequence, segment).is_some() {
                self.duplicate_segments += 1;
                return Ok(SegmentOutcome::Duplicate);
            }
            return Ok(SegmentOutcome::Buffered);
        }

        // The cursor segment is here: drain the contiguous run.
        let mut ready = vec![(sequence, segment)];
        self.next_expected_recv_seq += 1;
        while let Some(next) = self.reorder.remove(&self.next_expected_recv_seq) {
            ready.push((self.next_expected_recv_seq, next));
            self.next_expected_recv_seq += 1;
        }
        self.segments_received += ready.len() as u64;

        if ready.iter().any(|(_, s)| s.fin) {
            self.fin_delivered = true;
            self.state = StreamState::Closed;
        }

        Ok(SegmentOutcome::Ready(ready))
    }

    /// Record one delivered plaintext segment
    pub fn record_delivered(&mut self, bytes: u64) {
        self.bytes_received += bytes;
        self.delivered_unacked += 1;
    }

    /// Record a receive-path error
    pub fn record_receive_error(&mut self) {
        self.receive_errors += 1;
    }

    /// ACK point if the segment-count cadence is due; resets the counter.
    pub fn ack_due(&mut self, every: u64) -> Option<u64> {
        if self.delivered_unacked >= every {
            self.delivered_unacked = 0;
            Some(self.next_expected_recv_seq)
        } else {
            None
        }
    }

    /// ACK point if any deliveries are unacknowledged; resets the counter.
    /// Used by the periodic flush.
    pub fn pending_ack(&mut self) -> Option<u64> {
        if self.delivered_unacked > 0 {
            self.delivered_unacked = 0;
            Some(self.next_expected_recv_seq)
        } else {
            None
        }
    }

    /// Apply a peer ACK; returns the number of flow credits to restore.
    #[must_use]
    pub fn grant_ack(&mut self, ack_up_to: u64) -> u64 {
        let ack_up_to = ack_up_to.min(self.next_send_seq);
        let granted = ack_up_to.saturating_sub(self.acked_in);
        self.acked_in = self.acked_in.max(ack_up_to);
        granted
    }

    /// Whether a bounded stream has fully completed on the receive side
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.fin_delivered && self.reorder.is_empty()
    }

    /// Statistics snapshot
    #[must_use]
    pub fn stats(&self) -> StreamStats {
        StreamStats {
            state: self.state,
            mode: self.mode,
            next_send_seq: self.next_send_seq,
            next_expected_recv_seq: self.next_expected_recv_seq,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            segments_sent: self.segments_sent,
            segments_received: self.segments_received,
            duplicate_segments: self.duplicate_segments,
            receive_errors: self.receive_errors,
            reorder_buffered: self.reorder.len(),
        }
    }
}

/// Stream statistics snapshot
#[derive(Debug, Clone)]
pub struct StreamStats {
    /// Current state
    pub state: StreamState,
    /// Delivery mode
    pub mode: StreamMode,
    /// Next outbound sequence
    pub next_send_seq: u64,
    /// Receive delivery cursor
    pub next_expected_recv_seq: u64,
    /// Plaintext bytes sent
    pub bytes_sent: u64,
    /// Plaintext bytes delivered
    pub bytes_received: u64,
    /// Segments sent
    pub segments_sent: u64,
    /// Segments delivered
    pub segments_received: u64,
    /// Duplicates dropped
    pub duplicate_segments: u64,
    /// Receive-path errors
    pub receive_errors: u64,
    /// Segments parked in the reorder buffer
    pub reorder_buffered: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(mode: StreamMode) -> Stream {
        Stream::new(1, SessionId::from_bytes([7; 8]), mode, 64)
    }

    fn segment(tagged: u8) -> InboundSegment {
        InboundSegment {
            ciphertext: vec![tagged; 3],
            metadata: vec![0; 24],
            flags: 0x01,
            fin: false,
        }
    }

    fn fin_segment() -> InboundSegment {
        InboundSegment {
            fin: true,
            ..segment(0xFF)
        }
    }

    fn ready_seqs(outcome: SegmentOutcome) -> Vec<u64> {
        match outcome {
            SegmentOutcome::Ready(run) => run.into_iter().map(|(seq, _)| seq).collect(),
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn test_in_order_delivery() {
        let mut s = stream(StreamMode::Live);
        assert_eq!(ready_seqs(s.accept_segment(0, segment(0)).unwrap()), [0]);
        assert_eq!(ready_seqs(s.accept_segment(1, segment(1)).unwrap()), [1]);
        assert_eq!(s.next_expected_recv_seq(), 2);
    }

    #[test]
    fn test_reorder_delivery() {
        // Segments arrive 1, 0, 2: the application still sees 0, 1, 2.
        let mut s = stream(StreamMode::Live);
        assert!(matches!(
            s.accept_segment(1, segment(1)).unwrap(),
            SegmentOutcome::Buffered
        ));
        assert_eq!(
            ready_seqs(s.accept_segment(0, segment(0)).unwrap()),
            [0, 1]
        );
        assert_eq!(ready_seqs(s.accept_segment(2, segment(2)).unwrap()), [2]);
        assert_eq!(s.next_expected_recv_seq(), 3);
    }

    #[test]
    fn test_duplicate_dropped() {
        let mut s = stream(StreamMode::Live);
        assert_eq!(ready_seqs(s.accept_segment(0, segment(0)).unwrap()), [0]);
        assert!(matches!(
            s.accept_segment(0, segment(0)).unwrap(),
            SegmentOutcome::Duplicate
        ));
        assert_eq!(s.stats().duplicate_segments, 1);
        assert_eq!(s.stats().segments_received, 1);
    }

    #[test]
    fn test_duplicate_in_reorder_buffer_dropped() {
        let mut s = stream(StreamMode::Live);
        assert!(matches!(
            s.accept_segment(5, segment(5)).unwrap(),
            SegmentOutcome::Buffered
        ));
        assert!(matches!(
            s.accept_segment(5, segment(5)).unwrap(),
            SegmentOutcome::Duplicate
        ));
    }

    #[test]
    fn test_reorder_overflow() {
        let mut s = Stream::new(1, SessionId::from_bytes([7; 8]), StreamMode::Live, 4);
        assert!(matches!(
            s.accept_segment(4, segment(4)).unwrap(),
            SegmentOutcome::Buffered
        ));
        assert!(matches!(
            s.accept_segment(5, segment(5)),
            Err(StreamError::ReorderBufferOverflow { sequence: 5, limit: 4 })
        ));
    }

    #[test]
    fn test_segment_after_close_counted() {
        let mut s = stream(StreamMode::Live);
        s.finish_close();
        assert!(matches!(
            s.accept_segment(0, segment(0)).unwrap(),
            SegmentOutcome::AfterClose
        ));
        assert_eq!(s.stats().receive_errors, 1);
    }

    #[test]
    fn test_fin_closes_stream() {
        let mut s = stream(StreamMode::Bounded);
        assert_eq!(ready_seqs(s.accept_segment(0, segment(0)).unwrap()), [0]);
        let run = ready_seqs(s.accept_segment(1, fin_segment()).unwrap());
        assert_eq!(run, [1]);
        assert_eq!(s.state(), StreamState::Closed);
        assert!(s.is_finished());
    }

    #[test]
    fn test_fin_out_of_order_completes_after_predecessors() {
        let mut s = stream(StreamMode::Bounded);
        // Final segment (seq 2) arrives first.
        assert!(matches!(
            s.accept_segment(2, fin_segment()).unwrap(),
            SegmentOutcome::Buffered
        ));
        assert_eq!(s.state(), StreamState::Open);

        assert!(matches!(
            s.accept_segment(1, segment(1)).unwrap(),
            SegmentOutcome::Buffered
        ));
        let run = ready_seqs(s.accept_segment(0, segment(0)).unwrap());
        assert_eq!(run, [0, 1, 2]);
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[test]
    fn test_send_sequencing_peek_commit() {
        let mut s = stream(StreamMode::Live);
        assert_eq!(s.peek_send_seq().unwrap(), 0);
        // A cancelled send never commits: peek again yields the same value.
        assert_eq!(s.peek_send_seq().unwrap(), 0);

        s.commit_segment_sent(100);
        assert_eq!(s.peek_send_seq().unwrap(), 1);
        assert_eq!(s.bytes_sent(), 100);
    }

    #[test]
    fn test_ended_stream_rejects_send() {
        let mut s = stream(StreamMode::Bounded);
        assert!(s.ensure_sendable().is_ok());
        s.mark_ended();
        assert!(matches!(s.ensure_sendable(), Err(StreamError::Ended)));
    }

    #[test]
    fn test_closed_stream_rejects_send() {
        let mut s = stream(StreamMode::Live);
        s.begin_close();
        assert!(matches!(s.ensure_sendable(), Err(StreamError::Closed)));
        s.finish_close();
        assert!(matches!(s.ensure_sendable(), Err(StreamError::Closed)));
    }

    #[test]
    fn test_ack_cadence() {
        let mut s = stream(StreamMode::Live);
        for seq in 0..3u64 {
            let _ = s.accept_segment(seq, segment(seq as u8)).unwrap();
            s.record_delivered(3);
        }
        assert!(s.ack_due(4).is_none());
        let _ = s.accept_segment(3, segment(3)).unwrap();
        s.record_delivered(3);
        assert_eq!(s.ack_due(4), Some(4));
        // Counter reset after emission
        assert!(s.ack_due(4).is_none());
        assert!(s.pending_ack().is_none());
    }

    #[test]
    fn test_pending_ack_flush() {
        let mut s = stream(StreamMode::Live);
        let _ = s.accept_segment(0, segment(0)).unwrap();
        s.record_delivered(3);
        assert_eq!(s.pending_ack(), Some(1));
        assert!(s.pending_ack().is_none());
    }

    #[test]
    fn test_grant_ack_credits() {
        let mut s = stream(StreamMode::Live);
        for _ in 0..5 {
            let seq = s.peek_send_seq().unwrap();
            assert_eq!(seq, s.stats().next_send_seq);
            s.commit_segment_sent(10);
        }

        assert_eq!(s.grant_ack(3), 3);
        // Re-delivered ACK grants nothing new
        assert_eq!(s.grant_ack(3), 0);
        assert_eq!(s.grant_ack(5), 2);
        // ACK beyond what was sent is clamped
        assert_eq!(s.grant_ack(100), 0);
    }

    #[test]
    fn test_sequence_exhaustion() {
        let mut s = stream(StreamMode::Live);
        s.next_send_seq = u64::MAX;
        assert!(matches!(
            s.peek_send_seq(),
            Err(StreamError::SequenceExhausted)
        ));
    }
}
