//! Per-stream outbound state (spec.md §4.5 send path).
//!
//! Grounded on the teacher's stream-write call sites in
//! `connection.rs` (`Streams::write`, `.get_send_mut(id)`,
//! `needs_tx.insert(id)`), generalized into a standalone `Send` half
//! the way later quinn splits `stream.rs` into `send.rs`/`recv.rs`.

use std::collections::VecDeque;
use std::ops::Range;

use bytes::Bytes;

use crate::diet::Diet;
use crate::WriteError;

/// Send-side stream state (spec.md §4.5 state table, send-side column:
/// "hclo after FIN emitted, clsd after all data acked + peer half
/// closed").
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SendState {
    Ready,
    /// FIN has been queued or sent; no new writes are accepted.
    DataSent,
    ResetSent,
    DataRecvd,
    ResetRecvd,
}

#[derive(Debug, Clone)]
struct Buffered {
    offset: u64,
    data: Bytes,
}

/// One stream's outbound half: a write-once-ordered byte stream plus
/// the bookkeeping needed to (re)send exactly the ranges that haven't
/// been acked yet.
pub struct Send {
    pub state: SendState,
    /// Total bytes ever queued via `write` (the offset the next write
    /// starts at).
    offset: u64,
    /// Flow-control limit granted by the peer for this stream
    /// (spec.md §4.5 "do_stream_fc").
    pub max_data: u64,
    pub fin_offset: Option<u64>,
    fin_sent: bool,
    fin_acked: bool,
    buffered: VecDeque<Buffered>,
    /// Ranges not yet placed into any sent packet: initially the tail
    /// past the last send cursor, plus anything re-enqueued after a
    /// loss.
    pending: VecDeque<Range<u64>>,
    send_cursor: u64,
    acked: Diet,
    pub stop_reason: Option<u64>,
    /// Set when a DATA_BLOCKED-class condition applies and a
    /// STREAM_DATA_BLOCKED frame needs sending.
    pub stream_data_blocked: bool,
}

impl Send {
    pub fn new() -> Self {
        Send {
            state: SendState::Ready,
            offset: 0,
            max_data: 0,
            fin_offset: None,
            fin_sent: false,
            fin_acked: false,
            buffered: VecDeque::new(),
            pending: VecDeque::new(),
            send_cursor: 0,
            acked: Diet::new(),
            stop_reason: None,
            stream_data_blocked: false,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.state == SendState::Ready
    }

    /// `write(buffers, fin)` (spec.md §4.5 send path): appends `data`
    /// to the out queue; if `fin`, marks the tail `is_fin`. Returns
    /// `false` if the stream is not in a writable state.
    pub fn write(&mut self, data: Bytes, fin: bool) -> Result<usize, WriteError> {
        if !self.is_writable() {
            return Err(WriteError::Stopped(self.stop_reason.unwrap_or(0)));
        }
        let len = data.len() as u64;
        if len > self.max_data.saturating_sub(self.offset) {
            self.stream_data_blocked = true;
            return Err(WriteError::Blocked);
        }
        let start = self.offset;
        if len > 0 {
            self.pending.push_back(start..start + len);
            self.buffered.push_back(Buffered { offset: start, data });
            self.offset += len;
        }
        if fin {
            self.fin_offset = Some(self.offset);
            self.state = SendState::DataSent;
        }
        Ok(len as usize)
    }

    pub fn total_queued(&self) -> u64 {
        self.offset
    }

    /// Pull the next chunk to place in an outgoing packet, up to
    /// `max_len` bytes. Returns `(offset, bytes, fin)`.
    pub fn poll_transmit(&mut self, max_len: usize) -> Option<(u64, Bytes, bool)> {
        let range = self.pending.front()?.clone();
        let take = std::cmp::min(max_len as u64, range.end - range.start);
        if take == 0 {
            return None;
        }
        let data = self.slice(range.start, take);
        if take == range.end - range.start {
            self.pending.pop_front();
        } else {
            self.pending[0].start += take;
        }
        self.send_cursor = self.send_cursor.max(range.start + take);
        let fin = self.fin_offset == Some(range.start + take) && self.pending.is_empty();
        if fin {
            self.fin_sent = true;
        }
        Some((range.start, data, fin))
    }

    fn slice(&self, offset: u64, len: u64) -> Bytes {
        for b in &self.buffered {
            let b_end = b.offset + b.data.len() as u64;
            if b.offset <= offset && offset + len <= b_end {
                let start = (offset - b.offset) as usize;
                return b.data.slice(start, start + len as usize);
            }
        }
        Bytes::new()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Re-enqueue a range the recovery module declared lost (spec.md
    /// §4.6 "Losses feed ... mark packets for retransmission").
    pub fn requeue_lost(&mut self, range: Range<u64>, fin: bool) {
        if range.start < range.end {
            self.pending.push_front(range);
        }
        if fin && self.state == SendState::DataSent {
            self.fin_sent = false;
        }
    }

    /// A byte range was acknowledged by the peer.
    pub fn on_range_acked(&mut self, range: Range<u64>) {
        let mut x = range.start;
        while x < range.end {
            self.acked.insert_one(x);
            x += 1;
        }
        if self.all_acked() {
            self.state = match self.state {
                SendState::DataSent => SendState::DataRecvd,
                other => other,
            };
        }
    }

    pub fn on_fin_acked(&mut self) {
        self.fin_acked = true;
        if self.all_acked() {
            self.state = SendState::DataRecvd;
        }
    }

    fn all_acked(&self) -> bool {
        if self.offset == 0 {
            return self.fin_offset.is_some() && self.fin_acked;
        }
        let fully = self.acked.min_ival() == Some(0..=self.offset - 1);
        fully && (self.fin_offset.is_none() || self.fin_acked)
    }

    pub fn reset(&mut self, error_code: u64) {
        self.state = SendState::ResetSent;
        self.pending.clear();
    }

    pub fn on_reset_acked(&mut self) {
        self.state = SendState::ResetRecvd;
    }

    pub fn stop(&mut self, error_code: u64) {
        self.stop_reason = Some(error_code);
        self.state = SendState::ResetSent;
        self.pending.clear();
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, SendState::DataRecvd | SendState::ResetRecvd)
    }
}

impl Default for Send {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_poll_transmit_returns_whole_chunk() {
        let mut s = Send::new();
        s.max_data = 100;
        s.write(Bytes::from_static(b"hello"), false).unwrap();
        let (offset, data, fin) = s.poll_transmit(1024).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(&data[..], b"hello");
        assert!(!fin);
    }

    #[test]
    fn fin_flag_propagates_once_pending_drains() {
        let mut s = Send::new();
        s.max_data = 100;
        s.write(Bytes::from_static(b"bye"), true).unwrap();
        let (_, _, fin) = s.poll_transmit(1024).unwrap();
        assert!(fin);
        assert_eq!(s.state, SendState::DataSent);
    }

    #[test]
    fn write_beyond_flow_control_limit_blocks() {
        let mut s = Send::new();
        s.max_data = 2;
        let err = s.write(Bytes::from_static(b"hello"), false).unwrap_err();
        assert!(matches!(err, WriteError::Blocked));
        assert!(s.stream_data_blocked);
    }

    #[test]
    fn acking_all_bytes_transitions_to_data_recvd() {
        let mut s = Send::new();
        s.max_data = 100;
        s.write(Bytes::from_static(b"hi"), true).unwrap();
        s.poll_transmit(1024).unwrap();
        s.on_range_acked(0..2);
        s.on_fin_acked();
        assert_eq!(s.state, SendState::DataRecvd);
    }

    #[test]
    fn lost_range_is_requeued_for_retransmission() {
        let mut s = Send::new();
        s.max_data = 100;
        s.write(Bytes::from_static(b"hello"), false).unwrap();
        s.poll_transmit(1024).unwrap();
        assert!(!s.has_pending());
        s.requeue_lost(0..5, false);
        assert!(s.has_pending());
        let (offset, data, _) = s.poll_transmit(1024).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(&data[..], b"hello");
    }
}
