//! Per-stream inbound state (spec.md §4.5 receive path and state
//! table), grounded on the teacher's `Streams::get_recv_mut`/
//! `Streams::read`/`Streams::read_unordered` call sites in
//! `connection.rs`.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::stream::assembler::Assembler;
use crate::ReadError;

/// Receive-side stream state (spec.md §4.5 state table).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RecvState {
    /// Covers both `idle` and `open`: still receiving, FIN not yet
    /// delivered.
    Recv,
    /// `hcrm`: FIN arrived in order and was delivered to the receive
    /// queue.
    DataRecvd,
    /// `clsd` via the normal path: application has drained every byte
    /// after `DataRecvd`.
    DataRead,
    /// `clsd` via RESET_STREAM, not yet delivered to the application.
    ResetRecvd { error_code: u64, final_offset: u64 },
    /// `clsd`: reset delivered to the application.
    ResetRead,
}

pub struct Recv {
    pub state: RecvState,
    assembler: Assembler,
    /// In-order bytes ready for the application; out-of-order
    /// fragments never appear here (spec.md §4.5).
    queue: VecDeque<Bytes>,
    /// Highest flow-control limit granted to the peer so far.
    pub max_data: u64,
    /// Total bytes the application has consumed via `read`, used by
    /// `do_stream_fc`'s half-window threshold.
    pub bytes_read: u64,
    pub stream_data_blocked_seen: bool,
}

impl Recv {
    pub fn new(initial_max_data: u64) -> Self {
        Recv {
            state: RecvState::Recv,
            assembler: Assembler::new(),
            queue: VecDeque::new(),
            max_data: initial_max_data,
            bytes_read: 0,
            stream_data_blocked_seen: false,
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.assembler.next_offset()
    }

    /// Handle an inbound STREAM frame (spec.md §4.4 "STREAM frame
    /// placement algorithm").
    pub fn ingest(&mut self, offset: u64, data: Bytes, fin: bool) -> Result<(), crate::TransportError> {
        if let RecvState::ResetRecvd { .. } | RecvState::ResetRead = self.state {
            return Ok(());
        }
        if let Some(final_size) = self.assembler.final_size() {
            let end = offset + data.len() as u64;
            if (fin && end != final_size) || end > final_size {
                return Err(crate::TransportError::FINAL_SIZE_ERROR);
            }
        }
        let (delivered, fin_ready) = self.assembler.insert(offset, data, fin);
        self.queue.extend(delivered);
        if fin_ready && self.state == RecvState::Recv {
            self.state = RecvState::DataRecvd;
        }
        Ok(())
    }

    pub fn reset(&mut self, error_code: u64, final_offset: u64) {
        if let RecvState::Recv = self.state {
            self.state = RecvState::ResetRecvd {
                error_code,
                final_offset,
            };
        }
    }

    /// `read_stream(s)` (spec.md §4.5 receive path): drain whatever is
    /// currently in the receive queue.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        if let RecvState::ResetRecvd { error_code, .. } = self.state {
            self.state = RecvState::ResetRead;
            return Err(ReadError::Reset(error_code));
        }
        let mut n = 0;
        while n < buf.len() {
            let chunk = match self.queue.front_mut() {
                Some(c) => c,
                None => break,
            };
            let take = std::cmp::min(buf.len() - n, chunk.len());
            buf[n..n + take].copy_from_slice(&chunk[..take]);
            n += take;
            self.bytes_read += take as u64;
            if take == chunk.len() {
                self.queue.pop_front();
            } else {
                *chunk = chunk.slice_from(take);
            }
        }
        if self.queue.is_empty() && self.state == RecvState::DataRecvd {
            self.state = RecvState::DataRead;
        }
        Ok(n)
    }

    pub fn read_unordered(&mut self) -> Option<(u64, Bytes)> {
        // Out-of-order bytes never reach the application per spec.md
        // §4.5; this only drains the in-order queue as one chunk.
        self.queue.pop_front().map(|b| (self.bytes_read, b))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, RecvState::DataRead | RecvState::ResetRead)
    }

    pub fn has_data(&self) -> bool {
        !self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_in_order_then_read() {
        let mut r = Recv::new(1000);
        r.ingest(0, Bytes::from_static(b"hi"), false).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(r.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn fin_moves_state_to_data_recvd_then_data_read_once_drained() {
        let mut r = Recv::new(1000);
        r.ingest(0, Bytes::from_static(b"hi"), true).unwrap();
        assert_eq!(r.state, RecvState::DataRecvd);
        let mut buf = [0u8; 2];
        r.read(&mut buf).unwrap();
        assert_eq!(r.read(&mut buf[..0]).unwrap(), 0);
    }

    #[test]
    fn reset_yields_reset_error_from_read() {
        let mut r = Recv::new(1000);
        r.reset(7, 0);
        let mut buf = [0u8; 1];
        match r.read(&mut buf) {
            Err(ReadError::Reset(code)) => assert_eq!(code, 7),
            _ => panic!("expected reset"),
        }
        assert_eq!(r.state, RecvState::ResetRead);
    }

    #[test]
    fn shrinking_final_size_is_rejected() {
        let mut r = Recv::new(1000);
        r.ingest(0, Bytes::from_static(b"hello"), true).unwrap();
        assert!(r.ingest(10, Bytes::from_static(b"x"), false).is_err());
    }
}
