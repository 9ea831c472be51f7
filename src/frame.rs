//! Frame vocabulary, encode/decode (spec.md §4.4).
//!
//! Grounded on the teacher's `frame.rs` call sites visible from
//! `connection.rs` (`frame::Stream{id,fin,offset,data}`, `frame::Ack`
//! iterated with `.iter()` over ranges, `frame::RstStream{id,error_code,
//! final_offset}`) generalized into a full `Frame` enum covering every
//! type RFC 9000 §19 defines, using the same `bytes::Buf`/`BufMut`-based
//! decode/encode split as `packet.rs`.

use std::collections::VecDeque;
use std::ops::RangeInclusive;

use bytes::{Buf, BufMut, Bytes};

use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::diet::Diet;
use crate::{StreamId, TransportError};

macro_rules! frame_types {
    ($($name:ident($val:expr),)*) => {
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
        pub enum FrameType {
            $($name,)*
            Stream(u8),
        }

        impl FrameType {
            pub fn code(self) -> u64 {
                match self {
                    $(FrameType::$name => $val,)*
                    FrameType::Stream(bits) => 0x08 | bits as u64,
                }
            }

            /// Index into the per-space frame bitset (spec.md §4.3);
            /// every STREAM subtype shares one slot.
            pub fn bitset_index(self) -> u32 {
                match self {
                    $(FrameType::$name => $val,)*
                    FrameType::Stream(_) => 0x08,
                }
            }
        }
    }
}

frame_types! {
    Padding(0x00),
    Ping(0x01),
    Ack(0x02),
    AckEcn(0x03),
    ResetStream(0x04),
    StopSending(0x05),
    Crypto(0x06),
    NewToken(0x07),
    MaxData(0x10),
    MaxStreamData(0x11),
    MaxStreamsBidi(0x12),
    MaxStreamsUni(0x13),
    DataBlocked(0x14),
    StreamDataBlocked(0x15),
    StreamsBlockedBidi(0x16),
    StreamsBlockedUni(0x17),
    NewConnectionId(0x18),
    RetireConnectionId(0x19),
    PathChallenge(0x1a),
    PathResponse(0x1b),
    ConnectionCloseQuic(0x1c),
    ConnectionCloseApp(0x1d),
    HandshakeDone(0x1e),
}

/// Which packet-number space a frame may legally appear in (spec.md
/// §4.4 decode contract step 1).
pub fn permitted_in_initial_or_handshake(ty: u64) -> bool {
    matches!(ty, 0x00 | 0x01 | 0x02 | 0x03 | 0x06 | 0x1c)
}

/// A single reassembled stream-data or crypto fragment, kept around in
/// `SentPacket` so a loss can re-enqueue exactly the bytes that were
/// lost without re-copying the whole send buffer.
#[derive(Debug, Clone)]
pub struct StreamMeta {
    pub id: StreamId,
    pub offsets: RangeInclusive<u64>,
    pub fin: bool,
}

/// A CRYPTO-frame fragment's range, tracked the same way per epoch.
#[derive(Debug, Clone)]
pub struct CryptoMeta {
    pub offsets: RangeInclusive<u64>,
}

#[derive(Debug, Clone)]
pub struct Ack {
    pub largest: u64,
    pub delay: u64,
    pub additional: Diet,
    pub ecn: Option<EcnCounts>,
}

#[derive(Debug, Copy, Clone, Default)]
pub struct EcnCounts {
    pub ect0: u64,
    pub ect1: u64,
    pub ce: u64,
}

impl Ack {
    /// Iterate the acknowledged packet-number ranges, highest first.
    pub fn iter(&self) -> impl Iterator<Item = RangeInclusive<u64>> + '_ {
        self.additional.iter().rev()
    }
}

#[derive(Debug, Clone)]
pub struct Stream {
    pub id: StreamId,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

#[derive(Debug, Clone)]
pub struct Close {
    pub error_code: u64,
    /// `Some(frame_type)` for the quic-error variant; `None` for the
    /// application-error variant.
    pub frame_type: Option<u64>,
    pub reason: Bytes,
}

impl Close {
    pub fn is_transport_layer(&self) -> bool {
        self.frame_type.is_some()
    }
}

/// A decoded frame, one variant per entry in the frame vocabulary
/// table (spec.md §4.4).
#[derive(Debug, Clone)]
pub enum Frame {
    Padding,
    Ping,
    Ack(Ack),
    ResetStream {
        id: StreamId,
        error_code: u64,
        final_offset: u64,
    },
    StopSending {
        id: StreamId,
        error_code: u64,
    },
    Crypto {
        offset: u64,
        data: Bytes,
    },
    NewToken {
        token: Bytes,
    },
    Stream(Stream),
    MaxData(u64),
    MaxStreamData {
        id: StreamId,
        offset: u64,
    },
    MaxStreams {
        dir: crate::Directionality,
        count: u64,
    },
    DataBlocked {
        offset: u64,
    },
    StreamDataBlocked {
        id: StreamId,
        offset: u64,
    },
    StreamsBlocked {
        dir: crate::Directionality,
        limit: u64,
    },
    NewConnectionId {
        sequence: u64,
        retire_prior_to: u64,
        id: crate::packet::ConnectionId,
        reset_token: [u8; crate::RESET_TOKEN_SIZE],
    },
    RetireConnectionId {
        sequence: u64,
    },
    PathChallenge([u8; crate::PATH_CHALLENGE_SIZE]),
    PathResponse([u8; crate::PATH_CHALLENGE_SIZE]),
    Close(Close),
    HandshakeDone,
}

impl Frame {
    pub fn ty(&self) -> FrameType {
        match self {
            Frame::Padding => FrameType::Padding,
            Frame::Ping => FrameType::Ping,
            Frame::Ack(a) => {
                if a.ecn.is_some() {
                    FrameType::AckEcn
                } else {
                    FrameType::Ack
                }
            }
            Frame::ResetStream { .. } => FrameType::ResetStream,
            Frame::StopSending { .. } => FrameType::StopSending,
            Frame::Crypto { .. } => FrameType::Crypto,
            Frame::NewToken { .. } => FrameType::NewToken,
            Frame::Stream(s) => {
                let mut bits = 0u8;
                if s.offset != 0 {
                    bits |= 0x04;
                }
                bits |= 0x02; // LEN set by default; encode() may special-case the last frame.
                if s.fin {
                    bits |= 0x01;
                }
                FrameType::Stream(bits)
            }
            Frame::MaxData(_) => FrameType::MaxData,
            Frame::MaxStreamData { .. } => FrameType::MaxStreamData,
            Frame::MaxStreams { dir, .. } => match dir {
                crate::Directionality::Bi => FrameType::MaxStreamsBidi,
                crate::Directionality::Uni => FrameType::MaxStreamsUni,
            },
            Frame::DataBlocked { .. } => FrameType::DataBlocked,
            Frame::StreamDataBlocked { .. } => FrameType::StreamDataBlocked,
            Frame::StreamsBlocked { dir, .. } => match dir {
                crate::Directionality::Bi => FrameType::StreamsBlockedBidi,
                crate::Directionality::Uni => FrameType::StreamsBlockedUni,
            },
            Frame::NewConnectionId { .. } => FrameType::NewConnectionId,
            Frame::RetireConnectionId { .. } => FrameType::RetireConnectionId,
            Frame::PathChallenge(_) => FrameType::PathChallenge,
            Frame::PathResponse(_) => FrameType::PathResponse,
            Frame::Close(c) => {
                if c.is_transport_layer() {
                    FrameType::ConnectionCloseQuic
                } else {
                    FrameType::ConnectionCloseApp
                }
            }
            Frame::HandshakeDone => FrameType::HandshakeDone,
        }
    }

    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(self, Frame::Ack(_) | Frame::Padding | Frame::Close(_))
    }

    /// Whether this frame demands the receiving space ACK immediately
    /// rather than wait for the coalescing timer (spec.md §4.3).
    pub fn wants_immediate_ack(&self) -> bool {
        matches!(
            self,
            Frame::HandshakeDone | Frame::Close(_) | Frame::PathResponse(_)
        ) || matches!(self, Frame::Stream(s) if s.fin)
    }
}

/// Iterator-style decoder over a plaintext packet payload (spec.md
/// §4.4 decode contract). Constructed per packet; callers loop
/// `next_frame` until `None`/error.
pub struct Iter<'a> {
    buf: &'a mut dyn Buf,
    epoch_restricted: bool,
}

impl<'a> Iter<'a> {
    pub fn new(buf: &'a mut dyn Buf, epoch_restricted: bool) -> Self {
        Iter {
            buf,
            epoch_restricted,
        }
    }

    pub fn has_remaining(&self) -> bool {
        self.buf.remaining() > 0
    }

    /// Decode one frame, or `Ok(None)` at `end` having consumed any
    /// trailing PADDING run.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        if self.buf.remaining() == 0 {
            return Ok(None);
        }
        let ty = self.buf.get_var().map_err(|_| TransportError::frame(0))?;
        if self.epoch_restricted && !permitted_in_initial_or_handshake(ty) {
            return Err(TransportError::frame(ty));
        }
        let frame = decode_body(ty, self.buf)?;
        Ok(Some(frame))
    }
}

fn decode_body(ty: u64, buf: &mut dyn Buf) -> Result<Frame, TransportError> {
    if ty == 0x02 || ty == 0x03 {
        // The (gap, range) arithmetic can underflow on a malicious
        // peer's ranges; spec.md §9 calls that out as a
        // PROTOCOL_VIOLATION specifically, distinct from an ACK frame
        // merely truncated short of its declared range-count (an
        // ordinary FRAME_ENCODING_ERROR).
        return Ok(Frame::Ack(decode_ack(ty == 0x03, buf).map_err(
            |e| match e {
                AckDecodeError::Truncated => TransportError::frame(ty),
                AckDecodeError::RangeUnderflow => TransportError::PROTOCOL_VIOLATION,
            },
        )?));
    }
    decode_body_inner(ty, buf).map_err(|_| TransportError::frame(ty))
}

fn decode_body_inner(ty: u64, buf: &mut dyn Buf) -> Result<Frame, UnexpectedEnd> {
    Ok(match ty {
        0x00 => {
            // Coalesce a run of PADDING into a single logical frame.
            while buf.remaining() > 0 && buf.bytes()[0] == 0 {
                buf.advance(1);
            }
            Frame::Padding
        }
        0x01 => Frame::Ping,
        0x04 => Frame::ResetStream {
            id: StreamId(buf.get_var()?),
            error_code: buf.get_var()?,
            final_offset: buf.get_var()?,
        },
        0x05 => Frame::StopSending {
            id: StreamId(buf.get_var()?),
            error_code: buf.get_var()?,
        },
        0x06 => {
            let offset = buf.get_var()?;
            let len = buf.get_var()? as usize;
            Frame::Crypto {
                offset,
                data: buf.get_bytes(len)?,
            }
        }
        0x07 => {
            let len = buf.get_var()? as usize;
            Frame::NewToken {
                token: buf.get_bytes(len)?,
            }
        }
        0x08..=0x0f => {
            let bits = ty as u8;
            let id = StreamId(buf.get_var()?);
            let offset = if bits & 0x04 != 0 { buf.get_var()? } else { 0 };
            let data = if bits & 0x02 != 0 {
                let len = buf.get_var()? as usize;
                buf.get_bytes(len)?
            } else {
                buf.get_bytes(buf.remaining())?
            };
            Frame::Stream(Stream {
                id,
                offset,
                fin: bits & 0x01 != 0,
                data,
            })
        }
        0x10 => Frame::MaxData(buf.get_var()?),
        0x11 => Frame::MaxStreamData {
            id: StreamId(buf.get_var()?),
            offset: buf.get_var()?,
        },
        0x12 => Frame::MaxStreams {
            dir: crate::Directionality::Bi,
            count: buf.get_var()?,
        },
        0x13 => Frame::MaxStreams {
            dir: crate::Directionality::Uni,
            count: buf.get_var()?,
        },
        0x14 => Frame::DataBlocked {
            offset: buf.get_var()?,
        },
        0x15 => Frame::StreamDataBlocked {
            id: StreamId(buf.get_var()?),
            offset: buf.get_var()?,
        },
        0x16 => Frame::StreamsBlocked {
            dir: crate::Directionality::Bi,
            limit: buf.get_var()?,
        },
        0x17 => Frame::StreamsBlocked {
            dir: crate::Directionality::Uni,
            limit: buf.get_var()?,
        },
        0x18 => {
            let sequence = buf.get_var()?;
            let retire_prior_to = buf.get_var()?;
            let len = buf.get::<u8>()? as usize;
            let bytes = buf.get_bytes(len)?;
            let mut reset_token = [0u8; crate::RESET_TOKEN_SIZE];
            let token_bytes = buf.get_bytes(crate::RESET_TOKEN_SIZE)?;
            reset_token.copy_from_slice(&token_bytes);
            Frame::NewConnectionId {
                sequence,
                retire_prior_to,
                id: crate::packet::ConnectionId::new(&bytes),
                reset_token,
            }
        }
        0x19 => Frame::RetireConnectionId {
            sequence: buf.get_var()?,
        },
        0x1a => {
            let bytes = buf.get_bytes(crate::PATH_CHALLENGE_SIZE)?;
            let mut out = [0u8; crate::PATH_CHALLENGE_SIZE];
            out.copy_from_slice(&bytes);
            Frame::PathChallenge(out)
        }
        0x1b => {
            let bytes = buf.get_bytes(crate::PATH_CHALLENGE_SIZE)?;
            let mut out = [0u8; crate::PATH_CHALLENGE_SIZE];
            out.copy_from_slice(&bytes);
            Frame::PathResponse(out)
        }
        0x1c | 0x1d => {
            let error_code = buf.get_var()?;
            let frame_type = if ty == 0x1c {
                Some(buf.get_var()?)
            } else {
                None
            };
            let len = buf.get_var()? as usize;
            Frame::Close(Close {
                error_code,
                frame_type,
                reason: buf.get_bytes(len)?,
            })
        }
        0x1e => Frame::HandshakeDone,
        _ => return Err(UnexpectedEnd),
    })
}

/// Distinguishes a merely-truncated ACK frame (ordinary wire error)
/// from a (gap, range) pair whose arithmetic underflows (spec.md §9:
/// "underflow ... is a protocol violation on decode").
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum AckDecodeError {
    Truncated,
    RangeUnderflow,
}

impl From<UnexpectedEnd> for AckDecodeError {
    fn from(_: UnexpectedEnd) -> Self {
        AckDecodeError::Truncated
    }
}

fn decode_ack(ecn: bool, buf: &mut dyn Buf) -> Result<Ack, AckDecodeError> {
    let largest = buf.get_var()?;
    let delay = buf.get_var()?;
    let range_count = buf.get_var()?;
    let first_range = buf.get_var()?;
    let mut additional = Diet::new();
    let mut hi = largest;
    let lo = largest
        .checked_sub(first_range)
        .ok_or(AckDecodeError::RangeUnderflow)?;
    for p in lo..=hi {
        additional.insert_one(p);
    }
    hi = lo;
    for _ in 0..range_count {
        let gap = buf.get_var()?;
        let range = buf.get_var()?;
        let this_hi = hi
            .checked_sub(gap + 2)
            .ok_or(AckDecodeError::RangeUnderflow)?;
        let this_lo = this_hi
            .checked_sub(range)
            .ok_or(AckDecodeError::RangeUnderflow)?;
        for p in this_lo..=this_hi {
            additional.insert_one(p);
        }
        hi = this_lo;
    }
    let ecn = if ecn {
        Some(EcnCounts {
            ect0: buf.get_var()?,
            ect1: buf.get_var()?,
            ce: buf.get_var()?,
        })
    } else {
        None
    };
    Ok(Ack {
        largest,
        delay,
        additional,
        ecn,
    })
}

/// Maximum number of (gap, range) blocks to emit in one ACK frame,
/// mirroring the teacher's `MAX_ACK_BLOCKS` cap on `pending_acks`.
pub const MAX_ACK_BLOCKS: usize = 256;

/// Encode every frame queued for transmission, in the order the
/// connection handed them to us; returns the byte length written.
pub fn encode_frame<B: BufMut>(frame: &Frame, buf: &mut B) {
    match frame {
        Frame::Padding => buf.put_u8(0x00),
        Frame::Ping => buf.put_u8(0x01),
        Frame::Ack(ack) => encode_ack(ack, buf),
        Frame::ResetStream {
            id,
            error_code,
            final_offset,
        } => {
            buf.write_var(0x04);
            buf.write_var(id.0);
            buf.write_var(*error_code);
            buf.write_var(*final_offset);
        }
        Frame::StopSending { id, error_code } => {
            buf.write_var(0x05);
            buf.write_var(id.0);
            buf.write_var(*error_code);
        }
        Frame::Crypto { offset, data } => {
            buf.write_var(0x06);
            buf.write_var(*offset);
            buf.write_var(data.len() as u64);
            buf.put_slice(data);
        }
        Frame::NewToken { token } => {
            buf.write_var(0x07);
            buf.write_var(token.len() as u64);
            buf.put_slice(token);
        }
        Frame::Stream(s) => encode_stream(s, buf, true),
        Frame::MaxData(limit) => {
            buf.write_var(0x10);
            buf.write_var(*limit);
        }
        Frame::MaxStreamData { id, offset } => {
            buf.write_var(0x11);
            buf.write_var(id.0);
            buf.write_var(*offset);
        }
        Frame::MaxStreams { dir, count } => {
            buf.write_var(match dir {
                crate::Directionality::Bi => 0x12,
                crate::Directionality::Uni => 0x13,
            });
            buf.write_var(*count);
        }
        Frame::DataBlocked { offset } => {
            buf.write_var(0x14);
            buf.write_var(*offset);
        }
        Frame::StreamDataBlocked { id, offset } => {
            buf.write_var(0x15);
            buf.write_var(id.0);
            buf.write_var(*offset);
        }
        Frame::StreamsBlocked { dir, limit } => {
            buf.write_var(match dir {
                crate::Directionality::Bi => 0x16,
                crate::Directionality::Uni => 0x17,
            });
            buf.write_var(*limit);
        }
        Frame::NewConnectionId {
            sequence,
            retire_prior_to,
            id,
            reset_token,
        } => {
            buf.write_var(0x18);
            buf.write_var(*sequence);
            buf.write_var(*retire_prior_to);
            buf.put_u8(id.len() as u8);
            buf.put_slice(id);
            buf.put_slice(reset_token);
        }
        Frame::RetireConnectionId { sequence } => {
            buf.write_var(0x19);
            buf.write_var(*sequence);
        }
        Frame::PathChallenge(data) => {
            buf.write_var(0x1a);
            buf.put_slice(data);
        }
        Frame::PathResponse(data) => {
            buf.write_var(0x1b);
            buf.put_slice(data);
        }
        Frame::Close(c) => {
            if let Some(ft) = c.frame_type {
                buf.write_var(0x1c);
                buf.write_var(c.error_code);
                buf.write_var(ft);
            } else {
                buf.write_var(0x1d);
                buf.write_var(c.error_code);
            }
            buf.write_var(c.reason.len() as u64);
            buf.put_slice(&c.reason);
        }
        Frame::HandshakeDone => buf.put_u8(0x1e),
    }
}

fn encode_stream<B: BufMut>(s: &Stream, buf: &mut B, with_len: bool) {
    let mut bits = 0x08u64;
    if s.offset != 0 {
        bits |= 0x04;
    }
    if with_len {
        bits |= 0x02;
    }
    if s.fin {
        bits |= 0x01;
    }
    buf.write_var(bits);
    buf.write_var(s.id.0);
    if s.offset != 0 {
        buf.write_var(s.offset);
    }
    if with_len {
        buf.write_var(s.data.len() as u64);
    }
    buf.put_slice(&s.data);
}

/// Size in bytes this STREAM frame will occupy when encoded with an
/// explicit length field, for packet-builder space accounting.
pub fn stream_frame_size(s: &Stream) -> usize {
    use crate::coding::varint_size;
    1 + varint_size(s.id.0)
        + if s.offset != 0 {
            varint_size(s.offset)
        } else {
            0
        }
        + varint_size(s.data.len() as u64)
        + s.data.len()
}

/// `gap = prev_lo - this_hi - 2` (spec.md §4.4 "ACK frame encode").
/// `ranges` come from `Diet::foreach_rev`, whose intervals are
/// disjoint and strictly decreasing, so `prev_lo > r.end() + 1`
/// always holds in practice; spec.md §9 calls for this to fail loudly
/// on encode rather than silently wrap or underflow.
fn ack_gap_and_range(prev_lo: u64, r: &RangeInclusive<u64>) -> (u64, u64) {
    debug_assert!(
        prev_lo > *r.end() + 1,
        "ACK range arithmetic underflow on encode: prev_lo={} this_hi={}",
        prev_lo,
        r.end()
    );
    (prev_lo - *r.end() - 2, *r.end() - *r.start())
}

fn encode_ack<B: BufMut>(ack: &Ack, buf: &mut B) {
    buf.write_var(if ack.ecn.is_some() { 0x03 } else { 0x02 });
    buf.write_var(ack.largest);
    buf.write_var(ack.delay);
    let mut ranges: VecDeque<RangeInclusive<u64>> = VecDeque::new();
    ack.additional.foreach_rev(|r| ranges.push_back(r));
    if ranges.len() > MAX_ACK_BLOCKS {
        ranges.truncate(MAX_ACK_BLOCKS);
    }
    buf.write_var((ranges.len().max(1) - 1) as u64);
    let first = ranges.pop_front().unwrap_or(ack.largest..=ack.largest);
    buf.write_var(*first.end() - *first.start());
    let mut prev_lo = *first.start();
    for r in ranges {
        let (gap, range) = ack_gap_and_range(prev_lo, &r);
        buf.write_var(gap);
        buf.write_var(range);
        prev_lo = *r.start();
    }
    if let Some(ecn) = ack.ecn {
        buf.write_var(ecn.ect0);
        buf.write_var(ecn.ect1);
        buf.write_var(ecn.ce);
    }
}

/// Build an ACK frame from a space's `recv` DIET (spec.md §4.4 "ACK
/// frame encode").
pub fn ack_from_recv(
    recv: &Diet,
    ack_delay_exponent: u8,
    now: u64,
    ecn: Option<EcnCounts>,
) -> Option<Ack> {
    let largest = recv.max()?;
    let timestamp = recv.timestamp(largest).unwrap_or(now);
    let delay = now.saturating_sub(timestamp) >> ack_delay_exponent;
    Some(Ack {
        largest,
        delay,
        additional: recv.clone(),
        ecn,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};

    #[test]
    fn stream_frame_roundtrip() {
        let s = Stream {
            id: StreamId(4),
            offset: 100,
            fin: true,
            data: Bytes::from_static(b"hello"),
        };
        let mut buf = BytesMut::new();
        encode_stream(&s, &mut buf, true);
        let mut cursor = buf.freeze();
        let ty = cursor.get_var().unwrap();
        let frame = decode_body(ty, &mut cursor).unwrap();
        match frame {
            Frame::Stream(got) => {
                assert_eq!(got.id, s.id);
                assert_eq!(got.offset, s.offset);
                assert!(got.fin);
                assert_eq!(&got.data[..], b"hello");
            }
            _ => panic!("wrong frame"),
        }
    }

    #[test]
    fn ack_roundtrip_with_gap() {
        let mut recv = Diet::new();
        for p in &[1u64, 2, 3, 7, 8] {
            recv.insert(*p, 0);
        }
        let ack = ack_from_recv(&recv, 0, 0, None).unwrap();
        let mut buf = BytesMut::new();
        encode_ack(&ack, &mut buf);
        let mut cursor = buf.freeze();
        let ty = cursor.get_var().unwrap();
        let decoded = match decode_body(ty, &mut cursor).unwrap() {
            Frame::Ack(a) => a,
            _ => panic!("wrong frame"),
        };
        assert_eq!(decoded.largest, 8);
        let ranges: Vec<_> = decoded.iter().collect();
        assert_eq!(ranges, vec![7..=8, 1..=3]);
    }

    #[test]
    fn padding_run_coalesces() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[0u8, 0, 0, 0x01]);
        let mut cursor = buf.freeze();
        let ty = cursor.get_var().unwrap();
        let frame = decode_body(ty, &mut cursor).unwrap();
        assert!(matches!(frame, Frame::Padding));
        // The PING byte should still be there for the next iteration.
        let ty = cursor.get_var().unwrap();
        assert!(matches!(decode_body(ty, &mut cursor).unwrap(), Frame::Ping));
    }

    #[test]
    fn initial_epoch_rejects_stream_frames() {
        let mut it_buf = {
            let mut b = BytesMut::new();
            b.write_var(0x08); // STREAM, no OFF/LEN/FIN
            b.write_var(0u64); // stream id
            b.put_slice(b"x");
            b.freeze()
        };
        let mut it = Iter::new(&mut it_buf, true);
        assert!(it.next_frame().is_err());
    }

    #[test]
    fn close_quic_vs_app_variant() {
        let app = Close {
            error_code: 7,
            frame_type: None,
            reason: Bytes::from_static(b"bye"),
        };
        let mut buf = BytesMut::new();
        encode_frame(&Frame::Close(app.clone()), &mut buf);
        assert_eq!(buf[0], 0x1d);

        let quic = Close {
            error_code: 7,
            frame_type: Some(0x08),
            reason: Bytes::new(),
        };
        let mut buf = BytesMut::new();
        encode_frame(&Frame::Close(quic), &mut buf);
        assert_eq!(buf[0], 0x1c);
    }

    #[test]
    fn ack_first_range_underflow_is_protocol_violation() {
        // largest=5, first_range=10: 5 - 10 underflows.
        let mut buf = BytesMut::new();
        buf.write_var(5u64); // largest
        buf.write_var(0u64); // delay
        buf.write_var(0u64); // range_count
        buf.write_var(10u64); // first_range > largest
        let mut cursor = buf.freeze();
        let err = decode_body(0x02, &mut cursor).unwrap_err();
        assert_eq!(err, TransportError::PROTOCOL_VIOLATION);
    }

    #[test]
    fn ack_gap_range_underflow_is_protocol_violation() {
        // largest=10, first_range=0 -> hi=10 after first block.
        // Then gap=20, range=0: hi.checked_sub(20 + 2) underflows.
        let mut buf = BytesMut::new();
        buf.write_var(10u64); // largest
        buf.write_var(0u64); // delay
        buf.write_var(1u64); // range_count
        buf.write_var(0u64); // first_range
        buf.write_var(20u64); // gap, too large
        buf.write_var(0u64); // range
        let mut cursor = buf.freeze();
        let err = decode_body(0x02, &mut cursor).unwrap_err();
        assert_eq!(err, TransportError::PROTOCOL_VIOLATION);
    }

    #[test]
    fn ack_truncated_is_frame_encoding_error_not_protocol_violation() {
        // Declares a range-count but the buffer ends before it.
        let mut buf = BytesMut::new();
        buf.write_var(10u64); // largest
        buf.write_var(0u64); // delay
        buf.write_var(1u64); // range_count
        buf.write_var(0u64); // first_range
        // missing (gap, range) pair
        let mut cursor = buf.freeze();
        let err = decode_body(0x02, &mut cursor).unwrap_err();
        assert_eq!(err, TransportError::frame(0x02));
    }

    #[test]
    #[should_panic(expected = "ACK range arithmetic underflow on encode")]
    fn ack_encode_asserts_on_range_underflow() {
        // `prev_lo=7`, `r=6..=7`: two touching intervals a well-formed
        // Diet would never produce, since adjacent intervals merge.
        // Exercises the encode-side boundary assertion from spec.md §9.
        let _ = ack_gap_and_range(7, &(6..=7));
    }
}
