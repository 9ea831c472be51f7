//! QUIC packet headers: connection IDs, packet numbers and the
//! long-header/short-header layouts named in spec.md §6 ("Wire
//! format"). Header *protection* and the packet AEAD are external
//! collaborators (spec.md §1) — this module only carries the
//! already-authenticated plaintext header fields the frame codec and
//! packet-number spaces need.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::{Side, MAX_CID_SIZE, VERSION};

/// An opaque connection identifier, 0 to 20 bytes (spec.md §6).
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    pub fn new(data: &[u8]) -> Self {
        assert!(data.len() <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        ConnectionId {
            len: data.len() as u8,
            bytes,
        }
    }

    pub fn random<R: rand::RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut bytes = [0; MAX_CID_SIZE];
        rng.fill_bytes(&mut bytes[..len]);
        ConnectionId {
            len: len as u8,
            bytes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn decode(buf: &mut impl Buf, len: usize) -> Result<Self, UnexpectedEnd> {
        if len > MAX_CID_SIZE || buf.remaining() < len {
            return Err(UnexpectedEnd);
        }
        let mut bytes = [0; MAX_CID_SIZE];
        bytes[..len].copy_from_slice(&buf.bytes()[..len]);
        buf.advance(len);
        Ok(ConnectionId {
            len: len as u8,
            bytes,
        })
    }

    pub fn encode_long(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.len);
        buf.put_slice(self);
    }
}

impl ::std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

impl slog::Value for ConnectionId {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

/// QUIC long-header packet type (RFC 9000 §17.2), selecting which
/// packet-number space and epoch a long-header packet belongs to.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LongType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
}

/// A packet number, truncated on the wire to the minimal length that
/// still disambiguates relative to the largest packet number the sender
/// knows the peer has acknowledged (RFC 9000 §17.1).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    /// Choose the shortest encoding of `n` unambiguous given the largest
    /// packet number `largest_acked` known to have been acknowledged.
    pub fn new(n: u64, largest_acked: u64) -> Self {
        let range = (n - largest_acked) * 2;
        if range < 1 << 8 {
            PacketNumber::U8(n as u8)
        } else if range < 1 << 16 {
            PacketNumber::U16(n as u16)
        } else if range < 1 << 24 {
            PacketNumber::U24(n as u32 & 0x00ff_ffff)
        } else {
            PacketNumber::U32(n as u32)
        }
    }

    pub fn len(self) -> usize {
        match self {
            PacketNumber::U8(_) => 1,
            PacketNumber::U16(_) => 2,
            PacketNumber::U24(_) => 3,
            PacketNumber::U32(_) => 4,
        }
    }

    pub fn encode(self, buf: &mut impl BufMut) {
        match self {
            PacketNumber::U8(x) => buf.put_u8(x),
            PacketNumber::U16(x) => buf.put_u16_be(x),
            PacketNumber::U24(x) => buf.put_slice(&x.to_be_bytes()[1..]),
            PacketNumber::U32(x) => buf.put_u32_be(x),
        }
    }

    pub fn decode(len: usize, buf: &mut impl Buf) -> Result<Self, UnexpectedEnd> {
        Ok(match len {
            1 => PacketNumber::U8(buf.get::<u8>()?),
            2 => PacketNumber::U16(buf.get::<u16>()?),
            3 => {
                if buf.remaining() < 3 {
                    return Err(UnexpectedEnd);
                }
                let mut b = [0u8; 4];
                b[1..].copy_from_slice(&buf.bytes()[..3]);
                buf.advance(3);
                PacketNumber::U24(u32::from_be_bytes(b))
            }
            4 => PacketNumber::U32(buf.get::<u32>()?),
            _ => panic!("invalid packet number length {}", len),
        })
    }

    /// Reconstruct the full packet number nearest `expected` (the
    /// largest packet number processed so far + 1), per RFC 9000
    /// Appendix A.
    pub fn expand(self, expected: u64) -> u64 {
        let (truncated, nbits) = match self {
            PacketNumber::U8(x) => (x as u64, 8),
            PacketNumber::U16(x) => (x as u64, 16),
            PacketNumber::U24(x) => (x as u64, 24),
            PacketNumber::U32(x) => (x as u64, 32),
        };
        let window = 1u64 << nbits;
        let half = window / 2;
        let candidate = (expected & !(window - 1)) | truncated;
        if candidate + half <= expected {
            candidate + window
        } else if candidate > expected + half && candidate >= window {
            candidate - window
        } else {
            candidate
        }
    }
}

/// A parsed packet header. Header protection (the obfuscation of the
/// packet-number field and part of the first byte) is assumed already
/// removed by the caller, per spec.md §1/§6.
#[derive(Debug, Clone)]
pub enum Header {
    Initial {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        token: Vec<u8>,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
        token: Vec<u8>,
    },
    Short {
        dst_cid: ConnectionId,
        number: PacketNumber,
        key_phase: bool,
    },
    VersionNegotiate {
        src_cid: ConnectionId,
        dst_cid: ConnectionId,
    },
}

impl Header {
    pub fn is_long(&self) -> bool {
        !matches!(self, Header::Short { .. })
    }

    /// Encode the header (sans protection) into `buf`. Returns the
    /// offset of the reserved 4-byte length field for long-header
    /// packets (`None` for headers with no length field), so the
    /// caller can patch it once the payload size is known via
    /// [`set_payload_length`].
    pub fn encode(&self, buf: &mut BytesMut) -> Option<usize> {
        match *self {
            Header::Initial {
                ref src_cid,
                ref dst_cid,
                ref token,
                number,
            } => {
                buf.put_u8(0xc0 | (number.len() as u8 - 1));
                buf.put_u32_be(VERSION);
                dst_cid.encode_long(buf);
                src_cid.encode_long(buf);
                buf.write_var(token.len() as u64);
                buf.put_slice(token);
                let length_field_offset = buf.len();
                buf.put_u32_be(0); // patched by `set_payload_length`
                number.encode(buf);
                Some(length_field_offset)
            }
            Header::Long {
                ty,
                ref src_cid,
                ref dst_cid,
                number,
            } => {
                let ty_bits = match ty {
                    LongType::ZeroRtt => 0b01,
                    LongType::Handshake => 0b10,
                    LongType::Retry => 0b11,
                    LongType::Initial => unreachable!("use Header::Initial"),
                };
                buf.put_u8(0xc0 | ty_bits << 4 | (number.len() as u8 - 1));
                buf.put_u32_be(VERSION);
                dst_cid.encode_long(buf);
                src_cid.encode_long(buf);
                let length_field_offset = buf.len();
                buf.put_u32_be(0);
                number.encode(buf);
                Some(length_field_offset)
            }
            Header::Retry {
                ref src_cid,
                ref dst_cid,
                ref token,
            } => {
                buf.put_u8(0xc0 | 0b11 << 4);
                buf.put_u32_be(VERSION);
                dst_cid.encode_long(buf);
                src_cid.encode_long(buf);
                buf.put_slice(token);
                None
            }
            Header::Short {
                ref dst_cid,
                number,
                key_phase,
            } => {
                buf.put_u8(0x40 | (key_phase as u8) << 2 | (number.len() as u8 - 1));
                buf.put_slice(dst_cid);
                number.encode(buf);
                None
            }
            Header::VersionNegotiate {
                ref src_cid,
                ref dst_cid,
            } => {
                buf.put_u8(0x80);
                buf.put_u32_be(0);
                dst_cid.encode_long(buf);
                src_cid.encode_long(buf);
                None
            }
        }
    }
}

/// Patch a long-header packet's reserved 4-byte length field once the
/// total packet length is known (spec.md §6).
pub fn set_payload_length(buf: &mut [u8], length_field_offset: usize) {
    let len = buf.len() - length_field_offset - 4;
    let field = &mut buf[length_field_offset..length_field_offset + 4];
    crate::coding::encode_fixed_varint(field, len as u64);
}

/// Lazily-parsed invariant header, produced before the destination
/// connection ID is known to be routable to a live connection.
pub struct PartialDecode {
    pub header: Header,
    /// Length of the header portion of `buf`, i.e. the split point
    /// between header bytes (AEAD associated data) and the as-yet
    /// still-encrypted payload.
    header_len: usize,
    buf: Bytes,
}

#[derive(Debug, Fail)]
pub enum PacketDecodeError {
    #[fail(display = "unsupported version {:#x}", version)]
    UnsupportedVersion { version: u32 },
    #[fail(display = "malformed packet header")]
    Malformed,
}

impl From<UnexpectedEnd> for PacketDecodeError {
    fn from(_: UnexpectedEnd) -> Self {
        PacketDecodeError::Malformed
    }
}

/// Read the destination connection ID off a still-protected datagram.
/// Connection IDs are always sent in the clear (RFC 9001 §5.4 protects
/// only the first byte's low bits and the packet-number field), so this
/// is safe to call before header protection is removed — it's how the
/// caller picks which connection's (and which epoch's) header key to
/// apply in the first place.
pub fn peek_dst_cid(data: &[u8], local_cid_len: usize) -> Result<ConnectionId, PacketDecodeError> {
    if data.is_empty() {
        return Err(PacketDecodeError::Malformed);
    }
    let first = data[0];
    let mut cursor = Bytes::from(data.to_vec());
    if first & 0x80 != 0 {
        cursor.advance(1);
        cursor.get::<u32>()?; // version
        let dst_len = cursor.get::<u8>()? as usize;
        Ok(ConnectionId::decode(&mut cursor, dst_len)?)
    } else {
        cursor.advance(1);
        Ok(ConnectionId::decode(&mut cursor, local_cid_len)?)
    }
}

/// Locate the (still header-protected) packet-number field of the
/// leading packet in a datagram, without touching any of the masked
/// bits (RFC 9001 §5.4.2): every field up to this point — version,
/// connection IDs, token, length — is sent in the clear, so it can be
/// parsed before header protection is removed. The caller uses the
/// returned offset to sample ciphertext and unmask the first byte and
/// packet-number field in place, then re-parses with
/// [`PartialDecode::new`].
pub fn header_protection_offset(data: &[u8], local_cid_len: usize) -> Result<usize, PacketDecodeError> {
    if data.is_empty() {
        return Err(PacketDecodeError::Malformed);
    }
    let first = data[0];
    let mut cursor = Bytes::from(data.to_vec());
    if first & 0x80 != 0 {
        cursor.advance(1);
        let version = cursor.get::<u32>()?;
        let dst_len = cursor.get::<u8>()? as usize;
        ConnectionId::decode(&mut cursor, dst_len)?;
        let src_len = cursor.get::<u8>()? as usize;
        ConnectionId::decode(&mut cursor, src_len)?;
        if version == 0 {
            // Version negotiation carries no packet number at all.
            return Ok(data.len());
        }
        let ty = (first >> 4) & 0b11;
        if ty == 0b00 {
            let token_len = cursor.get_var()? as usize;
            cursor.get_bytes(token_len)?;
        } else if ty == 0b11 {
            // Retry carries no packet number either.
            return Ok(data.len());
        }
        cursor.get_var()?; // length
    } else {
        cursor.advance(1);
        ConnectionId::decode(&mut cursor, local_cid_len)?;
    }
    Ok(data.len() - cursor.remaining())
}

impl PartialDecode {
    /// Parse the invariant portion of a datagram's leading packet,
    /// without yet knowing whether a connection will claim it. The
    /// caller must have already removed header protection (via
    /// [`header_protection_offset`] and the appropriate
    /// [`crate::crypto::HeaderKey`]) so the packet-number field and the
    /// low bits of the first byte are in the clear.
    pub fn new(mut data: Bytes, local_cid_len: usize) -> Result<(Self, Bytes), PacketDecodeError> {
        let first = data[0];
        if first & 0x80 != 0 {
            // Long header
            let mut cursor = data.clone();
            cursor.advance(1);
            let version = cursor.get::<u32>()?;
            let dst_len = cursor.get::<u8>()? as usize;
            let dst_cid = ConnectionId::decode(&mut cursor, dst_len)?;
            let src_len = cursor.get::<u8>()? as usize;
            let src_cid = ConnectionId::decode(&mut cursor, src_len)?;

            if version == 0 {
                let header = Header::VersionNegotiate { src_cid, dst_cid };
                let consumed = data.len() - cursor.remaining();
                let rest = data.split_off(consumed);
                return Ok((
                    PartialDecode {
                        header,
                        header_len: consumed,
                        buf: data,
                    },
                    rest,
                ));
            }
            if version != VERSION {
                return Err(PacketDecodeError::UnsupportedVersion { version });
            }

            let ty = (first >> 4) & 0b11;
            match ty {
                0b00 => {
                    let token_len = cursor.get_var()? as usize;
                    let token = cursor.get_bytes(token_len)?.to_vec();
                    let pn_len = (first & 0x3) as usize + 1;
                    let payload_len = cursor.get_var()? as usize;
                    let number = PacketNumber::decode(pn_len, &mut cursor)?;
                    let header = Header::Initial {
                        src_cid,
                        dst_cid,
                        token,
                        number,
                    };
                    let header_len = data.len() - cursor.remaining();
                    let total_len = header_len + payload_len.saturating_sub(pn_len);
                    if total_len > data.len() {
                        return Err(PacketDecodeError::Malformed);
                    }
                    let rest = data.split_off(total_len);
                    Ok((
                        PartialDecode {
                            header,
                            header_len,
                            buf: data,
                        },
                        rest,
                    ))
                }
                0b11 => {
                    let token = cursor.bytes().to_vec();
                    let header = Header::Retry {
                        src_cid,
                        dst_cid,
                        token,
                    };
                    Ok((
                        PartialDecode {
                            header,
                            header_len: 0,
                            buf: Bytes::new(),
                        },
                        Bytes::new(),
                    ))
                }
                long_ty => {
                    let ty = if long_ty == 0b01 {
                        LongType::ZeroRtt
                    } else {
                        LongType::Handshake
                    };
                    let pn_len = (first & 0x3) as usize + 1;
                    let payload_len = cursor.get_var()? as usize;
                    let number = PacketNumber::decode(pn_len, &mut cursor)?;
                    let header = Header::Long {
                        ty,
                        src_cid,
                        dst_cid,
                        number,
                    };
                    let header_len = data.len() - cursor.remaining();
                    let total_len = header_len + payload_len.saturating_sub(pn_len);
                    if total_len > data.len() {
                        return Err(PacketDecodeError::Malformed);
                    }
                    let rest = data.split_off(total_len);
                    Ok((
                        PartialDecode {
                            header,
                            header_len,
                            buf: data,
                        },
                        rest,
                    ))
                }
            }
        } else {
            // Short header
            let mut cursor = data.clone();
            cursor.advance(1);
            let dst_cid = ConnectionId::decode(&mut cursor, local_cid_len)?;
            let pn_len = (first & 0x3) as usize + 1;
            let key_phase = first & 0x4 != 0;
            let number = PacketNumber::decode(pn_len, &mut cursor)?;
            let header = Header::Short {
                dst_cid,
                number,
                key_phase,
            };
            let header_len = data.len() - cursor.remaining();
            let rest = Bytes::new();
            Ok((
                PartialDecode {
                    header,
                    header_len,
                    buf: data,
                },
                rest,
            ))
        }
    }

    pub fn dst_cid(&self) -> ConnectionId {
        match self.header {
            Header::Initial { dst_cid, .. }
            | Header::Long { dst_cid, .. }
            | Header::Retry { dst_cid, .. }
            | Header::Short { dst_cid, .. }
            | Header::VersionNegotiate { dst_cid, .. } => dst_cid,
        }
    }

    pub fn is_initial(&self) -> bool {
        matches!(self.header, Header::Initial { .. })
    }

    pub fn is_handshake(&self) -> bool {
        matches!(
            self.header,
            Header::Long {
                ty: LongType::Handshake,
                ..
            } | Header::Initial { .. }
        )
    }

    pub fn has_long_header(&self) -> bool {
        self.header.is_long()
    }

    /// The header bytes, i.e. the AEAD associated data covering this
    /// packet (RFC 9001 §5.3).
    pub fn header_data(&self) -> &[u8] {
        &self.buf[..self.header_len]
    }

    /// The still-encrypted payload following the header, ready for the
    /// caller's AEAD to decrypt in place.
    pub fn payload_data(&self) -> &[u8] {
        &self.buf[self.header_len..]
    }

    /// Finish decoding now that the plaintext payload is available
    /// (already decrypted by the external AEAD collaborator, per
    /// spec.md §1).
    pub fn finish(self, payload: Bytes) -> Packet {
        Packet {
            header: self.header,
            payload,
        }
    }
}

/// A fully decoded packet with an authenticated plaintext payload.
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn connection_id_roundtrip() {
        let cid = ConnectionId::new(&[1, 2, 3, 4, 5]);
        let mut buf = BytesMut::new();
        cid.encode_long(&mut buf);
        let mut cursor = buf.freeze();
        let len = cursor.get::<u8>().unwrap() as usize;
        let decoded = ConnectionId::decode(&mut cursor, len).unwrap();
        assert_eq!(&*decoded, &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn packet_number_expand() {
        // A packet number truncated to 8 bits near a large `expected`
        // should expand back to the nearby full value.
        let full = 0x1_0000_1234u64;
        let truncated = PacketNumber::new(full, full - 1);
        assert_eq!(truncated.expand(full - 1), full);
    }

    #[test]
    fn short_header_roundtrip() {
        let dst_cid = ConnectionId::new(&[9, 9, 9, 9]);
        let header = Header::Short {
            dst_cid,
            number: PacketNumber::new(5, 0),
            key_phase: true,
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf[0] & 0x80, 0); // short header bit
        assert_ne!(buf[0] & 0x4, 0); // key phase bit set
    }

    #[test]
    fn random_cid_uses_requested_length() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let cid = ConnectionId::random(&mut rng, 8);
        assert_eq!(cid.len(), 8);
    }
}
