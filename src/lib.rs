//! State machine for the QUIC transport protocol.
//!
//! This crate implements the "hard core" of a QUIC endpoint: the frame
//! codec, stream reassembly, ACK/loss-recovery machinery and the
//! connection/stream state machines. It performs no I/O and knows
//! nothing about any particular TLS library; callers hand it
//! already-decrypted datagram payloads via [`Connection::handle_packet`]
//! and pull encrypted-by-the-caller datagrams back out via
//! [`Connection::next_packet`], driven by an [`Endpoint`].

#[macro_use]
extern crate slog;
#[macro_use]
extern crate failure;

pub mod coding;
pub mod congestion;
pub mod connection;
pub mod crypto;
pub mod diet;
pub mod endpoint;
pub mod frame;
pub mod packet;
pub mod pnspace;
pub mod recovery;
pub mod stream;
pub mod transport_parameters;

pub use connection::{Connection, ConnectionError};
pub use endpoint::{Config, Endpoint, Event, Io, Timer};
pub use frame::Frame;
pub use packet::ConnectionId;
pub use stream::{ReadError, WriteError};

/// The QUIC version this crate speaks.
pub const VERSION: u32 = 0xff00_001d;

/// Minimum UDP payload size guaranteed not to trigger fragmentation on any
/// link conforming to RFC 9000 §14.
pub const MIN_MTU: u16 = 1200;

/// Minimum size of a client's first Initial packet, padded up to this to
/// mitigate amplification attacks.
pub const MIN_INITIAL_SIZE: usize = 1200;

/// Smallest allowed connection ID length, other than the zero-length ID.
pub const MIN_CID_SIZE: usize = 4;

/// Largest allowed connection ID length.
pub const MAX_CID_SIZE: usize = 20;

/// Size in bytes of a stateless reset token.
pub const RESET_TOKEN_SIZE: usize = 16;

/// Size in bytes of a PATH_CHALLENGE/PATH_RESPONSE opaque value.
pub const PATH_CHALLENGE_SIZE: usize = 8;

/// `kPacketThreshold` from RFC 9002 §6.1.1.
pub const PACKET_THRESHOLD: u64 = 3;

/// `kTimeThreshold` from RFC 9002 §6.1.2, as a rational `9/8`.
pub const TIME_THRESHOLD_NUM: u64 = 9;
pub const TIME_THRESHOLD_DEN: u64 = 8;

/// `kGranularity` from RFC 9002, in microseconds.
pub const GRANULARITY: u64 = 1_000;

/// `kInitialRtt` from RFC 9002, in microseconds.
pub const INITIAL_RTT: u64 = 333_000;

/// `kPersistentCongestionThreshold` from RFC 9002 §7.6.
pub const PERSISTENT_CONGESTION_THRESHOLD: u32 = 3;

/// Default `ack_delay_exponent` transport parameter value.
pub const DEFAULT_ACK_DELAY_EXPONENT: u8 = 3;

/// Coalesced-ACK delay timer, per spec.md §4.3's ACK-frequency policy.
pub const MAX_ACK_DELAY: u64 = 25_000;

/// The ECN codepoint observed on a received datagram's IP header,
/// handed in at the datagram I/O boundary (spec.md §6) alongside the
/// plaintext payload and folded into the receiving packet-number
/// space's ECT0/ECT1/CE counters (spec.md §4.3 "ECN counters") for
/// the next outgoing ACK_ECN.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum EcnCodepoint {
    Ect0,
    Ect1,
    Ce,
}

/// Which end of a connection or stream a given endpoint is.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Side {
    Client = 0,
    Server = 1,
}

impl Side {
    pub fn is_client(self) -> bool {
        self == Side::Client
    }

    pub fn is_server(self) -> bool {
        self == Side::Server
    }
}

impl ::std::ops::Not for Side {
    type Output = Side;
    fn not(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}

impl slog::Value for Side {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}

/// Whether a stream carries data in one direction or both.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Directionality {
    Bi = 0,
    Uni = 1,
}

/// Identifies a stream within a connection.
///
/// The two low bits encode directionality and initiator, per RFC 9000
/// §2.1: bit 0x1 set means unidirectional, bit 0x2 set means
/// server-initiated.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn new(initiator: Side, directionality: Directionality, index: u64) -> Self {
        StreamId(
            index << 2
                | (directionality as u64) << 1
                | match initiator {
                    Side::Client => 0,
                    Side::Server => 1,
                },
        )
    }

    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    pub fn directionality(self) -> Directionality {
        if self.0 & 0x2 == 0 {
            Directionality::Bi
        } else {
            Directionality::Uni
        }
    }

    /// The stream's position within its (initiator, directionality) class.
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl From<StreamId> for u64 {
    fn from(x: StreamId) -> u64 {
        x.0
    }
}

impl slog::Value for StreamId {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_u64(key, self.0)
    }
}

/// Transport-level error codes, per spec.md §6/§7.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub struct TransportError {
    pub code: TransportErrorCode,
    /// The frame type that provoked the error, if any. `None` for errors
    /// not specific to a single frame.
    pub frame: Option<u64>,
}

impl ::std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(frame) = self.frame {
            write!(f, " (frame type {:#x})", frame)?;
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportErrorCode {
    NoError,
    InternalError,
    ConnectionRefused,
    FlowControlError,
    StreamLimitError,
    StreamStateError,
    FinalSizeError,
    FrameEncodingError,
    TransportParameterError,
    ConnectionIdLimitError,
    ProtocolViolation,
    InvalidToken,
    ApplicationError,
    CryptoBufferExceeded,
    /// TLS alert, encoded as `0x100 + alert`.
    Crypto(u8),
}

impl TransportErrorCode {
    fn code(self) -> u64 {
        use TransportErrorCode::*;
        match self {
            NoError => 0x0,
            InternalError => 0x1,
            ConnectionRefused => 0x2,
            FlowControlError => 0x3,
            StreamLimitError => 0x4,
            StreamStateError => 0x5,
            FinalSizeError => 0x6,
            FrameEncodingError => 0x7,
            TransportParameterError => 0x8,
            ConnectionIdLimitError => 0x9,
            ProtocolViolation => 0xa,
            InvalidToken => 0xb,
            ApplicationError => 0xc,
            CryptoBufferExceeded => 0xd,
            Crypto(alert) => 0x100 + alert as u64,
        }
    }
}

impl ::std::fmt::Display for TransportErrorCode {
    fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
        use TransportErrorCode::*;
        let text = match *self {
            NoError => "no error",
            InternalError => "internal error",
            ConnectionRefused => "connection refused",
            FlowControlError => "flow control error",
            StreamLimitError => "stream limit error",
            StreamStateError => "stream state error",
            FinalSizeError => "final size error",
            FrameEncodingError => "frame encoding error",
            TransportParameterError => "transport parameter error",
            ConnectionIdLimitError => "connection ID limit error",
            ProtocolViolation => "protocol violation",
            InvalidToken => "invalid token",
            ApplicationError => "application error",
            CryptoBufferExceeded => "crypto buffer exceeded",
            Crypto(alert) => return write!(f, "TLS alert {}", alert),
        };
        write!(f, "{}", text)
    }
}

macro_rules! transport_error_shorthand {
    ($($name:ident => $variant:ident;)*) => {
        #[allow(non_upper_case_globals)]
        impl TransportError {
            $(
                pub const $name: TransportError = TransportError {
                    code: TransportErrorCode::$variant,
                    frame: None,
                };
            )*
        }
    }
}

transport_error_shorthand! {
    NO_ERROR => NoError;
    INTERNAL_ERROR => InternalError;
    FLOW_CONTROL_ERROR => FlowControlError;
    STREAM_LIMIT_ERROR => StreamLimitError;
    STREAM_STATE_ERROR => StreamStateError;
    FINAL_SIZE_ERROR => FinalSizeError;
    FRAME_ENCODING_ERROR => FrameEncodingError;
    TRANSPORT_PARAMETER_ERROR => TransportParameterError;
    CONNECTION_ID_LIMIT_ERROR => ConnectionIdLimitError;
    PROTOCOL_VIOLATION => ProtocolViolation;
}

impl TransportError {
    /// A `FRAME_ENCODING_ERROR` naming the offending frame type, per
    /// spec.md §4.4 decode contract step 5.
    pub fn frame(ty: u64) -> Self {
        TransportError {
            code: TransportErrorCode::FrameEncodingError,
            frame: Some(ty),
        }
    }

    pub fn crypto(alert: u8) -> Self {
        TransportError {
            code: TransportErrorCode::Crypto(alert),
            frame: None,
        }
    }

    pub fn code(&self) -> u64 {
        self.code.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_id_roundtrip() {
        for &initiator in &[Side::Client, Side::Server] {
            for &dir in &[Directionality::Bi, Directionality::Uni] {
                for index in [0u64, 1, 2, 1000, (1 << 60) - 1].iter().cloned() {
                    let id = StreamId::new(initiator, dir, index);
                    assert_eq!(id.initiator(), initiator);
                    assert_eq!(id.directionality(), dir);
                    assert_eq!(id.index(), index);
                }
            }
        }
    }

    #[test]
    fn side_not() {
        assert_eq!(!Side::Client, Side::Server);
        assert_eq!(!Side::Server, Side::Client);
    }

    #[test]
    fn transport_error_codes() {
        assert_eq!(TransportError::FLOW_CONTROL_ERROR.code(), 0x3);
        assert_eq!(TransportError::PROTOCOL_VIOLATION.code(), 0xa);
        assert_eq!(TransportError::frame(0x08).code(), 0x7);
        assert_eq!(TransportError::crypto(42).code(), 0x100 + 42);
    }
}
