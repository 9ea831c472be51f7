//! The QUIC transport parameters extension (spec.md §4.7): a
//! `(id, length, value)` list carried in the TLS handshake that lets
//! each side advertise its initial flow-control and connection limits
//! to the other before any application data flows.
//!
//! Generalizes the teacher's `transport_parameters::TransportParameters`
//! (`TransportParameters::new`, `::read`, `.write`, referenced throughout
//! `connection.rs::{handle_initial, set_params, make_tls}`) to the
//! parameter set spec.md §4.7 requires, including several the teacher's
//! era predates: `initial_max_streams_{bidi,uni}` (the teacher still
//! calls these `initial_max_{bidi,uni}_streams`), `max_ack_delay`,
//! `ack_delay_exponent`, `active_connection_id_limit`,
//! `disable_active_migration` and `preferred_address`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::coding::{BufExt, BufMutExt, UnexpectedEnd};
use crate::packet::ConnectionId;
use crate::{Config, RESET_TOKEN_SIZE};

macro_rules! param_ids {
    ($($name:ident = $val:expr;)*) => {
        #[derive(Debug, Copy, Clone, Eq, PartialEq)]
        #[allow(non_camel_case_types)]
        enum ParamId {
            $($name,)*
            Unknown(u64),
        }

        impl ParamId {
            fn from_u64(x: u64) -> Self {
                match x {
                    $($val => ParamId::$name,)*
                    other => ParamId::Unknown(other),
                }
            }

            fn to_u64(self) -> u64 {
                match self {
                    $(ParamId::$name => $val,)*
                    ParamId::Unknown(x) => x,
                }
            }
        }
    }
}

param_ids! {
    OriginalConnectionId = 0x00;
    IdleTimeout = 0x01;
    StatelessResetToken = 0x02;
    MaxPacketSize = 0x03;
    InitialMaxData = 0x04;
    InitialMaxStreamDataBidiLocal = 0x05;
    InitialMaxStreamDataBidiRemote = 0x06;
    InitialMaxStreamDataUni = 0x07;
    InitialMaxStreamsBidi = 0x08;
    InitialMaxStreamsUni = 0x09;
    AckDelayExponent = 0x0a;
    MaxAckDelay = 0x0b;
    DisableActiveMigration = 0x0c;
    PreferredAddress = 0x0d;
    ActiveConnectionIdLimit = 0x0e;
}

/// One endpoint's transport parameters, as exchanged in the TLS
/// handshake. Every field has a fallback default (RFC 9000 §18.2), so
/// this struct always holds a usable value even before the peer's
/// parameters arrive.
#[derive(Debug, Clone)]
pub struct TransportParameters {
    pub initial_max_stream_data_bidi_local: u32,
    pub initial_max_stream_data_bidi_remote: u32,
    pub initial_max_stream_data_uni: u32,
    pub initial_max_data: u32,
    pub initial_max_streams_bidi: u16,
    pub initial_max_streams_uni: u16,
    pub ack_delay_exponent: u8,
    pub max_ack_delay: u64,
    pub idle_timeout: u32,
    pub max_packet_size: u16,
    pub active_connection_id_limit: u32,
    pub disable_active_migration: bool,
    pub stateless_reset_token: Option<[u8; RESET_TOKEN_SIZE]>,
    pub original_connection_id: Option<ConnectionId>,
    pub preferred_address: Option<PreferredAddress>,
}

/// A server-advertised alternate address and connection ID the client
/// may migrate to once the handshake completes.
#[derive(Debug, Clone)]
pub struct PreferredAddress {
    pub address_v4: Option<::std::net::SocketAddrV4>,
    pub address_v6: Option<::std::net::SocketAddrV6>,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: [u8; RESET_TOKEN_SIZE],
}

impl TransportParameters {
    /// The set of parameters this endpoint offers, derived from its
    /// [`Config`] the way the teacher's `TransportParameters::new`
    /// derives window sizes from the configured bandwidth-delay
    /// product.
    pub fn new(config: &Config) -> Self {
        TransportParameters {
            initial_max_stream_data_bidi_local: config.stream_receive_window as u32,
            initial_max_stream_data_bidi_remote: config.stream_receive_window as u32,
            initial_max_stream_data_uni: config.stream_receive_window as u32,
            initial_max_data: config.receive_window as u32,
            initial_max_streams_bidi: config.max_concurrent_bidi_streams,
            initial_max_streams_uni: config.max_concurrent_uni_streams,
            ack_delay_exponent: crate::DEFAULT_ACK_DELAY_EXPONENT,
            max_ack_delay: crate::MAX_ACK_DELAY,
            idle_timeout: config.idle_timeout,
            max_packet_size: 1452,
            active_connection_id_limit: 2,
            disable_active_migration: false,
            stateless_reset_token: None,
            original_connection_id: None,
            preferred_address: None,
        }
    }

    pub fn write(&self, buf: &mut BytesMut) {
        write_tagged_var(buf, ParamId::InitialMaxStreamDataBidiLocal, |b| {
            b.write_var(self.initial_max_stream_data_bidi_local as u64)
        });
        write_tagged_var(buf, ParamId::InitialMaxStreamDataBidiRemote, |b| {
            b.write_var(self.initial_max_stream_data_bidi_remote as u64)
        });
        write_tagged_var(buf, ParamId::InitialMaxStreamDataUni, |b| {
            b.write_var(self.initial_max_stream_data_uni as u64)
        });
        write_tagged_var(buf, ParamId::InitialMaxData, |b| {
            b.write_var(self.initial_max_data as u64)
        });
        write_tagged_var(buf, ParamId::InitialMaxStreamsBidi, |b| {
            b.write_var(self.initial_max_streams_bidi as u64)
        });
        write_tagged_var(buf, ParamId::InitialMaxStreamsUni, |b| {
            b.write_var(self.initial_max_streams_uni as u64)
        });
        write_tagged_var(buf, ParamId::IdleTimeout, |b| {
            b.write_var(self.idle_timeout as u64)
        });
        write_tagged_var(buf, ParamId::MaxPacketSize, |b| {
            b.write_var(self.max_packet_size as u64)
        });
        write_tagged_var(buf, ParamId::ActiveConnectionIdLimit, |b| {
            b.write_var(self.active_connection_id_limit as u64)
        });

        write_tagged(buf, ParamId::AckDelayExponent, 1, |b| {
            b.put_u8(self.ack_delay_exponent)
        });
        write_tagged_var(buf, ParamId::MaxAckDelay, |b| {
            b.write_var(self.max_ack_delay)
        });

        if self.disable_active_migration {
            write_tagged(buf, ParamId::DisableActiveMigration, 0, |_| {});
        }

        if let Some(token) = self.stateless_reset_token {
            write_tagged(buf, ParamId::StatelessResetToken, RESET_TOKEN_SIZE, |b| {
                b.put_slice(&token)
            });
        }

        if let Some(ref cid) = self.original_connection_id {
            write_tagged(buf, ParamId::OriginalConnectionId, cid.len(), |b| {
                b.put_slice(cid)
            });
        }
    }

    /// Parse a peer's transport parameter list, starting from `self`
    /// (usually `TransportParameters::new(&config)`) so unrecognized or
    /// omitted parameters keep their RFC 9000 §18.2 default.
    pub fn read(side: crate::Side, buf: &mut Bytes) -> Result<Self, Error> {
        let mut params = TransportParameters {
            initial_max_stream_data_bidi_local: 0,
            initial_max_stream_data_bidi_remote: 0,
            initial_max_stream_data_uni: 0,
            initial_max_data: 0,
            initial_max_streams_bidi: 0,
            initial_max_streams_uni: 0,
            ack_delay_exponent: crate::DEFAULT_ACK_DELAY_EXPONENT,
            max_ack_delay: crate::MAX_ACK_DELAY,
            idle_timeout: 0,
            max_packet_size: 65527,
            active_connection_id_limit: 0,
            disable_active_migration: false,
            stateless_reset_token: None,
            original_connection_id: None,
            preferred_address: None,
        };

        while buf.has_remaining() {
            let id = ParamId::from_u64(buf.get_var()?);
            let len = buf.get_var()? as usize;
            let mut value = buf.get_bytes(len)?;
            match id {
                ParamId::InitialMaxStreamDataBidiLocal => {
                    params.initial_max_stream_data_bidi_local = value.get_var()? as u32
                }
                ParamId::InitialMaxStreamDataBidiRemote => {
                    params.initial_max_stream_data_bidi_remote = value.get_var()? as u32
                }
                ParamId::InitialMaxStreamDataUni => {
                    params.initial_max_stream_data_uni = value.get_var()? as u32
                }
                ParamId::InitialMaxData => params.initial_max_data = value.get_var()? as u32,
                ParamId::InitialMaxStreamsBidi => {
                    params.initial_max_streams_bidi = value.get_var()? as u16
                }
                ParamId::InitialMaxStreamsUni => {
                    params.initial_max_streams_uni = value.get_var()? as u16
                }
                ParamId::IdleTimeout => params.idle_timeout = value.get_var()? as u32,
                ParamId::MaxPacketSize => params.max_packet_size = value.get_var()? as u16,
                ParamId::ActiveConnectionIdLimit => {
                    params.active_connection_id_limit = value.get_var()? as u32
                }
                ParamId::AckDelayExponent => {
                    if len != 1 {
                        return Err(Error::Malformed);
                    }
                    params.ack_delay_exponent = value.get::<u8>()?;
                }
                ParamId::MaxAckDelay => params.max_ack_delay = value.get_var()?,
                ParamId::DisableActiveMigration => {
                    if len != 0 {
                        return Err(Error::Malformed);
                    }
                    params.disable_active_migration = true;
                }
                ParamId::StatelessResetToken => {
                    if len != RESET_TOKEN_SIZE || side.is_client() {
                        // A client offering a reset token, or a
                        // malformed token length, is a protocol
                        // violation: only servers send these.
                        return Err(Error::IllegalValue);
                    }
                    let mut token = [0u8; RESET_TOKEN_SIZE];
                    token.copy_from_slice(&value);
                    params.stateless_reset_token = Some(token);
                }
                ParamId::OriginalConnectionId => {
                    if side.is_client() {
                        return Err(Error::IllegalValue);
                    }
                    params.original_connection_id = Some(ConnectionId::new(&value));
                }
                ParamId::PreferredAddress => {
                    if side.is_client() {
                        return Err(Error::IllegalValue);
                    }
                    params.preferred_address = Some(read_preferred_address(&mut value)?);
                }
                ParamId::Unknown(_) => {
                    // Unknown parameters are ignored per RFC 9000 §18.1.
                }
            }
        }

        Ok(params)
    }
}

fn write_tagged_var(buf: &mut BytesMut, id: ParamId, write: impl FnOnce(&mut BytesMut)) {
    let mut value = BytesMut::new();
    write(&mut value);
    buf.write_var(id.to_u64());
    buf.write_var(value.len() as u64);
    buf.put_slice(&value);
}

fn write_tagged(buf: &mut BytesMut, id: ParamId, len: usize, write: impl FnOnce(&mut BytesMut)) {
    buf.write_var(id.to_u64());
    buf.write_var(len as u64);
    write(buf);
}

fn read_preferred_address(buf: &mut Bytes) -> Result<PreferredAddress, Error> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};

    let ip4 = Ipv4Addr::from(buf.get::<u32>()?);
    let port4 = buf.get::<u16>()?;
    let address_v4 = if ip4.is_unspecified() && port4 == 0 {
        None
    } else {
        Some(SocketAddrV4::new(ip4, port4))
    };

    let mut ip6_bytes = [0u8; 16];
    if buf.remaining() < 16 {
        return Err(Error::Malformed);
    }
    ip6_bytes.copy_from_slice(&buf.bytes()[..16]);
    buf.advance(16);
    let ip6 = Ipv6Addr::from(ip6_bytes);
    let port6 = buf.get::<u16>()?;
    let address_v6 = if ip6.is_unspecified() && port6 == 0 {
        None
    } else {
        Some(SocketAddrV6::new(ip6, port6, 0, 0))
    };

    let cid_len = buf.get::<u8>()? as usize;
    let connection_id = ConnectionId::decode(buf, cid_len).map_err(|_| Error::Malformed)?;

    if buf.remaining() < RESET_TOKEN_SIZE {
        return Err(Error::Malformed);
    }
    let mut stateless_reset_token = [0u8; RESET_TOKEN_SIZE];
    stateless_reset_token.copy_from_slice(&buf.bytes()[..RESET_TOKEN_SIZE]);
    buf.advance(RESET_TOKEN_SIZE);

    Ok(PreferredAddress {
        address_v4,
        address_v6,
        connection_id,
        stateless_reset_token,
    })
}

/// Failure to parse a peer's transport parameters, surfaced as
/// `TRANSPORT_PARAMETER_ERROR` (spec.md §4.7/§7).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum Error {
    #[fail(display = "malformed transport parameter")]
    Malformed,
    #[fail(display = "illegal transport parameter value")]
    IllegalValue,
}

impl From<UnexpectedEnd> for Error {
    fn from(_: UnexpectedEnd) -> Self {
        Error::Malformed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Side;

    fn test_config() -> Config {
        Config::default()
    }

    #[test]
    fn roundtrip_defaults() {
        let config = test_config();
        let params = TransportParameters::new(&config);
        let mut buf = BytesMut::new();
        params.write(&mut buf);
        let mut cursor = buf.freeze();
        let decoded = TransportParameters::read(Side::Server, &mut cursor).unwrap();
        assert_eq!(
            decoded.initial_max_data,
            params.initial_max_data
        );
        assert_eq!(
            decoded.initial_max_streams_bidi,
            params.initial_max_streams_bidi
        );
        assert_eq!(decoded.ack_delay_exponent, params.ack_delay_exponent);
        assert_eq!(decoded.max_ack_delay, params.max_ack_delay);
    }

    #[test]
    fn client_offering_reset_token_rejected() {
        let mut buf = BytesMut::new();
        write_tagged(&mut buf, ParamId::StatelessResetToken, RESET_TOKEN_SIZE, |b| {
            b.put_slice(&[0u8; RESET_TOKEN_SIZE])
        });
        let mut cursor = buf.freeze();
        assert_eq!(
            TransportParameters::read(Side::Client, &mut cursor).unwrap_err(),
            Error::IllegalValue
        );
    }

    #[test]
    fn unknown_parameter_ignored() {
        let mut buf = BytesMut::new();
        write_tagged(&mut buf, ParamId::Unknown(0xbeef), 2, |b| b.put_slice(&[1, 2]));
        write_tagged_var(&mut buf, ParamId::InitialMaxData, |b| b.write_var(42));
        let mut cursor = buf.freeze();
        let params = TransportParameters::read(Side::Server, &mut cursor).unwrap();
        assert_eq!(params.initial_max_data, 42);
    }
}
