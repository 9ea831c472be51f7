//! The TLS handshake engine and packet/header protection keys, as
//! external collaborators this crate depends on only through traits
//! (spec.md §1: "the TLS handshake state machine and all AEAD sealing
//! and header-protection operations are supplied by the caller").
//!
//! Generalizes the teacher's concrete `crypto::{Crypto, TlsSession}`
//! pairing (`self.tls: TlsSession`, `self.crypto: Option<Crypto>`,
//! `Crypto::new_initial`/`Crypto::new_1rtt` in `connection.rs`) into
//! trait objects: [`Session`] stands in for `TlsSession`, [`Keys`] for
//! `Crypto`, and [`HeaderKey`] for the half of `Crypto` used only to
//! protect/unprotect the packet-number field. No concrete cipher is
//! implemented here; a caller supplies one (e.g. backed by `rustls` and
//! `ring`, as the teacher's own era did).

use bytes::BytesMut;

use crate::TransportError;

/// One side of the TLS 1.3 handshake, driving QUIC's "TLS as a
/// transport parameter/secret generator" profile (RFC 9001). A
/// concrete implementation wraps a TLS library's exported-secret and
/// transport-parameter-extension APIs.
pub trait Session {
    /// Feed handshake bytes received in CRYPTO frames at `space`'s
    /// epoch to the TLS state machine.
    fn read_handshake(&mut self, space: Epoch, data: &[u8]) -> Result<(), TransportError>;

    /// Pull the next chunk of handshake bytes to send, if the TLS
    /// state machine has produced any.
    fn write_handshake(&mut self, buf: &mut BytesMut) -> Option<Epoch>;

    /// Whether the handshake has produced 1-RTT keys and local transport
    /// parameters have been validated against the peer's.
    fn is_handshaking(&self) -> bool;

    /// The verified peer transport parameters, once available.
    fn transport_parameters(&self) -> Option<crate::transport_parameters::TransportParameters>;

    /// Derive the next epoch's packet and header protection keys, if
    /// the handshake has advanced far enough to produce them.
    fn next_keys(&mut self) -> Option<Keys>;

    /// Produce updated 1-RTT keys for a key update (RFC 9001 §6).
    fn update_keys(&self, keys: &Keys) -> Keys;

    /// Whether `early_data` (0-RTT) is accepted by the peer.
    fn early_crypto(&self) -> Option<Keys>;

    fn is_valid_retry(&self, orig_dst_cid: &crate::packet::ConnectionId, header: &[u8], payload: &[u8]) -> bool;
}

/// Which packet-number space / encryption level a set of keys or a
/// CRYPTO frame belongs to (spec.md §4.3's three packet-number
/// spaces, plus the 0-RTT level that shares the Application space's
/// packet numbers but not its keys).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Epoch {
    Initial,
    ZeroRtt,
    Handshake,
    Application,
}

/// The packet-body AEAD keys for one epoch, plus the header protection
/// keys needed to unprotect the first byte and packet-number field
/// (RFC 9001 §5, §5.4).
pub trait Keys: Send + 'static {
    /// Decrypt `payload` in place using `packet_number` as part of the
    /// AEAD nonce, returning the plaintext length on success.
    fn decrypt(
        &self,
        packet_number: u64,
        header: &[u8],
        payload: &mut [u8],
    ) -> Result<usize, CryptoError>;

    /// Encrypt `payload` in place, appending the authentication tag.
    fn encrypt(&self, packet_number: u64, buf: &mut Vec<u8>, header_len: usize);

    /// Size in bytes of the AEAD authentication tag this suite appends.
    fn tag_len(&self) -> usize;

    fn header_key(&self) -> &dyn HeaderKey;
}

/// The header protection sub-key used to mask the packet-number field
/// and the low bits of the first byte (RFC 9001 §5.4).
pub trait HeaderKey: Send + Sync + 'static {
    fn decrypt(&self, pn_offset: usize, packet: &mut [u8]);
    fn encrypt(&self, pn_offset: usize, packet: &mut [u8]);
    fn sample_size(&self) -> usize;
}

/// A local failure in the crypto layer — bad AEAD tag, handshake
/// protocol violation, or similar — surfaced to the connection as a
/// `CRYPTO_ERROR` close (spec.md §7).
#[derive(Debug, Copy, Clone, Eq, PartialEq, Fail)]
pub enum CryptoError {
    #[fail(display = "AEAD authentication failed")]
    DecryptError,
    #[fail(display = "TLS alert {}", _0)]
    TlsAlert(u8),
}

impl From<CryptoError> for TransportError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::DecryptError => TransportError::crypto(20), // bad_record_mac
            CryptoError::TlsAlert(alert) => TransportError::crypto(alert),
        }
    }
}

/// Derive a stateless reset token for `cid` from a long-lived server
/// secret, so a server that has lost connection state can still emit a
/// recognizable stateless reset (RFC 9000 §10.3). Generalizes the
/// teacher's `reset_token_for(&ctx.listen_keys.reset, &local_id)`.
///
/// The concrete MAC is supplied by the caller's crypto provider; this
/// signature documents the contract (`key` identifies the server's
/// long-term secret, `id` is the connection ID being protected) that
/// `Endpoint` relies on.
pub fn reset_token_for(hmac_reset_key: &dyn Fn(&[u8]) -> [u8; crate::RESET_TOKEN_SIZE], id: &crate::packet::ConnectionId) -> [u8; crate::RESET_TOKEN_SIZE] {
    hmac_reset_key(id)
}

/// The caller-supplied crypto provider an [`crate::endpoint::Endpoint`]
/// uses to bootstrap connections, generalizing the teacher's concrete
/// `Crypto::new_initial`/`make_tls`/`reset_token_for(&ctx.listen_keys.reset, ..)`
/// trio (`endpoint.rs`) into a single trait object so this crate never
/// names a cipher suite or TLS library itself.
pub trait CryptoFactory: Send + Sync {
    /// Derive the Initial-epoch packet and header protection keys for
    /// `dst_cid` (RFC 9001 §5.2: these are computed from the
    /// destination connection ID of a client's first Initial packet
    /// using a version-specific public salt, not a handshake secret).
    fn initial_keys(&self, dst_cid: &crate::packet::ConnectionId, side: crate::Side) -> Box<dyn Keys>;

    /// Start a fresh TLS session for a new connection. `server_name` is
    /// `Some` only for a client dialing out (SNI); `None` for a server
    /// accepting.
    fn start_session(&self, side: crate::Side, server_name: Option<&str>) -> Box<dyn Session>;

    /// Derive this endpoint's stateless reset token for `id`, per
    /// [`reset_token_for`] but bound to the factory's own long-term
    /// secret rather than a caller-supplied closure.
    fn reset_token_for(&self, id: &crate::packet::ConnectionId) -> [u8; crate::RESET_TOKEN_SIZE];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_error_maps_to_bad_record_mac_alert() {
        let e: TransportError = CryptoError::DecryptError.into();
        assert_eq!(e.code(), 0x100 + 20);
    }

    #[test]
    fn tls_alert_maps_through_unchanged() {
        let e: TransportError = CryptoError::TlsAlert(42).into();
        assert_eq!(e.code(), 0x100 + 42);
    }

    #[test]
    fn reset_token_for_calls_provided_mac() {
        let id = crate::packet::ConnectionId::new(&[1, 2, 3, 4]);
        let token = reset_token_for(
            &|bytes| {
                let mut out = [0u8; crate::RESET_TOKEN_SIZE];
                out[0] = bytes[0];
                out
            },
            &id,
        );
        assert_eq!(token[0], 1);
    }
}
