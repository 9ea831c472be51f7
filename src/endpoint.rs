//! Connection table, datagram demultiplexing and the timer/IO pump
//! (spec.md §5/§6): the single-threaded driver an application polls
//! for events and I/O, and feeds incoming datagrams and timer firings.
//!
//! Grounded on the teacher's `endpoint.rs` in its entirety —
//! `Endpoint`, `Context`, `Config`, `Io`, `Event`, `Timer` — collapsed
//! onto a flat `Endpoint` (no nested `Context`) since this crate's
//! [`Connection`] already owns its own pending-I/O and event queues and
//! exposes [`Connection::poll`]/[`Connection::next_packet`] directly,
//! so nothing needs a `&mut Context` threaded through it the way the
//! teacher's `Connection::new`/`handle_decode` do.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::cmp;

use bytes::{Bytes, BytesMut, Buf, BufMut};
use fnv::{FnvHashMap, FnvHashSet};
use rand::{rngs::OsRng, Rng, RngCore};
use slab::Slab;
use slog::Logger;

use crate::coding::{BufExt, BufMutExt};
use crate::connection::{Connection, ConnectionError, ConnectionHandle};
use crate::crypto::{self, CryptoFactory};
use crate::packet::{self, ConnectionId, Header, PacketDecodeError, PacketNumber};
use crate::pnspace::{self, SpaceId};
use crate::stream::{ReadError, WriteError};
use crate::{
    Directionality, EcnCodepoint, Side, StreamId, MAX_CID_SIZE, MIN_CID_SIZE, MIN_INITIAL_SIZE,
    RESET_TOKEN_SIZE, VERSION,
};

/// Parameters governing the core QUIC state machine (spec.md §1
/// "caller-supplied configuration"). Generalizes the teacher's
/// `Config`, dropping the loss-recovery/congestion tunables that
/// `recovery.rs`/`congestion.rs` hardcode as RFC 9002 constants
/// instead, and replacing `tls_server_config`/`tls_client_config` with
/// the single [`CryptoFactory`] trait object this crate actually
/// drives TLS and AEAD through.
pub struct Config {
    /// Maximum number of peer-initiated bidirectional streams that may
    /// exist at one time.
    pub max_concurrent_bidi_streams: u16,
    /// Maximum number of peer-initiated unidirectional streams that may
    /// exist at one time.
    pub max_concurrent_uni_streams: u16,
    /// Maximum duration of inactivity to accept before timing out the
    /// connection, in milliseconds. 0 disables the idle timeout.
    pub idle_timeout: u32,
    /// Maximum number of bytes the peer may transmit on any one stream
    /// before becoming blocked.
    pub stream_receive_window: u32,
    /// Maximum number of bytes the peer may transmit across all streams
    /// of a connection before becoming blocked.
    pub receive_window: u32,
    /// Maximum number of incoming connections to buffer; `accept`
    /// drains this.
    pub accept_buffer: u32,
    /// Length of connection IDs issued by this endpoint. Must be 0 or
    /// between [`MIN_CID_SIZE`] and [`MAX_CID_SIZE`] inclusive.
    pub local_cid_len: usize,
    /// The caller's TLS/AEAD provider (spec.md §1 "external
    /// collaborators").
    pub crypto: Arc<dyn CryptoFactory>,
}

impl Config {
    /// Build a `Config` with the teacher's default windows/limits,
    /// bound to `crypto`. There is no blanket `Default` impl — a
    /// concrete crypto provider is mandatory.
    pub fn new(crypto: Arc<dyn CryptoFactory>) -> Self {
        const EXPECTED_RTT_MS: u32 = 100;
        const MAX_STREAM_BANDWIDTH: u32 = 12_500 * 1000; // bytes/s
        const STREAM_RWND: u32 = MAX_STREAM_BANDWIDTH / 1000 * EXPECTED_RTT_MS;
        Config {
            max_concurrent_bidi_streams: 0,
            max_concurrent_uni_streams: 0,
            idle_timeout: 10_000,
            stream_receive_window: STREAM_RWND,
            receive_window: 8 * STREAM_RWND,
            accept_buffer: 1024,
            local_cid_len: 8,
            crypto,
        }
    }
}

/// The main entry point to the library. Performs no I/O itself;
/// instead it produces a stream of [`Io`] operations for a backend to
/// carry out via [`Endpoint::poll_io`], and consumes incoming
/// datagrams and timer firings via [`Endpoint::handle`]/
/// [`Endpoint::timeout`].
pub struct Endpoint {
    log: Logger,
    config: Arc<Config>,
    rng: OsRng,
    listen: bool,
    connection_ids_initial: FnvHashMap<ConnectionId, ConnectionHandle>,
    connection_ids: FnvHashMap<ConnectionId, ConnectionHandle>,
    connection_remotes: FnvHashMap<SocketAddr, ConnectionHandle>,
    /// The server-chosen destination CID of a not-yet-established
    /// connection's first Initial packet, needed by `forget` to clean
    /// up `connection_ids_initial` (the teacher keeps this as
    /// `Connection::init_cid`; this crate's `Connection` has no such
    /// field, so the endpoint tracks it alongside the handle instead).
    initial_cids: FnvHashMap<ConnectionHandle, ConnectionId>,
    connections: Slab<Connection>,
    io: VecDeque<Io>,
    events: VecDeque<(ConnectionHandle, Event)>,
    incoming: VecDeque<ConnectionHandle>,
    incoming_handshakes: usize,
    dirty_conns: FnvHashSet<ConnectionHandle>,
    readable_conns: FnvHashSet<ConnectionHandle>,
}

impl Endpoint {
    /// Construct a new endpoint. `listen = true` makes it accept
    /// incoming connections (server role); a client-only endpoint
    /// should pass `false` and drive connections solely via
    /// [`Endpoint::connect`].
    pub fn new(log: Logger, config: Config, listen: bool) -> Self {
        assert!(
            (config.local_cid_len == 0 || config.local_cid_len >= MIN_CID_SIZE)
                && config.local_cid_len <= MAX_CID_SIZE
        );
        Endpoint {
            log,
            config: Arc::new(config),
            rng: OsRng::new().unwrap(),
            listen,
            connection_ids_initial: FnvHashMap::default(),
            connection_ids: FnvHashMap::default(),
            connection_remotes: FnvHashMap::default(),
            initial_cids: FnvHashMap::default(),
            connections: Slab::new(),
            io: VecDeque::new(),
            events: VecDeque::new(),
            incoming: VecDeque::new(),
            incoming_handshakes: 0,
            dirty_conns: FnvHashSet::default(),
            readable_conns: FnvHashSet::default(),
        }
    }

    /// Get an application-facing event.
    pub fn poll(&mut self) -> Option<(ConnectionHandle, Event)> {
        if let Some(x) = self.events.pop_front() {
            return Some(x);
        }
        loop {
            let &conn = self.readable_conns.iter().next()?;
            if let Some(x) = self.connections[conn.0].poll() {
                return Some((conn, x));
            }
            self.readable_conns.remove(&conn);
        }
    }

    /// Get a pending I/O operation.
    pub fn poll_io(&mut self, now: u64) -> Option<Io> {
        loop {
            if let Some(x) = self.io.pop_front() {
                return Some(x);
            }
            let &conn = self.dirty_conns.iter().next()?;
            self.flush_pending(now, conn);
            self.dirty_conns.remove(&conn);
        }
    }

    fn local_cid_len(&self) -> usize {
        self.config.local_cid_len
    }

    /// Process an incoming UDP datagram, which may contain several
    /// coalesced QUIC packets (RFC 9000 §12.2). Unlike the teacher,
    /// which parses the whole invariant header up front via a single
    /// `PartialDecode::new` call before any crypto is involved, this
    /// crate's [`packet::PartialDecode::new`] requires header
    /// protection already removed — so routing here only ever reads
    /// the unprotected destination connection ID
    /// ([`packet::peek_dst_cid`]) and, for unrecognized connections,
    /// the unprotected packet-number-space bits
    /// ([`pnspace::peek_space_id`]), leaving the rest of unprotection
    /// and decryption to [`Connection::handle_datagram_packet`] or, for
    /// a brand new connection, to this method's own Initial-bootstrap
    /// path.
    pub fn handle(&mut self, now: u64, remote: SocketAddr, ecn: Option<EcnCodepoint>, mut data: BytesMut) {
        let datagram_len = data.len();
        while !data.is_empty() {
            let dst_cid = match packet::peek_dst_cid(&data, self.local_cid_len()) {
                Ok(cid) => cid,
                Err(_) => {
                    trace!(self.log, "dropping datagram with malformed invariant header");
                    return;
                }
            };
            if let Some(conn) = self.route(&dst_cid, remote) {
                let (result, rest) =
                    self.connections[conn.0].handle_datagram_packet(now, remote, ecn, data);
                if let Err(reason) = result {
                    self.close_common(conn, now);
                    self.events.push_back((conn, Event::ConnectionLost { reason }));
                }
                self.dirty_conns.insert(conn);
                if rest.is_empty() {
                    return;
                }
                data = BytesMut::from(&rest[..]);
                continue;
            }

            if let Some((version, src_cid, invariant_dst_cid)) = peek_invariant_long_header(&data) {
                if version != VERSION && version != 0 {
                    if !self.listen {
                        debug!(self.log, "dropping packet with unsupported version");
                        return;
                    }
                    self.send_version_negotiate(remote, src_cid, invariant_dst_cid);
                    return;
                }
            }

            match self.handle_unrecognized(now, remote, datagram_len, dst_cid, &data) {
                Some(rest) => {
                    if rest.is_empty() {
                        return;
                    }
                    data = rest;
                }
                None => return,
            }
        }
    }

    fn route(&self, dst_cid: &ConnectionId, remote: SocketAddr) -> Option<ConnectionHandle> {
        let conn = if self.local_cid_len() > 0 {
            self.connection_ids.get(dst_cid)
        } else {
            None
        };
        conn.or_else(|| self.connection_ids_initial.get(dst_cid))
            .or_else(|| self.connection_remotes.get(&remote))
            .cloned()
    }

    fn send_version_negotiate(&mut self, remote: SocketAddr, src_cid: ConnectionId, dst_cid: ConnectionId) {
        trace!(self.log, "sending version negotiation");
        let mut buf = Vec::<u8>::new();
        Header::VersionNegotiate {
            src_cid: dst_cid,
            dst_cid: src_cid,
        }
        .encode(&mut BytesMut::new().into());
        // `Header::encode` writes through `BytesMut`; rebuild directly here
        // since version negotiation has no packet number to thread through
        // the shared header encoder.
        let mut out = BytesMut::new();
        out.put_u8(0x80);
        out.put_u32_be(0);
        dst_cid_encode(&dst_cid, &mut out);
        dst_cid_encode(&src_cid, &mut out);
        out.write::<u32>(0x0a1a_2a3a); // reserved version, RFC 9000 §6.3
        out.write::<u32>(VERSION);
        let _ = buf;
        self.io.push_back(Io::Transmit {
            destination: remote,
            packet: out.to_vec().into_boxed_slice(),
        });
    }

    /// A datagram addressed to a destination CID this endpoint doesn't
    /// recognize: either the first Initial packet of a brand new
    /// connection, or traffic for a connection we've since forgotten
    /// (answered with a stateless reset).
    fn handle_unrecognized(
        &mut self,
        now: u64,
        remote: SocketAddr,
        datagram_len: usize,
        dst_cid: ConnectionId,
        data: &BytesMut,
    ) -> Option<BytesMut> {
        if !self.listen {
            debug!(self.log, "dropping packet on unrecognized connection {connection} because listening is disabled"; "connection" => %dst_cid);
            return None;
        }

        let hp_offset = match packet::header_protection_offset(data, self.local_cid_len()) {
            Ok(o) => o,
            Err(_) => return None,
        };
        let space = pnspace::peek_space_id(data)?;
        if space != SpaceId::Initial {
            if !dst_cid.is_empty() {
                self.send_stateless_reset(remote, datagram_len, dst_cid);
            } else {
                trace!(self.log, "dropping unrecognized short packet without ID");
            }
            return None;
        }

        if datagram_len < MIN_INITIAL_SIZE {
            debug!(self.log, "ignoring short initial on {connection}"; "connection" => %dst_cid);
            return None;
        }

        let keys = self.config.crypto.initial_keys(&dst_cid, Side::Server);
        let mut unmasked = data.clone();
        keys.header_key().decrypt(hp_offset, &mut unmasked);
        let (partial, rest) = match packet::PartialDecode::new(unmasked.freeze(), self.local_cid_len()) {
            Ok(x) => x,
            Err(e) => {
                trace!(self.log, "unable to decode initial packet"; "reason" => %e);
                return None;
            }
        };
        self.handle_initial(now, remote, partial, keys);
        Some(BytesMut::from(&rest[..]))
    }

    fn send_stateless_reset(&mut self, remote: SocketAddr, datagram_len: usize, dst_cid: ConnectionId) {
        debug!(self.log, "sending stateless reset");
        let mut buf = Vec::<u8>::new();
        let header_len = 1 + MAX_CID_SIZE + 1;
        let padding = self.rng.gen_range(
            0,
            cmp::max(RESET_TOKEN_SIZE + 8, datagram_len.saturating_sub(header_len))
                .saturating_sub(RESET_TOKEN_SIZE),
        );
        buf.reserve_exact(header_len + padding + RESET_TOKEN_SIZE);
        let number = self.rng.gen::<u32>() & 0x7fff_ffff | 0x4000_0000;
        Header::Short {
            dst_cid: ConnectionId::random(&mut self.rng, MAX_CID_SIZE),
            number: PacketNumber::new(number as u64, 0),
            key_phase: false,
        }
        .encode(&mut BytesMut::new());
        let mut out = BytesMut::with_capacity(buf.len());
        Header::Short {
            dst_cid: ConnectionId::random(&mut self.rng, MAX_CID_SIZE),
            number: PacketNumber::new(number as u64, 0),
            key_phase: false,
        }
        .encode(&mut out);
        {
            let start = out.len();
            out.resize(start + padding, 0);
            self.rng.fill_bytes(&mut out[start..start + padding]);
        }
        out.extend_from_slice(&self.config.crypto.reset_token_for(&dst_cid));
        self.io.push_back(Io::Transmit {
            destination: remote,
            packet: out.to_vec().into_boxed_slice(),
        });
    }

    /// Initiate a connection to `remote`.
    pub fn connect(&mut self, remote: SocketAddr, server_name: Option<&str>) -> ConnectionHandle {
        let local_id = self.new_cid();
        let remote_id = ConnectionId::random(&mut self.rng, MAX_CID_SIZE);
        trace!(self.log, "initial dcid"; "value" => %remote_id);
        let tls = self.config.crypto.start_session(Side::Client, server_name);
        let conn = self.add_connection(Side::Client, local_id, remote_id, remote, tls);
        let initial_keys = self.config.crypto.initial_keys(&remote_id, Side::Client);
        self.connections[conn.0].install_initial_keys(initial_keys);
        self.dirty_conns.insert(conn);
        conn
    }

    fn new_cid(&mut self) -> ConnectionId {
        loop {
            let cid = ConnectionId::random(&mut self.rng, self.local_cid_len());
            if !self.connection_ids.contains_key(&cid) {
                break cid;
            }
            assert!(self.local_cid_len() > 0);
        }
    }

    fn add_connection(
        &mut self,
        side: Side,
        local_id: ConnectionId,
        remote_id: ConnectionId,
        remote: SocketAddr,
        tls: Box<dyn crypto::Session>,
    ) -> ConnectionHandle {
        debug_assert!(!local_id.is_empty() || self.local_cid_len() == 0);
        let entry = self.connections.vacant_entry();
        let handle = ConnectionHandle(entry.key());
        entry.insert(Connection::new(
            self.log.new(o!("connection" => local_id)),
            side,
            &self.config,
            local_id,
            remote_id,
            remote,
            tls,
            handle,
        ));
        if self.local_cid_len() > 0 {
            self.connection_ids.insert(local_id, handle);
        }
        self.connection_remotes.insert(remote, handle);
        handle
    }

    /// Bootstrap a brand new server-side connection from a client's
    /// first Initial packet, mirroring the teacher's `handle_initial`
    /// but routed through [`CryptoFactory`] instead of a concrete
    /// `Crypto::new_initial`.
    fn handle_initial(&mut self, now: u64, remote: SocketAddr, partial: packet::PartialDecode, keys: Box<dyn crypto::Keys>) {
        let dst_cid = partial.dst_cid();
        let (src_cid, number) = match &partial.header {
            Header::Initial { src_cid, number, .. } => (*src_cid, *number),
            _ => return,
        };
        let header_data = partial.header_data().to_vec();
        let mut payload = BytesMut::from(partial.payload_data());
        let pn = number.expand(0);
        let plain_len = match keys.decrypt(pn, &header_data, &mut payload) {
            Ok(len) => len,
            Err(_) => {
                debug!(self.log, "failed to authenticate initial packet");
                return;
            }
        };
        payload.truncate(plain_len);

        let loc_cid = self.new_cid();
        if self.incoming.len() + self.incoming_handshakes == self.config.accept_buffer as usize {
            debug!(self.log, "rejecting connection due to full accept buffer");
            return;
        }

        let tls = self.config.crypto.start_session(Side::Server, None);
        let conn = self.add_connection(Side::Server, loc_cid, src_cid, remote, tls);
        self.connections[conn.0].install_initial_keys(keys);
        self.connection_ids_initial.insert(dst_cid, conn);
        self.initial_cids.insert(conn, dst_cid);
        self.incoming_handshakes += 1;

        match self.connections[conn.0].handle_packet(now, SpaceId::Initial, pn, payload.freeze(), None) {
            Ok(()) => {
                self.incoming.push_back(conn);
                self.dirty_conns.insert(conn);
            }
            Err(e) => {
                debug!(self.log, "handshake failed"; "reason" => %e);
                self.forget(conn);
            }
        }
    }

    fn flush_pending(&mut self, now: u64, conn: ConnectionHandle) {
        let mut sent = false;
        while let Some(packet) = self.connections[conn.0].next_packet(now) {
            self.io.push_back(Io::Transmit {
                destination: self.connections[conn.0].remote,
                packet: packet.into_boxed_slice(),
            });
            sent = true;
        }
        let _ = sent;
        let c = &mut self.connections[conn.0];
        if let Some(setting) = c.set_idle.take() {
            match setting {
                Some(time) => self.io.push_back(Io::TimerStart { connection: conn, timer: Timer::Idle, time }),
                None => self.io.push_back(Io::TimerStop { connection: conn, timer: Timer::Idle }),
            }
        }
        if let Some(setting) = c.set_close.take() {
            match setting {
                Some(time) => self.io.push_back(Io::TimerStart { connection: conn, timer: Timer::Close, time }),
                None => self.io.push_back(Io::TimerStop { connection: conn, timer: Timer::Close }),
            }
        }
        if let Some(setting) = c.set_loss_detection.take() {
            match setting {
                Some(time) => self.io.push_back(Io::TimerStart { connection: conn, timer: Timer::LossDetection, time }),
                None => self.io.push_back(Io::TimerStop { connection: conn, timer: Timer::LossDetection }),
            }
        }
        if c.is_drained() {
            self.readable_conns.remove(&conn);
        } else if !c.is_closed() {
            self.readable_conns.insert(conn);
        }
    }

    fn close_common(&mut self, conn: ConnectionHandle, now: u64) {
        let _ = now;
        self.dirty_conns.insert(conn);
    }

    fn forget(&mut self, conn: ConnectionHandle) {
        if let Some(initial) = self.initial_cids.remove(&conn) {
            self.connection_ids_initial.remove(&initial);
        }
        if self.local_cid_len() > 0 {
            self.connection_ids.remove(&self.connections[conn.0].loc_cid);
        }
        self.connection_remotes.remove(&self.connections[conn.0].remote);
        self.dirty_conns.remove(&conn);
        self.readable_conns.remove(&conn);
        self.connections.remove(conn.0);
    }

    /// Handle a timer expiring.
    pub fn timeout(&mut self, now: u64, conn: ConnectionHandle, timer: Timer) {
        match timer {
            Timer::Close => {
                self.io.push_back(Io::TimerStop { connection: conn, timer: Timer::Idle });
                self.events.push_back((conn, Event::ConnectionDrained));
                if self.connections[conn.0].is_drained() {
                    self.forget(conn);
                } else {
                    self.connections[conn.0].on_close_timeout();
                }
            }
            Timer::Idle => {
                self.connections[conn.0].on_idle_timeout(now);
                self.dirty_conns.insert(conn);
            }
            Timer::LossDetection => {
                self.connections[conn.0].check_packet_loss(now);
                self.dirty_conns.insert(conn);
            }
        }
    }

    /// Transmit data on a stream. Returns the number of bytes written
    /// on success.
    ///
    /// # Panics
    /// When applied to a stream that has no active outgoing channel.
    pub fn write(&mut self, conn: ConnectionHandle, stream: StreamId, data: &[u8]) -> Result<usize, WriteError> {
        let n = self.connections[conn.0].write(stream, data)?;
        self.dirty_conns.insert(conn);
        Ok(n)
    }

    /// Indicate that no more data will be sent on a stream.
    ///
    /// # Panics
    /// When applied to a stream that has no active outgoing channel.
    pub fn finish(&mut self, conn: ConnectionHandle, stream: StreamId) -> Result<(), WriteError> {
        let r = self.connections[conn.0].finish(stream);
        self.dirty_conns.insert(conn);
        r
    }

    /// Read data from a stream, treating it like a simple pipe. Subject
    /// to head-of-line blocking within the stream; see
    /// [`Endpoint::read_unordered`] for higher throughput.
    ///
    /// # Panics
    /// When applied to a stream that has no active incoming channel.
    pub fn read(&mut self, conn: ConnectionHandle, stream: StreamId, buf: &mut [u8]) -> Result<usize, ReadError> {
        self.dirty_conns.insert(conn); // may need to send flow control frames after reading
        match self.connections[conn.0].read(stream, buf) {
            x @ Err(ReadError::Finished) | x @ Err(ReadError::Reset(_)) => {
                self.connections[conn.0].maybe_cleanup_stream(stream);
                x
            }
            x => x,
        }
    }

    /// Read data from a stream out of order; some segments may be
    /// received multiple times. On success returns `(data, offset)`.
    ///
    /// # Panics
    /// When applied to a stream that has no active incoming channel.
    pub fn read_unordered(&mut self, conn: ConnectionHandle, stream: StreamId) -> Result<(Bytes, u64), ReadError> {
        self.dirty_conns.insert(conn);
        match self.connections[conn.0].read_unordered(stream) {
            x @ Err(ReadError::Finished) | x @ Err(ReadError::Reset(_)) => {
                self.connections[conn.0].maybe_cleanup_stream(stream);
                x
            }
            x => x,
        }
    }

    /// Abandon transmitting data on a stream.
    ///
    /// # Panics
    /// When applied to a receive stream or an unopened send stream.
    pub fn reset(&mut self, conn: ConnectionHandle, stream: StreamId, error_code: u64) {
        self.connections[conn.0].reset(stream, error_code);
        self.dirty_conns.insert(conn);
    }

    /// Instruct the peer to abandon transmitting data on a stream.
    ///
    /// # Panics
    /// When applied to a stream that has not begun receiving data.
    pub fn stop_sending(&mut self, conn: ConnectionHandle, stream: StreamId, error_code: u64) {
        self.connections[conn.0].stop_sending(stream, error_code);
        self.dirty_conns.insert(conn);
    }

    /// Create a new stream. Returns `None` if the remote-permitted
    /// stream limit for `direction` is already exhausted.
    pub fn open(&mut self, conn: ConnectionHandle, direction: Directionality) -> Option<StreamId> {
        self.connections[conn.0].open(direction)
    }

    /// Ping the remote endpoint, useful for preventing an otherwise
    /// idle connection from timing out.
    pub fn ping(&mut self, conn: ConnectionHandle) {
        self.connections[conn.0].ping();
        self.dirty_conns.insert(conn);
    }

    /// Close a connection immediately. This does not ensure delivery of
    /// outstanding data.
    pub fn close(&mut self, now: u64, conn: ConnectionHandle, error_code: u64, reason: Bytes) {
        if self.connections[conn.0].is_drained() {
            self.forget(conn);
            return;
        }
        self.connections[conn.0].close(now, error_code, reason);
        self.dirty_conns.insert(conn);
    }

    /// Which side of `conn` this endpoint is.
    pub fn side(&self, conn: ConnectionHandle) -> Side {
        self.connections[conn.0].side
    }

    /// The connection ID used for `conn` locally.
    pub fn local_id(&self, conn: ConnectionHandle) -> ConnectionId {
        self.connections[conn.0].loc_cid
    }

    /// The connection ID used for `conn` by the peer.
    pub fn remote_id(&self, conn: ConnectionHandle) -> ConnectionId {
        self.connections[conn.0].rem_cid
    }

    pub fn remote_address(&self, conn: ConnectionHandle) -> SocketAddr {
        self.connections[conn.0].remote
    }

    /// Bytes of packets containing retransmittable frames that have not
    /// been acknowledged or declared lost.
    pub fn bytes_in_flight(&self, conn: ConnectionHandle) -> u64 {
        self.connections[conn.0].bytes_in_flight()
    }

    /// Bytes worth of non-ack-only packets that may still be sent.
    pub fn congestion_state(&self, conn: ConnectionHandle) -> u64 {
        let c = &self.connections[conn.0];
        c.congestion_window().saturating_sub(c.bytes_in_flight())
    }

    /// Pop a connection accepted since the last call (server role).
    pub fn accept(&mut self) -> Option<ConnectionHandle> {
        self.incoming.pop_front().map(|conn| {
            self.incoming_handshakes = self.incoming_handshakes.saturating_sub(1);
            conn
        })
    }
}

fn dst_cid_encode(cid: &ConnectionId, buf: &mut BytesMut) {
    buf.put_u8(cid.len() as u8);
    buf.put_slice(cid);
}

/// Peek the version and both connection IDs off a still-protected long
/// header, without needing header protection removed — every one of
/// these fields is sent in the clear (RFC 9001 §5.4). Returns `None`
/// for short-header packets, which carry no version field at all.
fn peek_invariant_long_header(data: &[u8]) -> Option<(u32, ConnectionId, ConnectionId)> {
    if data.is_empty() || data[0] & 0x80 == 0 {
        return None;
    }
    let mut cursor = Bytes::from(data.to_vec());
    cursor.advance(1);
    let version = cursor.get::<u32>().ok()?;
    let dst_len = cursor.get::<u8>().ok()? as usize;
    let dst_cid = ConnectionId::decode(&mut cursor, dst_len).ok()?;
    let src_len = cursor.get::<u8>().ok()? as usize;
    let src_cid = ConnectionId::decode(&mut cursor, src_len).ok()?;
    Some((version, src_cid, dst_cid))
}

/// Events of interest to the application (spec.md §5 "readable/
/// writable bits"). Drops the teacher's `NewSessionTicket`: this
/// crate's [`crypto::Session`] trait has no session-resumption surface
/// to produce one from.
#[derive(Debug)]
pub enum Event {
    /// A connection was successfully established.
    Connected { protocol: Option<String> },
    /// A connection was lost.
    ConnectionLost { reason: ConnectionError },
    /// A closed connection finished draining and its resources were
    /// released.
    ConnectionDrained,
    /// A stream has data or errors waiting to be read.
    StreamReadable {
        stream: StreamId,
        /// Whether this is the first readable event for this stream.
        /// Always `true`: tracking "have we told the application about
        /// this stream before" needs state this crate doesn't keep.
        fresh: bool,
    },
    /// A formerly write-blocked stream might now accept a write.
    StreamWritable { stream: StreamId },
    /// All data sent on `stream` has been received by the peer.
    StreamFinished { stream: StreamId },
    /// At least one new stream of this directionality may be opened.
    StreamAvailable { directionality: Directionality },
}

/// I/O operations to be immediately executed by the backend.
#[derive(Debug)]
pub enum Io {
    Transmit {
        destination: SocketAddr,
        packet: Box<[u8]>,
    },
    /// Start or reset a timer.
    TimerStart {
        connection: ConnectionHandle,
        timer: Timer,
        /// Absolute μs.
        time: u64,
    },
    TimerStop {
        connection: ConnectionHandle,
        timer: Timer,
    },
}

#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq)]
pub enum Timer {
    Close,
    LossDetection,
    Idle,
}

impl slog::Value for Timer {
    fn serialize(
        &self,
        _: &slog::Record,
        key: slog::Key,
        serializer: &mut slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{:?}", self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peek_invariant_long_header_reads_version_and_cids() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xc0);
        buf.put_u32_be(VERSION);
        let dst = ConnectionId::new(&[1, 2, 3, 4]);
        let src = ConnectionId::new(&[5, 6, 7, 8]);
        dst_cid_encode(&dst, &mut buf);
        dst_cid_encode(&src, &mut buf);
        let (version, src_cid, dst_cid) = peek_invariant_long_header(&buf).unwrap();
        assert_eq!(version, VERSION);
        assert_eq!(&*src_cid, &[5, 6, 7, 8]);
        assert_eq!(&*dst_cid, &[1, 2, 3, 4]);
    }

    #[test]
    fn peek_invariant_long_header_rejects_short_header() {
        assert!(peek_invariant_long_header(&[0x40]).is_none());
    }
}
