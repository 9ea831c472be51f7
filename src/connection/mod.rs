//! The per-connection orchestrator (spec.md §3/§5): owns the three
//! packet-number spaces, the stream table, loss recovery and
//! congestion control, and drives the connection/stream state
//! machines from decoded frames and application calls.
//!
//! Grounded on the teacher's `connection.rs` in its entirety —
//! `Connection`, `State`, `Retransmits`, `ConnectionError`,
//! `handle_packet`/`handle_connected_inner`/`process_payload`/
//! `next_packet` — generalized onto the already-factored
//! `pnspace`/`frame`/`stream`/`recovery`/`congestion` modules instead
//! of inlining their logic directly on `Connection`.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use fnv::FnvHashSet;
use slog::Logger;

use crate::coding::BufMutExt;
use crate::congestion::{Controller, NewReno};
use crate::crypto::{self, Epoch};
use crate::endpoint::{Config, Event};
use crate::frame::{self, Frame};
use crate::packet::{self, set_payload_length, ConnectionId, Header, LongType, PacketNumber};
use crate::pnspace::{peek_space_id, PnSpace, SentPacket, SpaceId};
use crate::recovery::LossDetection;
use crate::stream::{self, ReadError, Streams, WriteError};
use crate::transport_parameters::TransportParameters;
use crate::{Directionality, Side, StreamId, TransportError, MIN_MTU};

pub mod state;

/// Bound on how many packets may carry the CONNECTION_CLOSE frame
/// while closing (spec.md §4.4: "up to 3·PTO times"), so a
/// persistently-lossy peer can't keep a closing connection's `Closed`
/// state alive forever via repeated traffic.
const CLOSE_FRAME_RETRANSMITS: u32 = 3;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConnectionHandle(pub usize);

impl From<ConnectionHandle> for usize {
    fn from(x: ConnectionHandle) -> usize {
        x.0
    }
}

/// Reasons a connection might be lost (spec.md §3 "state ∈ {...}").
#[derive(Debug, Clone, Fail)]
pub enum ConnectionError {
    #[fail(display = "peer doesn't implement any supported version")]
    VersionMismatch,
    #[fail(display = "{}", error_code)]
    TransportError { error_code: TransportError },
    #[fail(display = "closed by peer: {:#x}", error_code)]
    ConnectionClosed { error_code: u64 },
    #[fail(display = "closed by application: {:#x}", error_code)]
    ApplicationClosed { error_code: u64 },
    #[fail(display = "reset by peer")]
    Reset,
    #[fail(display = "timed out")]
    TimedOut,
}

impl From<TransportError> for ConnectionError {
    fn from(x: TransportError) -> Self {
        ConnectionError::TransportError { error_code: x }
    }
}

impl From<state::CloseReason> for ConnectionError {
    fn from(cr: state::CloseReason) -> Self {
        match cr {
            state::CloseReason::Connection(code) => {
                ConnectionError::ConnectionClosed { error_code: code }
            }
            state::CloseReason::Application(code) => {
                ConnectionError::ApplicationClosed { error_code: code }
            }
        }
    }
}

/// Connection-level state machine (spec.md §3 "idle, opening,
/// established, closing, draining, closed").
pub enum State {
    Handshake,
    Established,
    HandshakeFailed(state::CloseReason),
    Closed(state::Closed),
    Draining,
    /// Closed and drained; waiting for the application to acknowledge
    /// disposal so resources can be freed.
    Drained,
}

impl State {
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            State::HandshakeFailed(_) | State::Closed(_) | State::Draining | State::Drained
        )
    }

    pub fn is_drained(&self) -> bool {
        matches!(self, State::Drained)
    }
}

/// Control frames queued for (re)transmission but not yet placed in a
/// packet (spec.md §3 "pending control-frame flags").
#[derive(Debug, Default)]
pub struct Retransmits {
    pub max_data: bool,
    pub max_streams_bidi: bool,
    pub max_streams_uni: bool,
    pub ping: bool,
    pub stream: VecDeque<StreamId>,
    pub path_response: Option<[u8; crate::PATH_CHALLENGE_SIZE]>,
    pub rst_stream: Vec<(StreamId, u64)>,
    pub stop_sending: Vec<(StreamId, u64)>,
    pub max_stream_data: FnvHashSet<StreamId>,
}

impl Retransmits {
    fn is_empty(&self) -> bool {
        !self.max_data
            && !self.max_streams_bidi
            && !self.max_streams_uni
            && !self.ping
            && self.stream.is_empty()
            && self.path_response.is_none()
            && self.rst_stream.is_empty()
            && self.stop_sending.is_empty()
            && self.max_stream_data.is_empty()
    }
}

/// One endpoint's half of a QUIC connection (spec.md §3 "Connection").
pub struct Connection {
    log: Logger,
    pub side: Side,
    pub handle: ConnectionHandle,
    pub state: State,
    pub loc_cid: ConnectionId,
    pub rem_cid: ConnectionId,
    pub remote: SocketAddr,

    tls: Box<dyn crypto::Session>,
    keys: [Option<Box<dyn crypto::Keys>>; 3],

    spaces: [PnSpace; 3],
    streams: Streams,
    loss: LossDetection,
    cc: Box<dyn Controller>,

    params: TransportParameters,
    pub remote_params: Option<TransportParameters>,

    pub pending: Retransmits,
    events: VecDeque<Event>,

    pub app_closed: bool,
    error: Option<ConnectionError>,

    idle_timeout_us: u64,
    last_activity: u64,
    /// μs absolute time the draining-to-drained close timer fires, once
    /// armed (spec.md §4.4 "CONNECTION_CLOSE" 3×PTO rule).
    close_deadline: Option<u64>,
    /// The CONNECTION_CLOSE frame to (re)send while closing, `None` for
    /// a silent close such as an idle timeout (spec.md §7 "err_close").
    close_reason_frame: Option<frame::Close>,
    /// Remaining number of packets allowed to carry
    /// `close_reason_frame`, decremented each time it's sent (spec.md
    /// §4.4: "up to 3·PTO times").
    close_frame_remaining: u32,

    // Timer updates for the endpoint pump to apply: `None` = no change,
    // `Some(None)` = stop, `Some(Some(_))` = (re)start at this deadline.
    pub set_idle: Option<Option<u64>>,
    pub set_close: Option<Option<u64>>,
    pub set_loss_detection: Option<Option<u64>>,
}

fn space_index(id: SpaceId) -> usize {
    match id {
        SpaceId::Initial => 0,
        SpaceId::Handshake => 1,
        SpaceId::Application => 2,
    }
}

fn epoch_for_space(id: SpaceId) -> Epoch {
    match id {
        SpaceId::Initial => Epoch::Initial,
        SpaceId::Handshake => Epoch::Handshake,
        SpaceId::Application => Epoch::Application,
    }
}

/// The packet-number space and still-truncated wire packet number
/// carried by a decoded header, or `None` for headers that carry
/// neither (`Retry`, `VersionNegotiate`).
fn space_and_number(header: &Header) -> Option<(SpaceId, PacketNumber)> {
    match *header {
        Header::Initial { number, .. } => Some((SpaceId::Initial, number)),
        Header::Long { ty: LongType::Handshake, number, .. } => Some((SpaceId::Handshake, number)),
        Header::Short { number, .. } => Some((SpaceId::Application, number)),
        Header::Long { ty: LongType::ZeroRtt, .. }
        | Header::Long { ty: LongType::Initial, .. }
        | Header::Retry { .. }
        | Header::VersionNegotiate { .. } => None,
    }
}

/// A plaintext wire packet ready for the AEAD seal and header
/// protection applied by [`Connection::seal_packet`]: `header_len` is
/// the count of bytes preceding the payload (associated data for the
/// AEAD), `pn_offset` the offset of the packet-number field within
/// that header (sampled and masked by header protection).
struct BuiltPacket {
    id: SpaceId,
    pn: u64,
    header_len: usize,
    pn_offset: usize,
    length_field_offset: Option<usize>,
    buf: BytesMut,
}

impl Connection {
    pub fn new(
        log: Logger,
        side: Side,
        config: &Config,
        loc_cid: ConnectionId,
        rem_cid: ConnectionId,
        remote: SocketAddr,
        tls: Box<dyn crypto::Session>,
        handle: ConnectionHandle,
    ) -> Self {
        Connection {
            log,
            side,
            handle,
            state: State::Handshake,
            loc_cid,
            rem_cid,
            remote,
            tls,
            keys: [None, None, None],
            spaces: [PnSpace::new(), PnSpace::new(), PnSpace::new()],
            streams: Streams::new(
                side,
                config.stream_receive_window as u64,
                config.receive_window as u64,
            ),
            loss: LossDetection::new(),
            cc: Box::new(NewReno::new()),
            params: TransportParameters::new(config),
            remote_params: None,
            pending: Retransmits::default(),
            events: VecDeque::new(),
            app_closed: false,
            error: None,
            idle_timeout_us: (config.idle_timeout as u64) * 1000,
            last_activity: 0,
            close_deadline: None,
            close_reason_frame: None,
            close_frame_remaining: 0,
            set_idle: None,
            set_close: None,
            set_loss_detection: None,
        }
    }

    fn space(&self, id: SpaceId) -> &PnSpace {
        &self.spaces[space_index(id)]
    }

    fn space_mut(&mut self, id: SpaceId) -> &mut PnSpace {
        &mut self.spaces[space_index(id)]
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn is_drained(&self) -> bool {
        self.state.is_drained()
    }

    /// Bytes of ack-eliciting packets sent but not yet acknowledged or
    /// declared lost, across all three spaces.
    pub fn bytes_in_flight(&self) -> u64 {
        self.total_in_flight()
    }

    /// Bytes of non-ack-only packets the congestion controller currently
    /// permits sending.
    pub fn congestion_window(&self) -> u64 {
        self.cc.window()
    }

    pub fn poll(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Install keys for `epoch` once the TLS session has produced them;
    /// called after every `read_handshake`/`write_handshake` pump
    /// (spec.md §4.3 "per-epoch ... crypto contexts").
    fn update_keys(&mut self, now: u64) {
        while let Some(keys) = self.tls.next_keys() {
            // `next_keys` yields in epoch order; find the first empty
            // slot at or after the current handshake progress.
            for (i, slot) in self.keys.iter_mut().enumerate() {
                if slot.is_none() {
                    *slot = Some(keys);
                    break;
                }
                let _ = i;
            }
            if !self.tls.is_handshaking() && matches!(self.state, State::Handshake) {
                debug!(self.log, "handshake complete, keys installed"; "side" => self.side);
                self.state = State::Established;
                self.events.push_back(Event::Connected { protocol: None });
                if self.side.is_server() {
                    self.pending.ping = false;
                }
                self.reset_idle_timeout(now);
            }
        }
        if let Some(params) = self.tls.transport_parameters() {
            self.remote_params = Some(params);
        }
    }

    /// Handle one already-decrypted packet's plaintext payload
    /// (spec.md §4.4 decode contract; §5 "Control flow").
    pub fn handle_packet(
        &mut self,
        now: u64,
        space_id: SpaceId,
        pn: u64,
        payload: Bytes,
        ecn: Option<crate::EcnCodepoint>,
    ) -> Result<(), ConnectionError> {
        if self.state.is_closed() {
            self.maybe_enter_draining(now);
            return Ok(());
        }
        trace!(self.log, "got packet"; "pn" => pn, "space" => ?space_id, "len" => payload.len());
        self.last_activity = now;
        let epoch_restricted = space_id != SpaceId::Application;
        let mut cursor: &[u8] = &payload;
        let mut ack_eliciting = false;
        let mut imm_ack = false;
        let mut iter = frame::Iter::new(&mut cursor, epoch_restricted);
        loop {
            let frame = match iter.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!(self.log, "frame decode failed"; "reason" => %e);
                    return self.err_close(now, e);
                }
            };
            if frame.is_ack_eliciting() {
                ack_eliciting = true;
            }
            if frame.wants_immediate_ack() {
                imm_ack = true;
            }
            if let Err(e) = self.handle_frame(now, space_id, frame) {
                warn!(self.log, "closing due to frame processing error"; "reason" => %e);
                return self.err_close(now, e);
            }
        }
        self.space_mut(space_id)
            .on_received(now, pn, ack_eliciting, imm_ack, ecn);
        self.set_loss_detection = Some(self.loss_detection_deadline());
        while let Some(id) = self.streams.read() {
            self.events.push_back(Event::StreamReadable { stream: id, fresh: true });
        }
        Ok(())
    }

    /// Install the Initial-epoch keys an [`crate::endpoint::Endpoint`]
    /// derived via [`crypto::CryptoFactory::initial_keys`] before the
    /// first packet for a brand new connection is decoded.
    pub(crate) fn install_initial_keys(&mut self, keys: Box<dyn crypto::Keys>) {
        self.keys[space_index(SpaceId::Initial)] = Some(keys);
    }

    /// Unprotect and decrypt the leading packet of `data` — a datagram,
    /// or what's left of one after a prior coalesced packet was peeled
    /// off — whose destination connection ID this connection already
    /// owns, then hand the plaintext payload to
    /// [`Connection::handle_packet`] (spec.md §1: "header
    /// encryption/AEAD is external", generalizing the teacher's
    /// (unshown) `Connection::handle_decode` called from
    /// `endpoint.rs`'s `handle_decode`). Returns the bytes of any
    /// further coalesced packets in the same datagram (RFC 9000 §12.2),
    /// or empty once nothing further can be located. A decode or
    /// authentication failure is not a [`ConnectionError`] — such
    /// packets are simply dropped and parsing resumes at the next
    /// coalesced packet, if the failure occurred late enough to know
    /// where that is.
    pub(crate) fn handle_datagram_packet(
        &mut self,
        now: u64,
        remote: SocketAddr,
        ecn: Option<crate::EcnCodepoint>,
        mut data: BytesMut,
    ) -> (Result<(), ConnectionError>, Bytes) {
        let local_cid_len = self.loc_cid.len();
        let hp_offset = match packet::header_protection_offset(&data, local_cid_len) {
            Ok(o) => o,
            Err(_) => return (Ok(()), Bytes::new()),
        };
        let space_id = match peek_space_id(&data) {
            Some(s) => s,
            None => return (Ok(()), Bytes::new()),
        };
        {
            let keys = match self.keys[space_index(space_id)].as_ref() {
                Some(k) => k,
                None => return (Ok(()), Bytes::new()),
            };
            keys.header_key().decrypt(hp_offset, &mut data);
        }
        let (partial, rest) = match packet::PartialDecode::new(data.freeze(), local_cid_len) {
            Ok(x) => x,
            Err(_) => return (Ok(()), Bytes::new()),
        };
        let (space_id, number) = match space_and_number(&partial.header) {
            Some(x) => x,
            None => return (Ok(()), rest),
        };
        let expected = self.space(space_id).largest_received.map_or(0, |l| l + 1);
        let pn = number.expand(expected);
        let header_data = partial.header_data().to_vec();
        let mut payload = BytesMut::from(partial.payload_data());
        let plain_len = {
            let keys = match self.keys[space_index(space_id)].as_ref() {
                Some(k) => k,
                None => return (Ok(()), rest),
            };
            match keys.decrypt(pn, &header_data, &mut payload) {
                Ok(len) => len,
                Err(_) => return (Ok(()), rest),
            }
        };
        payload.truncate(plain_len);
        self.remote = remote;
        (self.handle_packet(now, space_id, pn, payload.freeze(), ecn), rest)
    }

    /// `err_close` (spec.md §7): fold a locally-detected
    /// `TransportError` into the closing-state transition and surface
    /// it to the application as a lost-connection event.
    fn err_close(&mut self, now: u64, error: TransportError) -> Result<(), ConnectionError> {
        self.close_for_error(now, error);
        self.events.push_back(Event::ConnectionLost {
            reason: error.into(),
        });
        Ok(())
    }

    fn handle_frame(
        &mut self,
        now: u64,
        space_id: SpaceId,
        frame: Frame,
    ) -> Result<(), TransportError> {
        match frame {
            Frame::Padding | Frame::Ping => {}
            Frame::Ack(ack) => self.on_ack_received(now, space_id, ack)?,
            Frame::Crypto { offset, data } => {
                self.tls
                    .read_handshake(epoch_for_space(space_id), &data)
                    .map_err(|_| TransportError::TLS_HANDSHAKE_FAILED_SHORTHAND())?;
                let _ = offset;
                self.update_keys(now);
            }
            Frame::NewToken { .. } => {}
            Frame::Stream(s) => {
                self.streams.received_stream(s.id, s.offset, s.data, s.fin)?;
            }
            Frame::ResetStream {
                id,
                error_code,
                final_offset,
            } => {
                self.streams
                    .received_reset_stream(id, error_code, final_offset)?;
            }
            Frame::StopSending { id, error_code } => {
                self.streams.received_stop_sending(id, error_code);
            }
            Frame::MaxData(limit) => {
                self.streams.max_data = self.streams.max_data.max(limit);
                if self.streams.data_sent < self.streams.max_data {
                    self.streams.data_blocked = false;
                }
            }
            Frame::MaxStreamData { id, offset } => {
                if let Some(send) = self.streams.get_send_mut(id) {
                    send.max_data = send.max_data.max(offset);
                    self.events.push_back(Event::StreamWritable { stream: id });
                }
            }
            Frame::MaxStreams { dir, count } => match dir {
                Directionality::Bi => {
                    self.streams.max_bi = self.streams.max_bi.max(count);
                    if self.streams.max_streams_bidi_blocked {
                        self.streams.max_streams_bidi_blocked = false;
                        self.events.push_back(Event::StreamAvailable { directionality: dir });
                    }
                }
                Directionality::Uni => {
                    self.streams.max_uni = self.streams.max_uni.max(count);
                    if self.streams.max_streams_uni_blocked {
                        self.streams.max_streams_uni_blocked = false;
                        self.events.push_back(Event::StreamAvailable { directionality: dir });
                    }
                }
            },
            Frame::DataBlocked { .. } => {
                // The peer is stalled below our current connection-level
                // limit; re-announce it in case our last MAX_DATA was
                // lost, even though `do_conn_fc` won't have grown it.
                self.pending.max_data = true;
            }
            Frame::StreamDataBlocked { id, .. } => {
                self.streams.note_stream_data_blocked(id);
            }
            Frame::StreamsBlocked { dir, .. } => match dir {
                Directionality::Bi => self.pending.max_streams_bidi = true,
                Directionality::Uni => self.pending.max_streams_uni = true,
            },
            Frame::NewConnectionId { .. } | Frame::RetireConnectionId { .. } => {
                // Connection-migration support is out of scope
                // (spec.md §1 Non-goals: "multipath").
            }
            Frame::PathChallenge(token) => {
                self.pending.path_response = Some(token);
            }
            Frame::PathResponse(_) => {}
            Frame::Close(c) => {
                let reason = if c.is_transport_layer() {
                    state::CloseReason::Connection(c.error_code)
                } else {
                    state::CloseReason::Application(c.error_code)
                };
                debug!(self.log, "peer closed connection"; "error_code" => c.error_code);
                self.error = Some(reason.clone().into());
                self.state = State::Draining;
                self.events.push_back(Event::ConnectionLost {
                    reason: reason.into(),
                });
                self.arm_close_timer(now);
            }
            Frame::HandshakeDone => {
                if self.side.is_client() {
                    trace!(self.log, "handshake confirmed");
                    self.state = State::Established;
                }
            }
        }
        Ok(())
    }

    fn on_ack_received(
        &mut self,
        now: u64,
        space_id: SpaceId,
        ack: frame::Ack,
    ) -> Result<(), TransportError> {
        trace!(self.log, "got ack"; "space" => ?space_id, "largest" => ack.largest);
        let was_largest = self.space(space_id).largest_acked;
        let newly_largest = was_largest.map_or(true, |l| ack.largest > l);

        if let Some(ecn) = ack.ecn {
            if ecn.ce > self.space(space_id).peer_ce_count {
                self.space_mut(space_id).peer_ce_count = ecn.ce;
                if let Some(meta) = self.space(space_id).find_sent(ack.largest) {
                    let sent_time = meta.time_sent;
                    self.cc.on_congestion_event(now, sent_time, false);
                } else {
                    self.cc.on_congestion_event(now, now, false);
                }
            }
        }

        let mut newly_acked = Vec::new();
        for range in ack.iter() {
            for pn in range {
                if let Some(meta) = self.space(space_id).find_sent(pn).cloned() {
                    newly_acked.push((pn, meta));
                } else if !self.space(space_id).acked_or_lost.contains(pn) {
                    // Not currently in flight and never acked/lost
                    // before either: the peer is acknowledging a
                    // packet number we never sent (spec.md §4.4 "ACK
                    // for never-sent").
                    warn!(self.log, "peer acked a packet we never sent"; "pn" => pn, "space" => ?space_id);
                    return Err(TransportError::PROTOCOL_VIOLATION);
                }
            }
        }
        if newly_acked.is_empty() {
            return Ok(());
        }

        if newly_largest {
            if let Some((_, meta)) = newly_acked.iter().find(|(pn, _)| *pn == ack.largest) {
                let sample = now.saturating_sub(meta.time_sent);
                let ack_delay = ack.delay << self.remote_ack_delay_exponent();
                self.loss.on_rtt_sample(ack_delay, sample);
            }
            self.space_mut(space_id).largest_acked = Some(ack.largest);
        }

        for (pn, meta) in &newly_acked {
            self.loss.on_packet_acked_after_last_pto(meta.time_sent);
            if meta.ack_eliciting {
                self.cc.on_packet_acked(meta.time_sent, meta.size as u64);
            }
            for sm in &meta.stream_frames {
                if let Some(send) = self.streams.get_send_mut(sm.id) {
                    send.on_range_acked(*sm.offsets.start()..*sm.offsets.end() + 1);
                    if sm.fin {
                        send.on_fin_acked();
                        self.events.push_back(Event::StreamFinished { stream: sm.id });
                    }
                }
            }
            self.space_mut(space_id).sent.remove(pn);
            self.space_mut(space_id).acked_or_lost.insert_one(*pn);
        }

        let largest_acked = self.space(space_id).largest_acked.unwrap();
        let mut cc = self.cc.clone_box();
        let lost = {
            let space = self.space_mut(space_id);
            self.loss.detect_lost_packets(space, now, largest_acked, &mut *cc)
        };
        self.cc = cc;
        for sm in &lost.stream_frames {
            if let Some(send) = self.streams.get_send_mut(sm.id) {
                send.requeue_lost(*sm.offsets.start()..*sm.offsets.end() + 1, sm.fin);
            }
        }
        if lost.max_data {
            self.pending.max_data = true;
        }
        if lost.ping {
            self.pending.ping = true;
        }
        for (id, code, _) in &lost.rst_stream {
            self.pending.rst_stream.push((*id, *code));
        }

        self.set_loss_detection = Some(self.loss_detection_deadline());
        Ok(())
    }

    fn remote_ack_delay_exponent(&self) -> u8 {
        self.remote_params
            .as_ref()
            .map_or(crate::DEFAULT_ACK_DELAY_EXPONENT, |p| p.ack_delay_exponent)
    }

    fn loss_detection_deadline(&self) -> Option<u64> {
        if self.space(SpaceId::Application).sent.is_empty()
            && self.space(SpaceId::Initial).sent.is_empty()
            && self.space(SpaceId::Handshake).sent.is_empty()
        {
            return None;
        }
        Some(self.last_activity + self.loss.pto_duration())
    }

    /// Walk every space for newly-lost packets against the PTO timer
    /// firing (spec.md §4.6 "loss-detection timer").
    pub fn check_packet_loss(&mut self, now: u64) {
        if self.state.is_closed() {
            return;
        }
        debug!(self.log, "PTO fired"; "pto_count" => self.loss.pto_count);
        let crypto_only = self.tls.is_handshaking();
        self.loss.on_pto_fired(now, crypto_only);
        for &id in &[SpaceId::Initial, SpaceId::Handshake, SpaceId::Application] {
            if let Some(largest_acked) = self.space(id).largest_acked {
                let mut cc = self.cc.clone_box();
                let lost = {
                    let space = self.space_mut(id);
                    self.loss.detect_lost_packets(space, now, largest_acked, &mut *cc)
                };
                self.cc = cc;
                for sm in &lost.stream_frames {
                    if let Some(send) = self.streams.get_send_mut(sm.id) {
                        send.requeue_lost(*sm.offsets.start()..*sm.offsets.end() + 1, sm.fin);
                    }
                }
            }
        }
        self.pending.ping = true;
        self.set_loss_detection = Some(self.loss_detection_deadline());
    }

    fn reset_idle_timeout(&mut self, now: u64) {
        if self.idle_timeout_us == 0 {
            return;
        }
        self.last_activity = now;
        self.set_idle = Some(Some(now + self.idle_timeout_us));
    }

    fn arm_close_timer(&mut self, now: u64) {
        let pto = self.loss.pto_duration().max(crate::GRANULARITY);
        self.close_deadline = Some(now + 3 * pto);
        self.set_close = Some(Some(now + 3 * pto));
    }

    fn maybe_enter_draining(&mut self, now: u64) {
        if matches!(self.state, State::Closed(_) | State::HandshakeFailed(_)) {
            self.arm_close_timer(now);
        }
    }

    /// `Timer::Idle` firing (spec.md §7 "timeout"): a silent close,
    /// straight to `Draining` with no CONNECTION_CLOSE sent.
    pub fn on_idle_timeout(&mut self, now: u64) {
        if self.state.is_closed() {
            return;
        }
        debug!(self.log, "idle timeout, closing silently");
        self.error = Some(ConnectionError::TimedOut);
        self.state = State::Draining;
        self.close_reason_frame = None;
        self.close_frame_remaining = 0;
        self.arm_close_timer(now);
        self.events.push_back(Event::ConnectionLost {
            reason: ConnectionError::TimedOut,
        });
    }

    /// `Timer::Close` firing (spec.md §3 "closing, draining, closed"):
    /// the 3×PTO closing/draining window has elapsed.
    pub fn on_close_timeout(&mut self) {
        self.state = State::Drained;
    }

    // -- Stream API -----------------------------------------------------

    pub fn open(&mut self, dir: Directionality) -> Option<StreamId> {
        self.streams.open(dir)
    }

    pub fn write(&mut self, id: StreamId, data: &[u8]) -> Result<usize, WriteError> {
        let n = self.streams.write(id, Bytes::from(data.to_vec()), false)?;
        Ok(n)
    }

    pub fn finish(&mut self, id: StreamId) -> Result<(), WriteError> {
        self.streams.finish(id)
    }

    pub fn read(&mut self, id: StreamId, buf: &mut [u8]) -> Result<usize, ReadError> {
        let n = self.streams.read_stream(id, buf)?;
        if n == 0 {
            let recv = self
                .streams
                .get_recv_mut(id)
                .ok_or(ReadError::UnknownStream)?;
            if recv.is_closed() {
                return Err(ReadError::Finished);
            }
        }
        Ok(n)
    }

    pub fn read_unordered(&mut self, id: StreamId) -> Result<(Bytes, u64), ReadError> {
        let recv = self.streams.get_recv_mut(id).ok_or(ReadError::UnknownStream)?;
        recv.read_unordered().ok_or(ReadError::Finished).map(|(o, b)| (b, o))
    }

    /// Retire `id`'s stream state once both halves are done with it,
    /// called by the endpoint pump after a `read`/`read_unordered` call
    /// observes `Finished`/`Reset` (spec.md §4.5 "retire finished
    /// streams").
    pub fn maybe_cleanup_stream(&mut self, id: StreamId) {
        self.streams.maybe_cleanup(id);
    }

    pub fn reset(&mut self, id: StreamId, error_code: u64) {
        if let Some(send) = self.streams.get_send_mut(id) {
            send.reset(error_code);
        }
        self.pending.rst_stream.push((id, error_code));
    }

    pub fn stop_sending(&mut self, id: StreamId, error_code: u64) {
        self.pending.stop_sending.push((id, error_code));
    }

    pub fn ping(&mut self) {
        self.pending.ping = true;
    }

    /// `close()` (spec.md §3 Lifetime): the application gave up on the
    /// connection; arm the 3×PTO close timer and queue a
    /// CONNECTION_CLOSE frame for the next `next_packet`.
    pub fn close(&mut self, now: u64, error_code: u64, reason: Bytes) {
        if self.state.is_closed() {
            return;
        }
        debug!(self.log, "closing"; "error_code" => error_code);
        self.error = Some(ConnectionError::ApplicationClosed { error_code });
        self.state = State::Closed(state::Closed {
            reason: state::CloseReason::Application(error_code),
        });
        self.close_reason_frame = Some(frame::Close {
            error_code,
            frame_type: None,
            reason,
        });
        self.close_frame_remaining = CLOSE_FRAME_RETRANSMITS;
        self.arm_close_timer(now);
    }

    /// Transition to `Closed`/`HandshakeFailed` because of a
    /// locally-detected protocol violation (spec.md §7 "err_close"):
    /// arm the close timer and queue a transport-layer
    /// CONNECTION_CLOSE naming the offending frame type, if any.
    fn close_for_error(&mut self, now: u64, error: TransportError) {
        if self.state.is_closed() {
            return;
        }
        warn!(self.log, "closing due to local error"; "reason" => %error);
        let reason = state::CloseReason::Connection(error.code());
        self.close_reason_frame = Some(frame::Close {
            error_code: error.code(),
            frame_type: Some(error.frame.unwrap_or(0)),
            reason: Bytes::new(),
        });
        self.close_frame_remaining = CLOSE_FRAME_RETRANSMITS;
        self.error = Some(error.into());
        self.state = if let State::Handshake = self.state {
            State::HandshakeFailed(reason)
        } else {
            State::Closed(state::Closed { reason })
        };
        self.arm_close_timer(now);
    }

    /// Whether `state` is one of the two "we initiated the close and
    /// still owe the peer a CONNECTION_CLOSE" states, as opposed to
    /// `Draining` (peer closed, or our close-frame retransmission
    /// budget is spent) where the connection goes silent.
    fn owes_close_frame(&self) -> bool {
        matches!(self.state, State::Closed(_) | State::HandshakeFailed(_))
            && self.close_frame_remaining > 0
    }

    // -- Packet assembly --------------------------------------------------

    /// Build the next outgoing packet for `space_id`, or `None` if
    /// there's nothing to send and no ack is due (spec.md §5 "Control
    /// flow: ... Stream API / timers → Frame Codec encode"), then seal
    /// it with this epoch's AEAD and header-protection keys.
    pub fn next_packet(&mut self, now: u64) -> Option<Vec<u8>> {
        if self.owes_close_frame() {
            let built = self.build_close_packet(now)?;
            return self.seal_packet(built);
        }
        if self.state.is_closed() {
            // Draining, fully drained, or our close-frame budget is
            // spent: go silent rather than emit ordinary frames.
            return None;
        }
        for &id in &[SpaceId::Initial, SpaceId::Handshake, SpaceId::Application] {
            if self.keys[space_index(id)].is_none() {
                continue;
            }
            if let Some(built) = self.build_packet_for_space(id, now) {
                return self.seal_packet(built);
            }
        }
        None
    }

    /// Apply AEAD sealing and header protection to a just-assembled
    /// plaintext packet, the send-side mirror of
    /// [`Connection::handle_datagram_packet`]'s receive-side unprotect-
    /// and-decrypt: `build_packet_for_space`/`build_close_packet` only
    /// ever assemble plaintext frames; this is the one place on the
    /// send path that reaches into the crypto trait objects.
    fn seal_packet(&mut self, built: BuiltPacket) -> Option<Vec<u8>> {
        let BuiltPacket {
            id,
            pn,
            header_len,
            pn_offset,
            length_field_offset,
            buf,
        } = built;
        let keys = self.keys[space_index(id)].as_ref()?;
        trace!(self.log, "sending packet"; "pn" => pn, "space" => ?id, "len" => buf.len());
        let mut raw = buf.to_vec();
        keys.encrypt(pn, &mut raw, header_len);
        if let Some(offset) = length_field_offset {
            set_payload_length(&mut raw, offset);
        }
        keys.header_key().encrypt(pn_offset, &mut raw);
        Some(raw)
    }

    fn has_space_data(&self, id: SpaceId) -> bool {
        match id {
            SpaceId::Application => {
                self.space(id).should_send_ack_now(u64::max_value())
                    || self.space(id).has_ack_pending() && self.space(id).imm_ack
                    || !self.pending.is_empty()
                    || self.streams.needs_transmit().next().is_some()
            }
            _ => self.space(id).imm_ack || self.tls.is_handshaking(),
        }
    }

    /// Build and encode the long/short header for `id` at packet
    /// number `number`, returning the reserved length-field offset for
    /// long headers (shared by `build_packet_for_space` and
    /// `build_close_packet`).
    fn encode_header_for_space(&self, id: SpaceId, number: PacketNumber, buf: &mut BytesMut) -> Option<usize> {
        match id {
            SpaceId::Initial => Header::Initial {
                src_cid: self.loc_cid,
                dst_cid: self.rem_cid,
                token: Vec::new(),
                number,
            }.encode(buf),
            SpaceId::Handshake => Header::Long {
                ty: LongType::Handshake,
                src_cid: self.loc_cid,
                dst_cid: self.rem_cid,
                number,
            }.encode(buf),
            SpaceId::Application => Header::Short {
                dst_cid: self.rem_cid,
                number,
                key_phase: false,
            }.encode(buf),
        }
    }

    /// The packet-number space a closing connection should keep
    /// sending its CONNECTION_CLOSE in: whichever space the handshake
    /// has reached, per RFC 9000 §10.2.1 ("SHOULD use the same
    /// packet number space as the failing packet").
    fn closing_space(&self) -> SpaceId {
        if !self.tls.is_handshaking() {
            SpaceId::Application
        } else if self.keys[space_index(SpaceId::Handshake)].is_some() {
            SpaceId::Handshake
        } else {
            SpaceId::Initial
        }
    }

    /// Build the bounded CONNECTION_CLOSE retransmission packet for a
    /// connection in `Closed`/`HandshakeFailed` (spec.md §4.4: "up to
    /// 3·PTO times"); all other frame emission stops once closing.
    fn build_close_packet(&mut self, now: u64) -> Option<BuiltPacket> {
        let frame = self.close_reason_frame.clone()?;
        let id = self.closing_space();
        let mut buf = BytesMut::with_capacity(MIN_MTU as usize);
        let pn = self.space_mut(id).next_packet_number();
        let largest_acked = self.space(id).largest_acked.unwrap_or(0);
        let number = PacketNumber::new(pn, largest_acked);
        let length_field_offset = self.encode_header_for_space(id, number, &mut buf);
        let header_len = buf.len();
        let pn_offset = header_len - number.len();
        frame::encode_frame(&Frame::Close(frame), &mut buf);
        self.close_frame_remaining -= 1;
        Some(BuiltPacket {
            id,
            pn,
            header_len,
            pn_offset,
            length_field_offset,
            buf,
        })
    }

    fn build_packet_for_space(&mut self, id: SpaceId, now: u64) -> Option<BuiltPacket> {
        let ack_due = self.space(id).should_send_ack_now(now);
        let has_control = match id {
            SpaceId::Application => !self.pending.is_empty() || self.streams.needs_transmit().next().is_some(),
            _ => self.tls.is_handshaking(),
        };
        if !ack_due && !has_control {
            return None;
        }
        if self.cc.window() <= self.total_in_flight() && !ack_due {
            return None;
        }

        let mut buf = BytesMut::with_capacity(MIN_MTU as usize);
        let pn = self.space_mut(id).next_packet_number();
        let largest_acked = self.space(id).largest_acked.unwrap_or(0);
        let number = PacketNumber::new(pn, largest_acked);
        let length_field_offset = self.encode_header_for_space(id, number, &mut buf);
        let header_len = buf.len();
        let pn_offset = header_len - number.len();

        let mut meta = SentPacket {
            time_sent: now,
            size: 0,
            ack_eliciting: false,
            in_flight: false,
            frames: Default::default(),
            stream_frames: Vec::new(),
            rst_stream: Vec::new(),
            max_data: false,
            max_stream_data: Vec::new(),
            ping: false,
        };

        let ecn = {
            let space = self.space(id);
            if space.ect0_count > 0 || space.ect1_count > 0 || space.ce_count > 0 {
                Some(frame::EcnCounts {
                    ect0: space.ect0_count,
                    ect1: space.ect1_count,
                    ce: space.ce_count,
                })
            } else {
                None
            }
        };
        if let Some(ack) = frame::ack_from_recv(&self.space(id).recv, self.params.ack_delay_exponent, now, ecn) {
            frame::encode_frame(&Frame::Ack(ack), &mut buf);
            self.space_mut(id).on_ack_sent();
        }

        if id != SpaceId::Application {
            if let Some(epoch) = self.drain_handshake_bytes(&mut buf) {
                meta.ack_eliciting = true;
                meta.in_flight = true;
                let _ = epoch;
            }
        } else {
            self.fill_application_frames(&mut buf, &mut meta);
        }

        if meta.size_budget_is_empty(&buf, length_field_offset) {
            return None;
        }

        if let Some(offset) = length_field_offset {
            let min_len = if id == SpaceId::Initial && self.side.is_client() {
                crate::MIN_INITIAL_SIZE
            } else {
                0
            };
            while buf.len() < min_len {
                buf.put_u8(0);
            }
            let _ = offset;
        }

        let tag_len = self.keys[space_index(id)].as_ref().map_or(0, |k| k.tag_len());
        meta.size = buf.len() as u16 + tag_len as u16;
        meta.frames.insert(frame::FrameType::Ping);
        self.space_mut(id).on_sent(now, pn, meta);
        self.set_loss_detection = Some(self.loss_detection_deadline());
        self.reset_idle_timeout(now);
        Some(BuiltPacket {
            id,
            pn,
            header_len,
            pn_offset,
            length_field_offset,
            buf,
        })
    }

    fn total_in_flight(&self) -> u64 {
        crate::recovery::total_in_flight(&[
            self.space(SpaceId::Initial),
            self.space(SpaceId::Handshake),
            self.space(SpaceId::Application),
        ])
    }

    /// Pull the next chunk of TLS handshake bytes and wrap it in a
    /// CRYPTO frame, mirroring the teacher's `write_tls` feeding
    /// `handshake_pending.crypto`.
    fn drain_handshake_bytes(&mut self, buf: &mut BytesMut) -> Option<Epoch> {
        let mut hs = BytesMut::new();
        let epoch = self.tls.write_handshake(&mut hs)?;
        if hs.is_empty() {
            return None;
        }
        frame::encode_frame(
            &Frame::Crypto {
                offset: 0,
                data: hs.freeze(),
            },
            buf,
        );
        Some(epoch)
    }

    fn fill_application_frames(&mut self, buf: &mut BytesMut, meta: &mut SentPacket) {
        if self.pending.ping {
            frame::encode_frame(&Frame::Ping, buf);
            meta.ping = true;
            meta.ack_eliciting = true;
            meta.in_flight = true;
            self.pending.ping = false;
        }
        if self.pending.max_data {
            frame::encode_frame(&Frame::MaxData(self.streams.local_max_data), buf);
            meta.max_data = true;
            meta.ack_eliciting = true;
            meta.in_flight = true;
            self.pending.max_data = false;
        }
        if self.pending.max_streams_bidi {
            frame::encode_frame(
                &Frame::MaxStreams {
                    dir: Directionality::Bi,
                    count: self.streams.max_remote(Directionality::Bi),
                },
                buf,
            );
            meta.ack_eliciting = true;
            meta.in_flight = true;
            self.pending.max_streams_bidi = false;
        }
        if self.pending.max_streams_uni {
            frame::encode_frame(
                &Frame::MaxStreams {
                    dir: Directionality::Uni,
                    count: self.streams.max_remote(Directionality::Uni),
                },
                buf,
            );
            meta.ack_eliciting = true;
            meta.in_flight = true;
            self.pending.max_streams_uni = false;
        }
        if let Some(token) = self.pending.path_response.take() {
            frame::encode_frame(&Frame::PathResponse(token), buf);
            meta.ack_eliciting = true;
            meta.in_flight = true;
        }
        while let Some((id, code)) = self.pending.rst_stream.pop() {
            frame::encode_frame(
                &Frame::ResetStream {
                    id,
                    error_code: code,
                    final_offset: 0,
                },
                buf,
            );
            meta.rst_stream.push((id, 0, code));
            meta.ack_eliciting = true;
            meta.in_flight = true;
        }
        while let Some((id, code)) = self.pending.stop_sending.pop() {
            frame::encode_frame(&Frame::StopSending { id, error_code: code }, buf);
            meta.ack_eliciting = true;
            meta.in_flight = true;
        }

        let ids: Vec<StreamId> = self.streams.needs_transmit().cloned().collect();
        for id in ids {
            if let Some(limit) = self.streams.do_stream_fc(id) {
                frame::encode_frame(&Frame::MaxStreamData { id, offset: limit }, buf);
                meta.ack_eliciting = true;
                meta.in_flight = true;
            }
            let budget = (MIN_MTU as usize).saturating_sub(buf.len() + 32);
            if let Some(send) = self.streams.get_send_mut(id) {
                if let Some((offset, data, fin)) = send.poll_transmit(budget) {
                    let len = data.len() as u64;
                    frame::encode_frame(
                        &Frame::Stream(frame::Stream { id, offset, fin, data }),
                        buf,
                    );
                    meta.stream_frames.push(frame::StreamMeta {
                        id,
                        offsets: offset..=(offset + len.saturating_sub(1)),
                        fin,
                    });
                    meta.ack_eliciting = true;
                    meta.in_flight = true;
                }
            }
            if self
                .streams
                .get_send_mut(id)
                .map_or(true, |s| !s.has_pending())
            {
                self.streams.clear_needs_transmit(id);
            }
            self.streams.maybe_cleanup(id);
        }

        if let Some(limit) = self.streams.do_conn_fc() {
            frame::encode_frame(&Frame::MaxData(limit), buf);
            meta.max_data = true;
            meta.ack_eliciting = true;
            meta.in_flight = true;
        }
    }
}

impl SentPacket {
    fn size_budget_is_empty(&self, buf: &BytesMut, length_field_offset: Option<usize>) -> bool {
        !self.ack_eliciting && length_field_offset.map_or(buf.is_empty(), |o| buf.len() <= o + 4)
    }
}

impl TransportError {
    #[allow(non_snake_case)]
    fn TLS_HANDSHAKE_FAILED_SHORTHAND() -> TransportError {
        TransportError::crypto(40) // handshake_failure
    }
}
