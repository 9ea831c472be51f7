//! Per-epoch packet-number space accounting (spec.md §4.3): each of the
//! three spaces (Initial, Handshake, Application) owns its own
//! monotone packet-number counter, in-flight map, received-number
//! DIET and ACK-scheduling state, independent of the others.
//!
//! Grounded on the teacher's `Connection` fields that this module
//! factors out one-per-epoch: `sent_packets: BTreeMap<u64, SentPacket>`,
//! `largest_acked_packet`, `pending_acks: RangeSet`, `rx_packet`/
//! `rx_packet_time`, `permit_ack_only`.

use std::collections::{BTreeMap, VecDeque};

use fnv::FnvHashSet;

use crate::diet::Diet;
use crate::frame::{FrameType, StreamMeta};
use crate::{EcnCodepoint, StreamId, MAX_ACK_DELAY};

/// A fixed-size bit vector keyed by frame-type code (spec.md §9
/// "bitset-over-enum frame tracking"), used to decide pacing-sensitive
/// questions like "did this packet carry only ACK/PADDING frames".
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct FrameSet(u64);

impl FrameSet {
    pub fn insert(&mut self, ty: FrameType) {
        self.0 |= 1 << (ty.bitset_index());
    }

    pub fn contains(&self, ty: FrameType) -> bool {
        self.0 & (1 << ty.bitset_index()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// Per-packet bookkeeping for a still-in-flight sent packet
/// (spec.md §3 "Packet Metadata").
#[derive(Debug, Clone)]
pub struct SentPacket {
    pub time_sent: u64,
    pub size: u16,
    pub ack_eliciting: bool,
    pub in_flight: bool,
    /// Frame types this packet carried, for ACK-policy decisions.
    pub frames: FrameSet,
    /// Stream/crypto byte ranges to re-enqueue if this packet is lost.
    pub stream_frames: Vec<StreamMeta>,
    /// Set if this packet carried a RESET_STREAM that needs resending
    /// on loss.
    pub rst_stream: Vec<(StreamId, u16, u64)>,
    /// Set if MAX_DATA needs resending on loss.
    pub max_data: bool,
    pub max_stream_data: Vec<StreamId>,
    pub ping: bool,
}

impl SentPacket {
    pub fn ack_only(&self) -> bool {
        !self.ack_eliciting
    }
}

/// Accounting for one packet-number space: Initial, Handshake or
/// Application (spec.md §4.3).
pub struct PnSpace {
    next_pn: u64,
    pub largest_acked: Option<u64>,
    pub sent: BTreeMap<u64, SentPacket>,
    /// Packet numbers received but not yet acknowledged, annotated
    /// with receive timestamps for ACK-delay computation.
    pub recv: Diet,
    /// Packet numbers the peer has acked, or we've declared lost;
    /// used to reject ACKs of never-sent/already-resolved numbers.
    pub acked_or_lost: Diet,
    pub largest_received: Option<u64>,
    pub time_of_last_sent_ack_eliciting: u64,
    /// Whether an ACK-eliciting packet has arrived since we last sent
    /// an ACK (spec.md §4.3 ACK-frequency policy).
    ack_eliciting_since_last_ack: u32,
    /// Set when a frame requiring an immediate ACK (FIN, HANDSHAKE_DONE,
    /// ...) was just received.
    pub imm_ack: bool,
    /// Deadline for the coalesced-ACK timer, if one is armed.
    pub ack_deadline: Option<u64>,
    pub rx_frames: FrameSet,
    pub tx_frames: FrameSet,
    /// Counts of ECT(0)/ECT(1)/CE-marked datagrams *we* have received in
    /// this space, reported back to the peer in our next ACK_ECN
    /// (spec.md §4.3 "ECN counters").
    pub ect0_count: u64,
    pub ect1_count: u64,
    pub ce_count: u64,
    /// The peer's last-reported CE count from an ACK_ECN frame *they*
    /// sent us, so a further increase can be recognized as a fresh
    /// congestion event (spec.md §4.4 "if CE > previous-seen").
    pub peer_ce_count: u64,
    /// Streams/crypto ranges queued for retransmission after a loss
    /// was declared in this space but not yet re-sent.
    pub lost_stream_frames: VecDeque<StreamMeta>,
    pub lost_rst_stream: Vec<(StreamId, u16, u64)>,
    pub lost_max_data: bool,
    pub lost_max_stream_data: FnvHashSet<StreamId>,
    pub lost_ping: bool,
}

impl PnSpace {
    pub fn new() -> Self {
        PnSpace {
            next_pn: 0,
            largest_acked: None,
            sent: BTreeMap::new(),
            recv: Diet::new(),
            acked_or_lost: Diet::new(),
            largest_received: None,
            time_of_last_sent_ack_eliciting: 0,
            ack_eliciting_since_last_ack: 0,
            imm_ack: false,
            ack_deadline: None,
            rx_frames: FrameSet::default(),
            tx_frames: FrameSet::default(),
            ect0_count: 0,
            ect1_count: 0,
            ce_count: 0,
            peer_ce_count: 0,
            lost_stream_frames: VecDeque::new(),
            lost_rst_stream: Vec::new(),
            lost_max_data: false,
            lost_max_stream_data: FnvHashSet::default(),
            lost_ping: false,
        }
    }

    /// `next_packet_number()` (spec.md §4.3): per-space monotone
    /// counter.
    pub fn next_packet_number(&mut self) -> u64 {
        let pn = self.next_pn;
        self.next_pn += 1;
        pn
    }

    pub fn peek_next_packet_number(&self) -> u64 {
        self.next_pn
    }

    /// `on_sent(pn, meta)`.
    pub fn on_sent(&mut self, now: u64, pn: u64, meta: SentPacket) {
        if meta.ack_eliciting {
            self.time_of_last_sent_ack_eliciting = now;
        }
        self.tx_frames = FrameSet(self.tx_frames.0 | meta.frames.0);
        self.sent.insert(pn, meta);
    }

    pub fn find_sent(&self, pn: u64) -> Option<&SentPacket> {
        self.sent.get(&pn)
    }

    pub fn in_flight_bytes(&self) -> u64 {
        self.sent
            .values()
            .filter(|p| p.ack_eliciting)
            .map(|p| p.size as u64)
            .sum()
    }

    /// `on_received(pn)`: record a received packet number and apply
    /// the ACK-frequency policy (spec.md §4.3).
    pub fn on_received(
        &mut self,
        now: u64,
        pn: u64,
        ack_eliciting: bool,
        imm_ack: bool,
        ecn: Option<EcnCodepoint>,
    ) {
        self.recv.insert(pn, now);
        if self.largest_received.map_or(true, |l| pn > l) {
            self.largest_received = Some(pn);
        }
        match ecn {
            Some(EcnCodepoint::Ect0) => self.ect0_count += 1,
            Some(EcnCodepoint::Ect1) => self.ect1_count += 1,
            Some(EcnCodepoint::Ce) => self.ce_count += 1,
            None => {}
        }
        if !ack_eliciting {
            return;
        }
        self.rx_frames.insert(FrameType::Ack); // mark "has rx activity"; refined by caller per-frame
        let creates_gap = self
            .largest_received
            .map_or(false, |l| pn < l && !self.recv.contains(pn + 1));
        self.ack_eliciting_since_last_ack += 1;
        if imm_ack {
            self.imm_ack = true;
        }
        if imm_ack || creates_gap || self.ack_eliciting_since_last_ack % 2 == 0 {
            self.ack_deadline = Some(now);
        } else if self.ack_deadline.is_none() {
            self.ack_deadline = Some(now + MAX_ACK_DELAY);
        }
    }

    /// Clear the ACK alarm and pending-ack bookkeeping once an ACK
    /// frame has been sent for this space (spec.md §4.4 ACK encode).
    pub fn on_ack_sent(&mut self) {
        self.ack_deadline = None;
        self.ack_eliciting_since_last_ack = 0;
        self.imm_ack = false;
        self.rx_frames = FrameSet::default();
    }

    pub fn has_ack_pending(&self) -> bool {
        !self.recv.is_empty()
    }

    pub fn should_send_ack_now(&self, now: u64) -> bool {
        self.imm_ack || self.ack_deadline.map_or(false, |d| now >= d)
    }
}

impl Default for PnSpace {
    fn default() -> Self {
        Self::new()
    }
}

/// Identifies which of the three packet-number spaces a piece of
/// per-space state belongs to (spec.md §4.3/glossary "PN space").
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SpaceId {
    Initial,
    Handshake,
    Application,
}

pub const SPACES: [SpaceId; 3] = [SpaceId::Initial, SpaceId::Handshake, SpaceId::Application];

/// Identify which packet-number space the leading packet of a
/// still-header-protected datagram belongs to, from the bits RFC 9001
/// §5.4 leaves unprotected: the long/short header bit and, for long
/// headers, the packet-type bits (only the low 4 bits — reserved bits
/// and packet-number length — are protected). Returns `None` for
/// 0-RTT and Retry packets, which this crate does not decode (0-RTT
/// would need a fourth key slot alongside the three PN spaces; Retry
/// carries no packet number at all).
pub fn peek_space_id(data: &[u8]) -> Option<SpaceId> {
    let first = *data.first()?;
    if first & 0x80 == 0 {
        return Some(SpaceId::Application);
    }
    match (first >> 4) & 0b11 {
        0b00 => Some(SpaceId::Initial),
        0b10 => Some(SpaceId::Handshake),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_packet_number_is_monotone() {
        let mut s = PnSpace::new();
        assert_eq!(s.next_packet_number(), 0);
        assert_eq!(s.next_packet_number(), 1);
        assert_eq!(s.next_packet_number(), 2);
    }

    #[test]
    fn in_flight_bytes_counts_only_ack_eliciting() {
        let mut s = PnSpace::new();
        s.on_sent(
            0,
            0,
            SentPacket {
                time_sent: 0,
                size: 100,
                ack_eliciting: true,
                in_flight: true,
                frames: FrameSet::default(),
                stream_frames: Vec::new(),
                rst_stream: Vec::new(),
                max_data: false,
                max_stream_data: Vec::new(),
                ping: false,
            },
        );
        s.on_sent(
            0,
            1,
            SentPacket {
                time_sent: 0,
                size: 50,
                ack_eliciting: false,
                in_flight: false,
                frames: FrameSet::default(),
                stream_frames: Vec::new(),
                rst_stream: Vec::new(),
                max_data: false,
                max_stream_data: Vec::new(),
                ping: false,
            },
        );
        assert_eq!(s.in_flight_bytes(), 100);
    }

    #[test]
    fn immediate_ack_flag_arms_the_alarm_right_away() {
        let mut s = PnSpace::new();
        s.on_received(1000, 5, true, true, None);
        assert!(s.should_send_ack_now(1000));
    }

    #[test]
    fn coalesced_ack_waits_for_the_delay_timer() {
        let mut s = PnSpace::new();
        s.on_received(1000, 1, true, false, None);
        // single ack-eliciting packet, no gap: not immediate.
        assert!(!s.should_send_ack_now(1000));
        assert!(s.should_send_ack_now(1000 + MAX_ACK_DELAY));
    }

    #[test]
    fn peek_space_id_reads_the_unprotected_type_bits() {
        assert_eq!(peek_space_id(&[0x40]), Some(SpaceId::Application));
        assert_eq!(peek_space_id(&[0xc0]), Some(SpaceId::Initial));
        assert_eq!(peek_space_id(&[0xe0]), Some(SpaceId::Handshake));
        assert_eq!(peek_space_id(&[0xd0]), None); // 0-RTT
        assert_eq!(peek_space_id(&[]), None);
    }
}
