//! RTT estimation, PTO timer and loss detection (spec.md §4.6).
//!
//! The teacher's `Connection` inlines this as `update_rtt`,
//! `check_packet_loss` (TLP/RTO/`handshake_count`-based) and
//! `detect_lost_packets`/`set_loss_detection_alarm`. This module keeps
//! that structural shape — one `RttEstimator` plus a per-connection
//! loss-detection driver walking the three `PnSpace`s — but replaces
//! the teacher's TLP/RTO formulas with RFC 9002's PTO timer, since the
//! teacher predates that RFC.

use crate::congestion::Controller;
use crate::frame::{CryptoMeta, StreamMeta};
use crate::pnspace::{PnSpace, SentPacket, SpaceId, SPACES};
use crate::{
    GRANULARITY, INITIAL_RTT, MAX_ACK_DELAY, PACKET_THRESHOLD, PERSISTENT_CONGESTION_THRESHOLD,
    TIME_THRESHOLD_DEN, TIME_THRESHOLD_NUM,
};

/// RFC 9002 §5 RTT estimator: `srtt`/`rttvar`/`min_rtt`, all in
/// microseconds.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    latest_rtt: u64,
    smoothed_rtt: u64,
    rttvar: u64,
    min_rtt: u64,
    first_sample_taken: bool,
}

impl RttEstimator {
    pub fn new() -> Self {
        RttEstimator {
            latest_rtt: 0,
            smoothed_rtt: INITIAL_RTT,
            rttvar: INITIAL_RTT / 2,
            min_rtt: u64::max_value(),
            first_sample_taken: false,
        }
    }

    pub fn smoothed(&self) -> u64 {
        self.smoothed_rtt
    }

    pub fn var(&self) -> u64 {
        self.rttvar
    }

    pub fn min(&self) -> u64 {
        self.min_rtt
    }

    pub fn latest(&self) -> u64 {
        self.latest_rtt
    }

    /// `update(sample, ack_delay)` (spec.md §4.6 RTT estimation), where
    /// `ack_delay` has already been clamped to `max_ack_delay` by the
    /// caller.
    pub fn update(&mut self, ack_delay: u64, sample: u64) {
        self.latest_rtt = sample;
        if !self.first_sample_taken {
            self.first_sample_taken = true;
            self.min_rtt = sample;
            self.smoothed_rtt = sample;
            self.rttvar = sample / 2;
            return;
        }
        self.min_rtt = self.min_rtt.min(sample);
        let ack_delay = ack_delay.min(MAX_ACK_DELAY);
        let adjusted = if sample.saturating_sub(ack_delay) >= self.min_rtt {
            sample - ack_delay
        } else {
            sample
        };
        let diff = if self.smoothed_rtt > adjusted {
            self.smoothed_rtt - adjusted
        } else {
            adjusted - self.smoothed_rtt
        };
        self.rttvar = (3 * self.rttvar + diff) / 4;
        self.smoothed_rtt = (7 * self.smoothed_rtt + adjusted) / 8;
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes/frames that fell out of the in-flight map because they were
/// declared lost, returned by [`LossDetection::detect_lost_packets`]
/// for the caller to re-enqueue.
#[derive(Debug, Default)]
pub struct LostPackets {
    pub packet_numbers: Vec<u64>,
    pub lost_bytes: u64,
    pub stream_frames: Vec<StreamMeta>,
    pub crypto_frames: Vec<CryptoMeta>,
    pub rst_stream: Vec<(crate::StreamId, u16, u64)>,
    pub max_data: bool,
    pub ping: bool,
}

/// Per-connection loss-recovery state, one instance shared by the
/// three `PnSpace`s it drives (spec.md §4.6).
pub struct LossDetection {
    pub rtt: RttEstimator,
    pub pto_count: u32,
    pub crypto_count: u32,
    /// Time the most recent PTO fired, used for the "ack for a packet
    /// sent after the last PTO without intervening loss" spurious
    /// rollback rule.
    last_pto_fired_at: Option<u64>,
    pub max_ack_delay: u64,
}

impl LossDetection {
    pub fn new() -> Self {
        LossDetection {
            rtt: RttEstimator::new(),
            pto_count: 0,
            crypto_count: 0,
            last_pto_fired_at: None,
            max_ack_delay: MAX_ACK_DELAY,
        }
    }

    /// `PTO = srtt + max(4*rttvar, kGranularity) + max_ack_delay`,
    /// doubled per `pto_count` (spec.md §4.6).
    pub fn pto_base(&self) -> u64 {
        self.rtt.smoothed() + std::cmp::max(4 * self.rtt.var(), GRANULARITY) + self.max_ack_delay
    }

    pub fn pto_duration(&self) -> u64 {
        self.pto_base() * (1u64 << self.pto_count.min(62))
    }

    /// Record an RTT sample from `on_ack_received_1` (spec.md §4.4 ACK
    /// frame decode).
    pub fn on_rtt_sample(&mut self, ack_delay: u64, sample: u64) {
        self.rtt.update(ack_delay, sample);
    }

    /// The spurious-PTO rollback rule: any ack for a packet sent after
    /// the last PTO fired, without an intervening loss, zeroes both
    /// counters.
    pub fn on_packet_acked_after_last_pto(&mut self, sent_time: u64) {
        if self
            .last_pto_fired_at
            .map_or(false, |t| sent_time > t)
        {
            self.pto_count = 0;
            self.crypto_count = 0;
            self.last_pto_fired_at = None;
        }
    }

    pub fn on_pto_fired(&mut self, now: u64, crypto_only: bool) {
        self.last_pto_fired_at = Some(now);
        if crypto_only {
            self.crypto_count += 1;
        } else {
            self.pto_count += 1;
        }
    }

    /// `detect_lost_packets(space, now, largest_acked)` (spec.md §4.6
    /// Loss detection): walk every not-yet-acked packet below
    /// `largest_acked` and declare it lost under the time- or
    /// packet-threshold rule, driving `cc` with a congestion event per
    /// loss.
    pub fn detect_lost_packets(
        &mut self,
        space: &mut PnSpace,
        now: u64,
        largest_acked: u64,
        cc: &mut dyn Controller,
    ) -> LostPackets {
        let loss_delay = TIME_THRESHOLD_NUM
            * std::cmp::max(self.rtt.smoothed(), self.rtt.latest())
            / TIME_THRESHOLD_DEN;
        let mut lost = LostPackets::default();
        let mut to_remove = Vec::new();
        let mut any_lost = false;

        for (&pn, meta) in space.sent.range(..largest_acked) {
            if pn == largest_acked {
                continue;
            }
            let time_lost = now.saturating_sub(meta.time_sent) > loss_delay;
            let pn_lost = largest_acked - pn >= PACKET_THRESHOLD;
            if !time_lost && !pn_lost {
                continue;
            }
            any_lost = true;
            to_remove.push(pn);
            if meta.ack_eliciting {
                lost.lost_bytes += meta.size as u64;
            }
            lost.stream_frames.extend(meta.stream_frames.clone());
            lost.rst_stream.extend(meta.rst_stream.clone());
            lost.max_data |= meta.max_data;
            lost.ping |= meta.ping;
            cc.on_congestion_event(now, meta.time_sent, false);
        }

        // `to_remove` is collected in ascending packet-number order
        // (it walks `space.sent`, a `BTreeMap`), which is exactly the
        // order persistent-congestion detection needs below.
        let newly_lost_times: Vec<(u64, u64)> = to_remove
            .iter()
            .map(|&pn| (pn, space.sent[&pn].time_sent))
            .collect();

        for pn in to_remove {
            space.sent.remove(&pn);
            space.acked_or_lost.insert_one(pn);
            lost.packet_numbers.push(pn);
        }

        if any_lost {
            self.maybe_persistent_congestion(space, now, &newly_lost_times, cc);
        }
        lost
    }

    /// RFC 9002 §7.6: persistent congestion is declared when two lost
    /// packets are at least `kPersistentCongestionThreshold` apart in
    /// packet-number space, their send times are separated by at least
    /// the PTO-derived persistent-congestion duration, and no packet
    /// sent in between is still outstanding (i.e. every packet in the
    /// interval was itself lost) (spec.md §9 open question, resolved
    /// to the RFC default).
    fn maybe_persistent_congestion(
        &self,
        space: &PnSpace,
        now: u64,
        newly_lost: &[(u64, u64)],
        cc: &mut dyn Controller,
    ) {
        if newly_lost.len() < 2 {
            return;
        }
        let first = newly_lost[0];
        let last = *newly_lost.last().unwrap();
        if last.0 - first.0 < u64::from(PERSISTENT_CONGESTION_THRESHOLD) {
            return;
        }
        let duration = self.pto_duration_for_persistent();
        if last.1.saturating_sub(first.1) < duration {
            return;
        }
        // Anything still outstanding strictly between the two
        // endpoints means not every packet in the interval was lost.
        if space.sent.range(first.0 + 1..last.0).next().is_some() {
            return;
        }
        cc.on_congestion_event(now, first.1, true);
    }

    fn pto_duration_for_persistent(&self) -> u64 {
        self.pto_base() * PERSISTENT_CONGESTION_THRESHOLD as u64
    }
}

impl Default for LossDetection {
    fn default() -> Self {
        Self::new()
    }
}

/// Which of the three spaces currently holds the earliest loss-
/// detection deadline, for arming a single connection-wide timer
/// (spec.md §4.6 PTO timer), mirroring the teacher's
/// `set_loss_detection_alarm` picking among `spaces`.
pub fn earliest_loss_time(deadlines: &[(SpaceId, Option<u64>)]) -> Option<(SpaceId, u64)> {
    deadlines
        .iter()
        .filter_map(|&(id, d)| d.map(|d| (id, d)))
        .min_by_key(|&(_, d)| d)
}

pub fn all_space_ids() -> &'static [SpaceId; 3] {
    &SPACES
}

/// Total in-flight bytes across every space, for the congestion-window
/// comparison the packet builder makes before sending.
pub fn total_in_flight(spaces: &[&PnSpace]) -> u64 {
    spaces.iter().map(|s| s.in_flight_bytes()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_sets_all_three_fields() {
        let mut rtt = RttEstimator::new();
        rtt.update(0, 100_000);
        assert_eq!(rtt.smoothed(), 100_000);
        assert_eq!(rtt.var(), 50_000);
        assert_eq!(rtt.min(), 100_000);
    }

    #[test]
    fn subsequent_sample_blends_with_ack_delay_clamped() {
        let mut rtt = RttEstimator::new();
        rtt.update(0, 100_000);
        rtt.update(10_000, 120_000);
        assert!(rtt.smoothed() > 100_000);
        assert_eq!(rtt.min(), 100_000);
    }

    #[test]
    fn pto_duration_doubles_with_pto_count() {
        let mut ld = LossDetection::new();
        ld.rtt.update(0, 100_000);
        let base = ld.pto_duration();
        ld.pto_count = 1;
        assert_eq!(ld.pto_duration(), base * 2);
        ld.pto_count = 2;
        assert_eq!(ld.pto_duration(), base * 4);
    }

    #[test]
    fn spurious_pto_rollback_zeroes_counters() {
        let mut ld = LossDetection::new();
        ld.on_pto_fired(1000, false);
        ld.pto_count = 2;
        ld.on_packet_acked_after_last_pto(1500);
        assert_eq!(ld.pto_count, 0);
        assert_eq!(ld.crypto_count, 0);
    }

    #[test]
    fn no_rollback_for_packets_sent_before_the_pto() {
        let mut ld = LossDetection::new();
        ld.on_pto_fired(1000, false);
        ld.pto_count = 2;
        ld.on_packet_acked_after_last_pto(500);
        assert_eq!(ld.pto_count, 2);
    }

    #[test]
    fn packet_threshold_declares_loss() {
        use crate::congestion::NewReno;
        use crate::pnspace::FrameSet;
        let mut ld = LossDetection::new();
        let mut space = PnSpace::new();
        let mut cc = NewReno::new();
        for pn in 0..5u64 {
            space.on_sent(
                0,
                pn,
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
        }
        let lost = ld.detect_lost_packets(&mut space, 0, 4, &mut cc);
        // pn 0 is 4 behind largest_acked=4 >= kPacketThreshold(3): lost.
        assert!(lost.packet_numbers.contains(&0));
        assert!(!space.sent.contains_key(&0));
    }

    fn sent_packet(time_sent: u64) -> SentPacket {
        use crate::pnspace::FrameSet;
        SentPacket {
            time_sent,
            size: 100,
            ack_eliciting: true,
            in_flight: true,
            frames: FrameSet::default(),
            stream_frames: Vec::new(),
            rst_stream: Vec::new(),
            max_data: false,
            max_stream_data: Vec::new(),
            ping: false,
        }
    }

    #[test]
    fn persistent_congestion_collapses_window_when_endpoints_qualify() {
        use crate::congestion::{Controller, NewReno, MINIMUM_WINDOW};
        let mut ld = LossDetection::new();
        ld.rtt.update(0, 10_000);
        // pto_base = 10_000 + max(4*5_000, 1_000) + 25_000 = 55_000;
        // persistent duration = 55_000 * 3 = 165_000.
        let space = PnSpace::new();
        let mut cc = NewReno::new();
        let newly_lost = vec![(0u64, 0u64), (3u64, 170_000u64)];
        ld.maybe_persistent_congestion(&space, 210_000, &newly_lost, &mut cc);
        assert_eq!(cc.window(), MINIMUM_WINDOW);
    }

    #[test]
    fn persistent_congestion_not_declared_below_packet_threshold() {
        use crate::congestion::{Controller, NewReno, INITIAL_WINDOW};
        let mut ld = LossDetection::new();
        ld.rtt.update(0, 10_000);
        let space = PnSpace::new();
        let mut cc = NewReno::new();
        // Only 2 apart in packet-number space, below kPacketThreshold(3).
        let newly_lost = vec![(0u64, 0u64), (2u64, 170_000u64)];
        ld.maybe_persistent_congestion(&space, 210_000, &newly_lost, &mut cc);
        assert_eq!(cc.window(), INITIAL_WINDOW);
    }

    #[test]
    fn persistent_congestion_not_declared_below_time_threshold() {
        use crate::congestion::{Controller, NewReno, INITIAL_WINDOW};
        let mut ld = LossDetection::new();
        ld.rtt.update(0, 10_000);
        let space = PnSpace::new();
        let mut cc = NewReno::new();
        // 3 apart in packet-number space, but sent only 1_000µs apart:
        // nowhere near the 165_000µs persistent-congestion duration.
        let newly_lost = vec![(0u64, 0u64), (3u64, 1_000u64)];
        ld.maybe_persistent_congestion(&space, 210_000, &newly_lost, &mut cc);
        assert_eq!(cc.window(), INITIAL_WINDOW);
    }

    #[test]
    fn persistent_congestion_not_declared_with_surviving_packet_between() {
        use crate::congestion::{Controller, NewReno, INITIAL_WINDOW};
        let mut ld = LossDetection::new();
        ld.rtt.update(0, 10_000);
        let mut space = PnSpace::new();
        let mut cc = NewReno::new();
        // pn 1 is still outstanding between the two lost endpoints, so
        // not every packet in the interval was lost.
        space.on_sent(0, 1, sent_packet(50_000));
        let newly_lost = vec![(0u64, 0u64), (3u64, 170_000u64)];
        ld.maybe_persistent_congestion(&space, 210_000, &newly_lost, &mut cc);
        assert_eq!(cc.window(), INITIAL_WINDOW);
    }

    #[test]
    fn single_isolated_loss_does_not_collapse_window() {
        // Regression test: an isolated single-packet loss must not
        // trigger persistent congestion (previously collapsed cwnd
        // whenever `space.sent` emptied out after removing the loss).
        use crate::congestion::{Controller, NewReno, INITIAL_WINDOW};
        use crate::pnspace::FrameSet;
        let mut ld = LossDetection::new();
        let mut space = PnSpace::new();
        let mut cc = NewReno::new();
        space.on_sent(
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
        // Only one packet ever sent; once it's declared lost,
        // `space.sent` is empty, which used to be (mis)treated as
        // persistent congestion.
        let lost = ld.detect_lost_packets(&mut space, 1_000_000, 100, &mut cc);
        assert_eq!(lost.packet_numbers, vec![0]);
        assert_eq!(cc.window(), INITIAL_WINDOW);
    }
}
