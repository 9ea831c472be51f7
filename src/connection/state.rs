//! Closing/draining machinery (spec.md §3 "closing, draining, closed"
//! states; §4.4 CONNECTION_CLOSE handling; §7 error propagation),
//! generalized from the teacher's single `ConnectionError` variant set
//! in `connection.rs` into the dedicated reason/closed types the
//! connection state machine now needs to distinguish "we closed" from
//! "the peer closed" while still driving the same 3×PTO timer.

/// Why a connection entered `Closed`/`Draining`, mirroring the two
/// CONNECTION_CLOSE frame types (RFC 9000 §19.19): a transport-layer
/// close carries a `TransportError` code, an application-layer close
/// carries an opaque application error code.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CloseReason {
    /// Closed via a transport-layer CONNECTION_CLOSE (frame type
    /// 0x1c) or a locally-detected transport error.
    Connection(u64),
    /// Closed via an application-layer CONNECTION_CLOSE (frame type
    /// 0x1d) or `Connection::close`.
    Application(u64),
}

/// The terminal `Closed` state (spec.md §3): the reason the
/// connection stopped, retained so a CONNECTION_CLOSE can be
/// retransmitted for any packet received while draining (spec.md §4.4
/// "schedules a CONNECTION_CLOSE to be emitted up to 3·PTO times on
/// any subsequent packet received").
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Closed {
    pub reason: CloseReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_reason_distinguishes_layers() {
        let transport = CloseReason::Connection(0x0a);
        let application = CloseReason::Application(0x0a);
        assert_ne!(transport, application);
    }

    #[test]
    fn closed_carries_its_reason() {
        let closed = Closed {
            reason: CloseReason::Application(42),
        };
        assert_eq!(closed.reason, CloseReason::Application(42));
    }
}
