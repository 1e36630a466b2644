//! Connection state machine and the atomic-ish snapshot of a `Source`'s
//! mutable fields, read lock-free from outside the Source's owning task.

use parking_lot::RwLock;

/// Per-Source state machine: `Disconnected → Connecting → Subscribed →
/// {Streaming ↔ Stalled} → Disconnected` (§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Streaming,
    Stalled,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        matches!(self, Self::Streaming | Self::Stalled | Self::Subscribed)
    }
}

/// The externally-readable half of a Source: advertised range, connection
/// state, and forwarding bit. Guarded by a `parking_lot::RwLock` rather
/// than a hand-rolled seqlock — critical sections here are a handful of
/// field writes with no `.await`, so a plain lock is cheap and simple.
#[derive(Debug, Clone, Copy)]
pub struct RangeSnapshot {
    pub lo: u32,
    pub hi: u32,
    pub state: ConnectionState,
    pub forwarding: bool,
}

impl Default for RangeSnapshot {
    fn default() -> Self {
        Self {
            lo: 0,
            hi: 0,
            state: ConnectionState::Disconnected,
            forwarding: false,
        }
    }
}

impl RangeSnapshot {
    pub fn connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn has_ledger(&self, seq: u32) -> bool {
        self.connected() && self.lo <= seq && seq <= self.hi
    }
}

/// Shared, lock-guarded snapshot cell. `Source` mutates it on its own task;
/// `LoadBalancer` and tests read a cloned copy without blocking the Source.
#[derive(Debug, Default)]
pub struct SnapshotCell(RwLock<RangeSnapshot>);

impl SnapshotCell {
    pub fn read(&self) -> RangeSnapshot {
        *self.0.read()
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.0.write().state = state;
    }

    /// Extend `hi` to at least `new_hi`, enforcing the "never non-monotone
    /// backwards except on reconnect" invariant (§3). Reconnects call
    /// `reset_range` instead, which is allowed to move backwards.
    pub fn advance_hi(&self, new_hi: u32) {
        let mut guard = self.0.write();
        if new_hi > guard.hi {
            guard.hi = new_hi;
        }
    }

    pub fn reset_range(&self, lo: u32, hi: u32) {
        let mut guard = self.0.write();
        guard.lo = lo;
        guard.hi = hi;
    }

    pub fn set_forwarding(&self, forwarding: bool) {
        self.0.write().forwarding = forwarding;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_ledger_requires_connected_and_in_range() {
        let mut snap = RangeSnapshot {
            lo: 10,
            hi: 20,
            state: ConnectionState::Disconnected,
            forwarding: false,
        };
        assert!(!snap.has_ledger(15), "disconnected source has no ledger");
        snap.state = ConnectionState::Streaming;
        assert!(snap.has_ledger(15));
        assert!(!snap.has_ledger(25));
    }

    #[test]
    fn advance_hi_never_moves_backwards() {
        let cell = SnapshotCell::default();
        cell.reset_range(1, 100);
        cell.advance_hi(50);
        assert_eq!(cell.read().hi, 100);
        cell.advance_hi(150);
        assert_eq!(cell.read().hi, 150);
    }
}
