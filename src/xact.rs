//! The thin slice of the surrounding transaction manager the prepare
//! pipeline actually reads: which XID is being prepared, and XID
//! allocation. Snapshot/visibility tracking is out of scope — callers
//! supply their own `CurrentXactFacts` implementation.

use crate::xid::{is_invalid_xid, xid_inc};
use crate::XID;

use std::sync::Mutex;

/// Allocates monotonically increasing XIDs and tracks the low-water mark
/// recovery's prescan must advance past (subtransaction XIDs that never
/// got direct WAL evidence of their own).
pub struct XidAllocator {
    next_xid: Mutex<XID>,
}

impl XidAllocator {
    pub fn new(starting_at: XID) -> Self {
        let starting_at = if is_invalid_xid(starting_at) {
            xid_inc(starting_at)
        } else {
            starting_at
        };
        Self {
            next_xid: Mutex::new(starting_at),
        }
    }

    pub fn next(&self) -> XID {
        let mut guard = self.next_xid.lock().unwrap();
        let xid = *guard;
        *guard = xid_inc(xid);
        xid
    }

    pub fn read_next(&self) -> XID {
        *self.next_xid.lock().unwrap()
    }

    pub fn set_next(&self, xid: XID) {
        *self.next_xid.lock().unwrap() = xid;
    }

    /// Advances the counter so that `xid` is no longer eligible for
    /// reallocation, without regressing it if it is already ahead.
    pub fn advance_past(&self, xid: XID) {
        let mut guard = self.next_xid.lock().unwrap();
        if xid >= *guard {
            *guard = xid_inc(xid);
        }
    }
}

/// The local transaction facts the prepare pipeline needs: which XID is
/// being prepared, and which subtransaction XIDs belong to it. A
/// production transaction manager would derive this from its own
/// nested-transaction bookkeeping; this crate's core only needs to read
/// it, not produce it.
pub trait CurrentXactFacts {
    fn current_xid(&self) -> XID;
    fn subxids(&self) -> Vec<XID>;
}

/// A plain holder implementing `CurrentXactFacts`, used by call sites
/// (and tests) that already know their own XID and subtransaction list
/// rather than deriving it from a live transaction manager.
pub struct LocalXact {
    pub xid: XID,
    pub subxids: Vec<XID>,
}

impl LocalXact {
    pub fn new(xid: XID, subxids: Vec<XID>) -> Self {
        Self { xid, subxids }
    }
}

impl CurrentXactFacts for LocalXact {
    fn current_xid(&self) -> XID {
        self.xid
    }

    fn subxids(&self) -> Vec<XID> {
        self.subxids.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocator_skips_invalid_xid() {
        let alloc = XidAllocator::new(0);
        assert_eq!(alloc.next(), 1);
    }

    #[test]
    fn advance_past_never_regresses() {
        let alloc = XidAllocator::new(100);
        alloc.advance_past(50);
        assert_eq!(alloc.read_next(), 100);
        alloc.advance_past(200);
        assert_eq!(alloc.read_next(), 201);
    }
}
