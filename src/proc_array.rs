//! In-memory list of surrogate descriptors observed by visibility checks.
//! Keyed by XID; the GXACT registry independently remembers which slot
//! index is currently published, rather than either side reinterpreting
//! a pointer between a slot and its embedded dummy proc.

use crate::XID;

use std::{collections::HashMap, sync::Mutex};

pub struct ProcArray {
    active: Mutex<HashMap<XID, usize>>,
}

impl Default for ProcArray {
    fn default() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
        }
    }
}

impl ProcArray {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `xid` as in-progress, associated with `slot` (the GXACT
    /// slot index, for surrogate entries; an opaque session id for
    /// ordinary backends).
    pub fn add(&self, xid: XID, slot: usize) {
        let mut guard = self.active.lock().unwrap();
        guard.insert(xid, slot);
    }

    pub fn remove(&self, xid: XID) {
        let mut guard = self.active.lock().unwrap();
        guard.remove(&xid);
    }

    pub fn is_active(&self, xid: XID) -> bool {
        let guard = self.active.lock().unwrap();
        guard.contains_key(&xid)
    }

    pub fn active_xids(&self) -> Vec<XID> {
        let guard = self.active.lock().unwrap();
        guard.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_is_active() {
        let procs = ProcArray::new();
        assert!(!procs.is_active(42));
        procs.add(42, 0);
        assert!(procs.is_active(42));
        procs.remove(42);
        assert!(!procs.is_active(42));
    }
}
