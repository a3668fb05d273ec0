//! In-memory subtransaction-to-parent map. Deliberately not durable:
//! recovery repopulates it from each prepared transaction's subxid list
//! on every restart.

use crate::XID;

use std::{collections::HashMap, sync::Mutex};

#[derive(Default)]
pub struct SubtransMap {
    parent_of: Mutex<HashMap<XID, XID>>,
}

impl SubtransMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_parent(&self, child: XID, parent: XID) {
        self.parent_of.lock().unwrap().insert(child, parent);
    }

    pub fn parent_of(&self, child: XID) -> Option<XID> {
        self.parent_of.lock().unwrap().get(&child).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_looks_up_parent() {
        let map = SubtransMap::new();
        map.set_parent(1001, 1000);
        assert_eq!(map.parent_of(1001), Some(1000));
        assert_eq!(map.parent_of(2), None);
    }
}
