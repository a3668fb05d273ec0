//! The GXACT registry: a fixed-capacity, process-wide table of global
//! transactions that are prepared or attempting to become prepared.
//!
//! A `GlobalTransaction` owns its surrogate descriptor fields directly
//! (`ProcDescriptor`) and the registry tracks slot identity by index,
//! rather than reinterpreting a pointer between "slot" and "descriptor".

use crate::{proc_array::ProcArray, Error, Gid, Result, OID, XID};

use std::sync::Mutex;

/// Maximum number of subtransaction XIDs cached directly in a GXACT's
/// surrogate descriptor before the cache is considered to have
/// overflowed.
pub const MAX_CACHED_SUBXIDS: usize = 64;

/// The surrogate process descriptor embedded in a GXACT: the fields a
/// visibility check or lock manager would otherwise expect from a live
/// backend's process entry.
#[derive(Clone, Default)]
pub struct ProcDescriptor {
    pub xid: XID,
    pub database: OID,
    pub subxids: Vec<XID>,
    pub overflowed: bool,
}

impl ProcDescriptor {
    fn reset(&mut self) {
        self.xid = 0;
        self.database = 0;
        self.subxids.clear();
        self.overflowed = false;
    }
}

/// One slot in the GXACT table. Lifecycle: free -> reserved (valid=false)
/// -> committed to WAL/file (valid=true) -> locked for finish
/// (valid=true, locking_xid=finisher) -> removed.
pub struct GlobalTransaction {
    pub proc: ProcDescriptor,
    pub owner: OID,
    pub locking_xid: XID,
    pub valid: bool,
    pub gid: Gid,
    /// Index of this slot within the registry's slot pool. Used instead
    /// of pointer punning to convert between "slot" and "surrogate
    /// descriptor".
    pub slot: usize,
}

impl GlobalTransaction {
    pub fn xid(&self) -> XID {
        self.proc.xid
    }
}

enum SlotState {
    Free,
    Occupied(GlobalTransaction),
}

struct Inner {
    slots: Vec<SlotState>,
    free_list: Vec<usize>,
    active_list: Vec<usize>,
}

/// Checks whether a caller's XID is still active, abstracting over
/// whatever tracks live backends so a zombie sweep can tell a crashed
/// locker from a live one.
pub trait XidActivity {
    fn is_active(&self, xid: XID) -> bool;
}

impl XidActivity for ProcArray {
    fn is_active(&self, xid: XID) -> bool {
        ProcArray::is_active(self, xid)
    }
}

pub struct GxactRegistry {
    capacity: usize,
    inner: Mutex<Inner>,
    /// Single-entry cache for `lookup_proc_for`: finish and recovery call
    /// it repeatedly for the same XID, so a linear scan is only paid once
    /// per XID rather than once per call.
    lookup_cache: Mutex<Option<(XID, usize)>>,
}

impl GxactRegistry {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut free_list = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(SlotState::Free);
            free_list.push(capacity - 1 - i);
        }
        Self {
            capacity,
            inner: Mutex::new(Inner {
                slots,
                free_list,
                active_list: Vec::new(),
            }),
            lookup_cache: Mutex::new(None),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reserves a slot for a transaction about to PREPARE. Sweeps zombie
    /// entries (preparer crashed before `mark_as_prepared`) before
    /// checking for a GID collision, so a crashed preparer's GID can be
    /// recycled by this very call.
    pub fn mark_as_preparing(
        &self,
        activity: &dyn XidActivity,
        xid: XID,
        database: OID,
        gid: Gid,
        owner: OID,
    ) -> Result<usize> {
        let mut guard = self.inner.lock().unwrap();

        self.sweep_zombies(&mut guard, activity);

        for &idx in &guard.active_list {
            if let SlotState::Occupied(g) = &guard.slots[idx] {
                if g.gid == gid {
                    return Err(Error::DuplicateObject(format!(
                        "a prepared transaction with GID '{}' already exists",
                        gid
                    )));
                }
            }
        }

        let idx = guard.free_list.pop().ok_or_else(|| {
            Error::OutOfMemory
        })?;

        let gxact = GlobalTransaction {
            proc: ProcDescriptor {
                xid,
                database,
                subxids: Vec::new(),
                overflowed: false,
            },
            owner,
            locking_xid: xid,
            valid: false,
            gid,
            slot: idx,
        };

        guard.slots[idx] = SlotState::Occupied(gxact);
        guard.active_list.push(idx);

        Ok(idx)
    }

    fn sweep_zombies(&self, guard: &mut Inner, activity: &dyn XidActivity) {
        let mut zombies = Vec::new();
        for &idx in &guard.active_list {
            if let SlotState::Occupied(g) = &guard.slots[idx] {
                if !g.valid && !activity.is_active(g.locking_xid) {
                    zombies.push(idx);
                }
            }
        }
        for idx in zombies {
            self.unlink_active(guard, idx);
            guard.slots[idx] = SlotState::Free;
            guard.free_list.push(idx);
        }
    }

    fn unlink_active(&self, guard: &mut Inner, idx: usize) {
        if let Some(pos) = guard.active_list.iter().position(|&i| i == idx) {
            guard.active_list.swap_remove(pos);
        }
    }

    /// Stores up to `MAX_CACHED_SUBXIDS` subtransaction XIDs in the slot's
    /// surrogate descriptor. Called only while the slot is not yet valid;
    /// needs no lock beyond the caller's exclusive ownership of the
    /// not-yet-published slot.
    pub fn load_subxact_data(&self, slot: usize, subxids: &[XID]) {
        let mut guard = self.inner.lock().unwrap();
        if let SlotState::Occupied(g) = &mut guard.slots[slot] {
            let take = subxids.len().min(MAX_CACHED_SUBXIDS);
            g.proc.subxids = subxids[..take].to_vec();
            g.proc.overflowed = subxids.len() > MAX_CACHED_SUBXIDS;
        }
    }

    /// Marks the slot valid. The caller is responsible for publishing the
    /// surrogate descriptor to the process array strictly after this
    /// returns and strictly after the state file has been durably
    /// persisted.
    pub fn mark_as_prepared(&self, slot: usize) {
        let mut guard = self.inner.lock().unwrap();
        if let SlotState::Occupied(g) = &mut guard.slots[slot] {
            g.valid = true;
        }
    }

    /// Finds the valid slot for `gid` and claims it for the caller,
    /// enforcing the busy check and the owner/superuser permission check.
    pub fn lock_gxact(
        &self,
        activity: &dyn XidActivity,
        gid: &Gid,
        caller_xid: XID,
        caller: OID,
        caller_is_superuser: bool,
    ) -> Result<usize> {
        let mut guard = self.inner.lock().unwrap();

        let idx = guard
            .active_list
            .iter()
            .copied()
            .find(|&idx| match &guard.slots[idx] {
                SlotState::Occupied(g) => g.valid && g.gid == *gid,
                SlotState::Free => false,
            })
            .ok_or_else(|| {
                Error::UndefinedObject(format!("no prepared transaction with GID '{}'", gid))
            })?;

        if let SlotState::Occupied(g) = &mut guard.slots[idx] {
            if activity.is_active(g.locking_xid) {
                return Err(Error::Busy(format!(
                    "prepared transaction with GID '{}' is being committed or rolled back",
                    gid
                )));
            }

            if g.owner != caller && !caller_is_superuser {
                return Err(Error::InsufficientPrivilege(format!(
                    "must be owner or superuser to finish prepared transaction '{}'",
                    gid
                )));
            }

            g.locking_xid = caller_xid;
        }

        Ok(idx)
    }

    /// Returns the slot to the free list. The caller must already have
    /// removed it from the process array.
    pub fn remove_gxact(&self, slot: usize) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();

        if !matches!(guard.slots[slot], SlotState::Occupied(_)) {
            return Err(Error::Internal(format!(
                "attempted to remove a GXACT slot ({}) that was not occupied",
                slot
            )));
        }

        self.unlink_active(&mut guard, slot);
        guard.slots[slot] = SlotState::Free;
        guard.free_list.push(slot);

        Ok(())
    }

    pub fn set_valid(&self, slot: usize, valid: bool) {
        let mut guard = self.inner.lock().unwrap();
        if let SlotState::Occupied(g) = &mut guard.slots[slot] {
            g.valid = valid;
        }
    }

    pub fn with_slot<R>(&self, slot: usize, f: impl FnOnce(&GlobalTransaction) -> R) -> Result<R> {
        let guard = self.inner.lock().unwrap();
        match &guard.slots[slot] {
            SlotState::Occupied(g) => Ok(f(g)),
            SlotState::Free => Err(Error::Internal(format!("GXACT slot {} is not occupied", slot))),
        }
    }

    /// Finds the surrogate process descriptor for a prepared
    /// transaction's XID: a shared scan over occupied slots, memoized in
    /// a single-entry cache since finish and recovery call this
    /// repeatedly for the same XID. Not finding the XID is an internal
    /// inconsistency, not a recoverable error.
    pub fn lookup_proc_for(&self, xid: XID) -> Result<ProcDescriptor> {
        if let Some((cached_xid, slot)) = *self.lookup_cache.lock().unwrap() {
            if cached_xid == xid {
                let guard = self.inner.lock().unwrap();
                if let SlotState::Occupied(g) = &guard.slots[slot] {
                    if g.proc.xid == xid {
                        return Ok(g.proc.clone());
                    }
                }
            }
        }

        let guard = self.inner.lock().unwrap();
        for &idx in &guard.active_list {
            if let SlotState::Occupied(g) = &guard.slots[idx] {
                if g.proc.xid == xid {
                    let proc = g.proc.clone();
                    drop(guard);
                    *self.lookup_cache.lock().unwrap() = Some((xid, idx));
                    return Ok(proc);
                }
            }
        }

        Err(Error::Internal(format!(
            "failed to find surrogate proc for xid {}",
            xid
        )))
    }

    /// Returns copies of every occupied slot (valid or not) so that
    /// callers never hold the registry lock across downstream work.
    pub fn list_prepared(&self) -> Vec<GxactSnapshot> {
        let guard = self.inner.lock().unwrap();
        guard
            .active_list
            .iter()
            .filter_map(|&idx| match &guard.slots[idx] {
                SlotState::Occupied(g) => Some(GxactSnapshot {
                    xid: g.xid(),
                    database: g.proc.database,
                    owner: g.owner,
                    gid: g.gid.clone(),
                    valid: g.valid,
                }),
                SlotState::Free => None,
            })
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active_list.len()
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().unwrap().free_list.len()
    }
}

#[derive(Clone)]
pub struct GxactSnapshot {
    pub xid: XID,
    pub database: OID,
    pub owner: OID,
    pub gid: Gid,
    pub valid: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysActive;
    impl XidActivity for AlwaysActive {
        fn is_active(&self, _xid: XID) -> bool {
            true
        }
    }

    struct NeverActive;
    impl XidActivity for NeverActive {
        fn is_active(&self, _xid: XID) -> bool {
            false
        }
    }

    #[test]
    fn prepares_and_collides_on_gid() {
        let registry = GxactRegistry::new(4);
        let gid = Gid::new("tx-a").unwrap();
        let slot = registry
            .mark_as_preparing(&AlwaysActive, 1000, 5, gid.clone(), 42)
            .unwrap();
        registry.mark_as_prepared(slot);

        let err = registry
            .mark_as_preparing(&AlwaysActive, 1001, 5, gid, 42)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateObject(_)));
    }

    #[test]
    fn capacity_is_enforced() {
        let registry = GxactRegistry::new(1);
        let gid_a = Gid::new("a").unwrap();
        let gid_b = Gid::new("b").unwrap();
        registry
            .mark_as_preparing(&AlwaysActive, 1, 0, gid_a, 0)
            .unwrap();
        let err = registry
            .mark_as_preparing(&AlwaysActive, 2, 0, gid_b, 0)
            .unwrap_err();
        assert!(matches!(err, Error::OutOfMemory));
    }

    #[test]
    fn zombie_slot_is_recycled() {
        let registry = GxactRegistry::new(1);
        let gid = Gid::new("tx-a").unwrap();
        // Preparer reserves the slot but never calls mark_as_prepared,
        // then its XID stops being active: a crash before step 2.
        registry
            .mark_as_preparing(&NeverActive, 1000, 0, gid.clone(), 0)
            .unwrap();

        // A later preparer sweeps the zombie and reuses the GID.
        let slot = registry
            .mark_as_preparing(&NeverActive, 2000, 0, gid, 0)
            .unwrap();
        registry.mark_as_prepared(slot);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn lock_gxact_enforces_busy_and_privilege() {
        let registry = GxactRegistry::new(4);
        let gid = Gid::new("tx-a").unwrap();
        let slot = registry
            .mark_as_preparing(&AlwaysActive, 1000, 0, gid.clone(), 42)
            .unwrap();
        registry.mark_as_prepared(slot);

        // Owner can lock it while its own locking_xid isn't "active"
        // from the caller's perspective.
        let locked = registry.lock_gxact(&NeverActive, &gid, 99, 42, false).unwrap();
        assert_eq!(locked, slot);

        // Now locking_xid == 99 and looks active: a second caller is busy.
        let err = registry
            .lock_gxact(&AlwaysActive, &gid, 100, 42, false)
            .unwrap_err();
        assert!(matches!(err, Error::Busy(_)));
    }

    #[test]
    fn lock_gxact_rejects_non_owner() {
        let registry = GxactRegistry::new(4);
        let gid = Gid::new("tx-a").unwrap();
        let slot = registry
            .mark_as_preparing(&AlwaysActive, 1000, 0, gid.clone(), 42)
            .unwrap();
        registry.mark_as_prepared(slot);

        let err = registry
            .lock_gxact(&NeverActive, &gid, 99, 7, false)
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientPrivilege(_)));

        assert!(registry
            .lock_gxact(&NeverActive, &gid, 99, 7, true)
            .is_ok());
    }

    #[test]
    fn lookup_proc_for_finds_and_memoizes() {
        let registry = GxactRegistry::new(4);
        let gid = Gid::new("tx-a").unwrap();
        let slot = registry
            .mark_as_preparing(&AlwaysActive, 1000, 5, gid, 42)
            .unwrap();
        registry.mark_as_prepared(slot);

        let proc = registry.lookup_proc_for(1000).unwrap();
        assert_eq!(proc.xid, 1000);
        assert_eq!(proc.database, 5);

        // Repeated lookups for the same XID hit the memoized slot.
        let proc_again = registry.lookup_proc_for(1000).unwrap();
        assert_eq!(proc_again.xid, 1000);

        assert!(matches!(
            registry.lookup_proc_for(9999).unwrap_err(),
            Error::Internal(_)
        ));
    }

    #[test]
    fn remove_returns_slot_to_freelist() {
        let registry = GxactRegistry::new(1);
        let gid = Gid::new("tx-a").unwrap();
        let slot = registry
            .mark_as_preparing(&AlwaysActive, 1000, 0, gid, 0)
            .unwrap();
        registry.mark_as_prepared(slot);
        assert_eq!(registry.free_count(), 0);
        registry.remove_gxact(slot).unwrap();
        assert_eq!(registry.free_count(), 1);
        assert_eq!(registry.active_count(), 0);
    }
}
