//! Resource-manager record bus. During PREPARE, resource managers
//! (typically the lock manager) register opaque records into the state
//! file; during COMMIT PREPARED / ROLLBACK PREPARED / recovery they are
//! replayed back, dispatched by `rmid`.
//!
//! A registry maps `rmid -> Box<dyn ResourceManager>`; an empty slot
//! means "nothing to do on that phase".

use crate::{Result, XID};

/// Resource manager id. `RM_END_ID` is reserved for the state file's
/// terminating sentinel record and is never a valid registration target.
pub type RmId = u8;

pub const RM_MAX_ID: RmId = 15;
pub const RM_END_ID: RmId = 0xFF;

/// One resource-manager record as stored in (or read from) the state
/// file's record stream.
#[derive(Clone, Debug)]
pub struct RmRecord {
    pub rmid: RmId,
    pub info: u8,
    pub data: Vec<u8>,
}

/// A resource manager's three two-phase callbacks. All three are no-ops
/// by default so implementers only need to override the phases they
/// actually participate in.
pub trait ResourceManager: Send + Sync {
    /// Invoked during COMMIT PREPARED, after WAL flush and clog update.
    fn post_commit(&self, xid: XID, info: u8, data: &[u8]) -> Result<()> {
        let _ = (xid, info, data);
        Ok(())
    }

    /// Invoked during ROLLBACK PREPARED.
    fn post_abort(&self, xid: XID, info: u8, data: &[u8]) -> Result<()> {
        let _ = (xid, info, data);
        Ok(())
    }

    /// Invoked during startup recovery to reinstate whatever state the
    /// record represents (notably lock reacquisition).
    fn recover(&self, xid: XID, info: u8, data: &[u8]) -> Result<()> {
        let _ = (xid, info, data);
        Ok(())
    }
}

pub struct RmRegistry {
    managers: [Option<Box<dyn ResourceManager>>; RM_MAX_ID as usize + 1],
}

impl Default for RmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RmRegistry {
    pub fn new() -> Self {
        Self {
            managers: Default::default(),
        }
    }

    pub fn register(&mut self, rmid: RmId, manager: Box<dyn ResourceManager>) {
        assert!(rmid <= RM_MAX_ID, "rmid out of range");
        self.managers[rmid as usize] = Some(manager);
    }

    pub fn post_commit(&self, rec: &RmRecord, xid: XID) -> Result<()> {
        self.dispatch(rec, xid, Phase::Commit)
    }

    pub fn post_abort(&self, rec: &RmRecord, xid: XID) -> Result<()> {
        self.dispatch(rec, xid, Phase::Abort)
    }

    pub fn recover(&self, rec: &RmRecord, xid: XID) -> Result<()> {
        self.dispatch(rec, xid, Phase::Recover)
    }

    fn dispatch(&self, rec: &RmRecord, xid: XID, phase: Phase) -> Result<()> {
        if rec.rmid > RM_MAX_ID {
            return Ok(());
        }
        match &self.managers[rec.rmid as usize] {
            None => Ok(()),
            Some(manager) => match phase {
                Phase::Commit => manager.post_commit(xid, rec.info, &rec.data),
                Phase::Abort => manager.post_abort(xid, rec.info, &rec.data),
                Phase::Recover => manager.recover(xid, rec.info, &rec.data),
            },
        }
    }
}

enum Phase {
    Commit,
    Abort,
    Recover,
}
