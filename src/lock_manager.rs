//! A minimal in-memory lock manager, registered as resource manager 0.
//! Exists to give the RM bus (`rm::RmRegistry`) something concrete to
//! dispatch to: a prepared transaction registers one record per lock it
//! holds, and the lock is released on `post_commit`/`post_abort`, or
//! reacquired on `recover` so a lock survives a crash between PREPARE
//! and the eventual COMMIT/ROLLBACK PREPARED.

use crate::{rm::ResourceManager, Result, XID};

use std::{
    collections::HashMap,
    sync::Mutex,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

pub const LOCK_MANAGER_RMID: u8 = 0;

#[derive(Default)]
pub struct LockManager {
    held: Mutex<HashMap<u64, XID>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, lock_id: u64, xid: XID) {
        self.held.lock().unwrap().insert(lock_id, xid);
    }

    pub fn is_held(&self, lock_id: u64) -> bool {
        self.held.lock().unwrap().contains_key(&lock_id)
    }

    pub fn holder(&self, lock_id: u64) -> Option<XID> {
        self.held.lock().unwrap().get(&lock_id).copied()
    }

    fn release(&self, lock_id: u64) {
        self.held.lock().unwrap().remove(&lock_id);
    }

    /// The record body a caller registers with `PendingRecord` for each
    /// lock held by the transaction being prepared.
    pub fn encode_record(lock_id: u64) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8);
        buf.write_u64::<LittleEndian>(lock_id).unwrap();
        buf
    }

    fn decode_record(data: &[u8]) -> Option<u64> {
        (&data[..]).read_u64::<LittleEndian>().ok()
    }
}

impl ResourceManager for LockManager {
    fn post_commit(&self, _xid: XID, _info: u8, data: &[u8]) -> Result<()> {
        if let Some(lock_id) = Self::decode_record(data) {
            self.release(lock_id);
        }
        Ok(())
    }

    fn post_abort(&self, _xid: XID, _info: u8, data: &[u8]) -> Result<()> {
        if let Some(lock_id) = Self::decode_record(data) {
            self.release(lock_id);
        }
        Ok(())
    }

    fn recover(&self, xid: XID, _info: u8, data: &[u8]) -> Result<()> {
        if let Some(lock_id) = Self::decode_record(data) {
            self.acquire(lock_id, xid);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_releases_and_recover_reacquires() {
        let lm = LockManager::new();
        lm.acquire(1, 1000);
        assert!(lm.is_held(1));

        let record = LockManager::encode_record(1);
        lm.post_commit(1000, 0, &record).unwrap();
        assert!(!lm.is_held(1));

        lm.recover(1000, 0, &record).unwrap();
        assert_eq!(lm.holder(1), Some(1000));
    }
}
