#![cfg(test)]

use crate::{
    config::TwoPhaseConfig, db::Database, lock_manager::LockManager, relation_remover::FileRelationRemover,
    rm::RmRegistry,
};

use std::sync::Arc;

/// A fully wired, temp-directory-backed test harness: a `Database` with
/// the clog, WAL, and GXACT registry already open, a `LockManager`
/// registered at rmid 0, and relation files rooted under the same temp
/// directory.
pub fn get_temp_env() -> (Database, Arc<LockManager>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = TwoPhaseConfig::new().root_path(dir.path());

    let lock_manager = Arc::new(LockManager::new());
    let mut rm_registry = RmRegistry::new();
    rm_registry.register(
        crate::lock_manager::LOCK_MANAGER_RMID,
        Box::new(TestLockManagerHandle(lock_manager.clone())),
    );

    let remover = Box::new(FileRelationRemover::new(config.base_path()));
    let db = Database::open(config, rm_registry, remover).unwrap();

    (db, lock_manager, dir)
}

/// `ResourceManager` needs `Send + Sync + 'static` ownership of its
/// state; this forwards to the `Arc<LockManager>` the test keeps its own
/// handle to, so tests can assert on lock state directly.
struct TestLockManagerHandle(Arc<LockManager>);

impl crate::rm::ResourceManager for TestLockManagerHandle {
    fn post_commit(&self, xid: crate::XID, info: u8, data: &[u8]) -> crate::Result<()> {
        self.0.post_commit(xid, info, data)
    }

    fn post_abort(&self, xid: crate::XID, info: u8, data: &[u8]) -> crate::Result<()> {
        self.0.post_abort(xid, info, data)
    }

    fn recover(&self, xid: crate::XID, info: u8, data: &[u8]) -> crate::Result<()> {
        self.0.recover(xid, info, data)
    }
}
