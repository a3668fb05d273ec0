//! Ties every collaborator together and drives the startup sequence: open
//! the durable stores, replay the WAL forward from the last checkpoint,
//! then run the two-pass recovery scan.

use crate::{
    clog::Clog,
    config::TwoPhaseConfig,
    finish,
    gid::Gid,
    gxact::GxactRegistry,
    prepare::{self, PendingRecord},
    proc_array::ProcArray,
    recovery,
    relation_remover::RelationRemover,
    rm::RmRegistry,
    subtrans::SubtransMap,
    views::PreparedXact,
    wal::{Wal, WalConfig},
    xact::{CurrentXactFacts, XidAllocator},
    Result, OID, XID,
};

use std::{
    fs,
    sync::{Mutex, RwLock},
};

/// The first XID a freshly initialized system allocates; 0 is reserved to
/// mean "invalid".
const FIRST_NORMAL_XID: u32 = 1;

pub struct Database {
    config: TwoPhaseConfig,
    clog: Mutex<Clog>,
    wal: Wal,
    gxact: GxactRegistry,
    proc_array: ProcArray,
    rm_registry: RmRegistry,
    relation_remover: Box<dyn RelationRemover>,
    xid_alloc: XidAllocator,
    subtrans: SubtransMap,
    /// Held shared by a preparer/finisher while it inserts its own WAL
    /// record, and would be held exclusive by a checkpoint; this crate
    /// does not drive checkpoints on a timer, but the lock still exists
    /// so a caller that does can serialize against in-flight prepares.
    checkpoint_lock: RwLock<()>,
}

impl Database {
    /// Opens every durable store and runs crash recovery to completion.
    /// `rm_registry` and `relation_remover` are supplied by the caller
    /// since they encode application-specific behavior this crate's core
    /// has no business constructing.
    pub fn open(
        config: TwoPhaseConfig,
        rm_registry: RmRegistry,
        relation_remover: Box<dyn RelationRemover>,
    ) -> Result<Self> {
        fs::create_dir_all(config.twophase_dir())?;
        fs::create_dir_all(config.base_path())?;

        let clog = Clog::open(config.clog_path())?;
        let wal = Wal::open(config.wal_dir(), &WalConfig::new())?;
        let capacity = config.max_prepared_xacts;

        let db = Database {
            config,
            clog: Mutex::new(clog),
            wal,
            gxact: GxactRegistry::new(capacity),
            proc_array: ProcArray::new(),
            rm_registry,
            relation_remover,
            xid_alloc: XidAllocator::new(FIRST_NORMAL_XID),
            subtrans: SubtransMap::new(),
            checkpoint_lock: RwLock::new(()),
        };

        db.replay_wal()?;
        recovery::prescan(&db)?;
        recovery::recover(&db)?;

        Ok(db)
    }

    fn replay_wal(&self) -> Result<()> {
        let start_pos = self.wal.redo_start_pos()?;
        let reader = self.wal.get_reader(start_pos)?;
        for entry in reader.iter() {
            let (_, recbuf) = entry?;
            let record: crate::wal::LogRecord = bincode::deserialize(&recbuf).map_err(|e| {
                crate::Error::DataCorrupted(format!("cannot deserialize WAL record: {}", e))
            })?;
            recovery::replay_record(self, &record)?;
        }
        Ok(())
    }

    pub fn config(&self) -> &TwoPhaseConfig {
        &self.config
    }

    pub fn wal(&self) -> &Wal {
        &self.wal
    }

    pub fn clog(&self) -> &Mutex<Clog> {
        &self.clog
    }

    pub fn gxact(&self) -> &GxactRegistry {
        &self.gxact
    }

    pub fn proc_array(&self) -> &ProcArray {
        &self.proc_array
    }

    pub fn rm_registry(&self) -> &RmRegistry {
        &self.rm_registry
    }

    pub fn relation_remover(&self) -> &dyn RelationRemover {
        self.relation_remover.as_ref()
    }

    pub fn subtrans(&self) -> &SubtransMap {
        &self.subtrans
    }

    pub fn xid_alloc(&self) -> &XidAllocator {
        &self.xid_alloc
    }

    /// Allocates the next XID and extends the clog to cover it before
    /// handing it back: `Clog::fetch_page` refuses to page in anything
    /// past the last page it knows about, so allocation and clog paging
    /// have to stay in lockstep or any XID beyond the first page breaks
    /// `set_status`/`get_status` for it later.
    pub fn allocate_xid(&self) -> Result<XID> {
        let xid = self.xid_alloc.next();
        self.clog.lock().unwrap().extend(xid)?;
        Ok(xid)
    }

    pub fn checkpoint_lock(&self) -> &RwLock<()> {
        &self.checkpoint_lock
    }

    /// `PREPARE TRANSACTION '<gid>'`.
    #[allow(clippy::too_many_arguments)]
    pub fn prepare_transaction(
        &self,
        xact: &dyn CurrentXactFacts,
        database: OID,
        owner: OID,
        gid: Gid,
        commit_rels: &[OID],
        abort_rels: &[OID],
        records: &[PendingRecord],
    ) -> Result<()> {
        prepare::prepare_transaction(self, xact, database, owner, gid, commit_rels, abort_rels, records)
    }

    /// `COMMIT PREPARED '<gid>'` / `ROLLBACK PREPARED '<gid>'`:
    /// `is_commit` selects which.
    pub fn finish_prepared(
        &self,
        caller_xid: XID,
        caller: OID,
        caller_is_superuser: bool,
        gid: &Gid,
        is_commit: bool,
    ) -> Result<()> {
        finish::finish_prepared(self, caller_xid, caller, caller_is_superuser, gid, is_commit)
    }

    /// The `prepared_xacts` introspection view.
    pub fn prepared_xacts(&self) -> Vec<PreparedXact> {
        crate::views::list_prepared_xacts(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{relation_remover::FileRelationRemover, xact::LocalXact};

    fn open_db(root: &std::path::Path) -> Database {
        let config = TwoPhaseConfig::new().root_path(root).max_prepared_xacts(4);
        let remover = Box::new(FileRelationRemover::new(config.base_path()));
        Database::open(config, RmRegistry::new(), remover).unwrap()
    }

    #[test]
    fn opens_a_fresh_database() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(dir.path());
        assert_eq!(db.gxact().capacity(), 4);
        assert!(db.prepared_xacts().is_empty());
    }

    #[test]
    fn prepare_then_commit_round_trips_through_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = open_db(dir.path());
            let xact = LocalXact::new(db.allocate_xid().unwrap(), Vec::new());
            let gid = Gid::new("gid-a").unwrap();
            db.prepare_transaction(&xact, 1, 42, gid.clone(), &[], &[], &[])
                .unwrap();
            assert_eq!(db.prepared_xacts().len(), 1);
        }
        {
            // Reopen: recovery should reload the prepared transaction.
            let db = open_db(dir.path());
            assert_eq!(db.prepared_xacts().len(), 1);
            let gid = Gid::new("gid-a").unwrap();
            db.finish_prepared(999, 42, false, &gid, true).unwrap();
            assert!(db.prepared_xacts().is_empty());
        }
    }

    #[test]
    fn allocates_xid_past_first_clog_page_and_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let gid = Gid::new("gid-page").unwrap();
        {
            let db = open_db(dir.path());
            // Force the next allocation to land on the first XID of the
            // clog's second page.
            db.xid_alloc().set_next(16384);
            let xid = db.allocate_xid().unwrap();
            assert_eq!(xid, 16384);

            let xact = LocalXact::new(xid, Vec::new());
            db.prepare_transaction(&xact, 1, 42, gid.clone(), &[], &[], &[])
                .unwrap();
        }
        {
            // Recovery must reload the prepared transaction and finishing
            // it must be able to touch the clog page the XID lives on.
            let db = open_db(dir.path());
            assert_eq!(db.prepared_xacts().len(), 1);
            db.finish_prepared(999, 42, false, &gid, true).unwrap();
            assert!(db.prepared_xacts().is_empty());
        }
    }
}
