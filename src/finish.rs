//! Finish pipeline: `COMMIT PREPARED` / `ROLLBACK PREPARED`. Step
//! ordering is load-bearing — each step must complete before the next
//! begins, since a crash at any point after the WAL record must leave
//! the system in a state recovery can reconcile.

use crate::{
    clog::TransactionStatus,
    db::Database,
    error::critical,
    gid::Gid,
    state_file,
    wal::{LogRecord, XactFinishLog},
    Error, Result, OID, XID,
};

use std::time::{SystemTime, UNIX_EPOCH};

fn wallclock_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `finish_prepared(gid, is_commit)`. `caller_xid`/`caller`/
/// `caller_is_superuser` identify who is asking, for the busy check and
/// the owner/superuser permission check in `lock_gxact`.
pub fn finish_prepared(
    db: &Database,
    caller_xid: XID,
    caller: OID,
    caller_is_superuser: bool,
    gid: &Gid,
    is_commit: bool,
) -> Result<()> {
    let slot = db
        .gxact()
        .lock_gxact(db.proc_array(), gid, caller_xid, caller, caller_is_superuser)?;

    let xid = db.gxact().with_slot(slot, |g| g.xid())?;

    let dir = db.config().twophase_dir();
    let decoded = state_file::read(&dir, xid, db.config().state_file_max_bytes).ok_or_else(|| {
        Error::DataCorrupted(format!(
            "state file for prepared transaction '{}' (xid {}) is missing or corrupt",
            gid, xid
        ))
    })?;

    let rels = if is_commit {
        decoded.commit_rels.clone()
    } else {
        decoded.abort_rels.clone()
    };

    let finish_log = XactFinishLog {
        xid,
        wallclock: wallclock_now(),
        rels: rels.clone(),
        subxids: decoded.subxids.clone(),
    };
    let record = if is_commit {
        LogRecord::XactCommitPrepared(finish_log)
    } else {
        LogRecord::XactAbortPrepared(finish_log)
    };

    if !is_commit {
        // Catch the case where we crashed partway through a prior commit
        // of this same transaction: never let an abort record land for an
        // XID the clog already calls committed. This check runs before
        // the critical section, so an I/O error here is still recoverable.
        let already_committed = {
            let mut clog = db.clog().lock().unwrap();
            clog.get_status(xid)?
        } == TransactionStatus::Committed;
        if already_committed {
            panic!(
                "rollback of prepared transaction {} whose clog entry already reads committed",
                xid
            );
        }
    }

    // From here, any failure is process-fatal: the commit/abort WAL
    // record is about to become the durability boundary, so a failure in
    // the steps that follow can't be unwound, only crash-recovered from.
    //
    // a. WAL commit/abort record. Commit holds the shared checkpoint-start
    // lock through the clog update below, blocking a checkpoint from
    // declaring this LSN durable before the clog reflects it; abort needs
    // no such lock since nothing downstream depends on its ordering
    // against a checkpoint.
    if is_commit {
        let _checkpoint_guard = db.checkpoint_lock().read().unwrap();

        let (_, end_pos) = critical("wal append of commit record", db.wal().append(&record));
        critical("wal flush of commit record", db.wal().flush(Some(end_pos)));

        // b. clog: parent before children.
        let mut clog = db.clog().lock().unwrap();
        critical(
            "clog commit of prepared transaction",
            clog.set_status_tree(xid, &decoded.subxids, TransactionStatus::Committed),
        );
    } else {
        let (_, end_pos) = critical("wal append of abort record", db.wal().append(&record));
        critical("wal flush of abort record", db.wal().flush(Some(end_pos)));

        // b. clog: parent before children.
        let mut clog = db.clog().lock().unwrap();
        critical(
            "clog abort of prepared transaction",
            clog.set_status_tree(xid, &decoded.subxids, TransactionStatus::Aborted),
        );
    }

    // c. unlink from the process array.
    db.proc_array().remove(xid);

    // d. valid = false: a crash in the steps below now leaves a
    // recyclable zombie rather than a live-looking prepared transaction.
    db.gxact().set_valid(slot, false);

    // e. resource-manager callbacks over the record tail.
    for rec in &decoded.records {
        critical(
            "resource manager callback",
            if is_commit {
                db.rm_registry().post_commit(rec, xid)
            } else {
                db.rm_registry().post_abort(rec, xid)
            },
        );
    }

    // f. unlink relation files.
    for &rel in &rels {
        critical(
            "relation file unlink",
            db.relation_remover().unlink(decoded.database, rel),
        );
    }

    // g. delete the state file; a missing file here is a warning only.
    if !critical("state file deletion", state_file::delete_state_file(&dir, xid)) {
        log::warn!(
            "state file for xid {} was already gone when finishing '{}'",
            xid,
            gid
        );
    }

    // h. return the slot to the free list.
    critical("gxact slot release", db.gxact().remove_gxact(slot));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lock_manager::{LockManager, LOCK_MANAGER_RMID},
        prepare::PendingRecord,
        test_util::get_temp_env,
        xact::LocalXact,
    };

    #[test]
    fn commit_prepared_dispatches_resource_manager_and_releases_lock() {
        let (db, lock_manager, _dir) = get_temp_env();
        let xid = db.allocate_xid().unwrap();
        lock_manager.acquire(7, xid);

        let xact = LocalXact::new(xid, Vec::new());
        let gid = Gid::new("gid-lock").unwrap();
        let record = PendingRecord::new(LOCK_MANAGER_RMID, 0, LockManager::encode_record(7));
        db.prepare_transaction(&xact, 1, 42, gid.clone(), &[], &[], &[record])
            .unwrap();
        assert!(lock_manager.is_held(7));

        db.finish_prepared(999, 42, false, &gid, true).unwrap();
        assert!(!lock_manager.is_held(7));
    }

    #[test]
    fn rollback_prepared_also_releases_lock() {
        let (db, lock_manager, _dir) = get_temp_env();
        let xid = db.allocate_xid().unwrap();
        lock_manager.acquire(9, xid);

        let xact = LocalXact::new(xid, Vec::new());
        let gid = Gid::new("gid-lock-rollback").unwrap();
        let record = PendingRecord::new(LOCK_MANAGER_RMID, 0, LockManager::encode_record(9));
        db.prepare_transaction(&xact, 1, 42, gid.clone(), &[], &[], &[record])
            .unwrap();

        db.finish_prepared(999, 42, false, &gid, false).unwrap();
        assert!(!lock_manager.is_held(9));
    }
}
