//! Crash-recovery scan: two passes run after WAL replay has caught the
//! clog and the next-XID counter up to the last checkpoint.

use crate::{
    clog::TransactionStatus,
    db::Database,
    state_file,
    wal::LogRecord,
    xid::filename_to_xid,
    Error, Result, XID,
};

use std::{fs, io};

/// Dispatches one replayed WAL record to its redo action. `XactPrepare`
/// recreates the state file if replay finds it missing or still bearing
/// the bogus inverted CRC from a crash between WAL flush and the
/// correct-CRC fsync. `Checkpoint` carries no redo action of its own; it
/// only exists to be pointed at by the master record.
pub fn replay_record(db: &Database, record: &LogRecord) -> Result<()> {
    match record {
        LogRecord::XactPrepare { xid, body } => {
            let dir = db.config().twophase_dir();
            let needs_recreate = match state_file::read(&dir, *xid, db.config().state_file_max_bytes) {
                Some(_) => false,
                None => true,
            };
            if needs_recreate {
                state_file::recreate_state_file(&dir, *xid, body)?;
            }
            db.xid_alloc().advance_past(*xid);
            Ok(())
        }
        LogRecord::XactCommitPrepared(log) => {
            let mut clog = db.clog().lock().unwrap();
            clog.set_status_tree(log.xid, &log.subxids, TransactionStatus::Committed)?;
            db.xid_alloc().advance_past(log.xid);
            Ok(())
        }
        LogRecord::XactAbortPrepared(log) => {
            let mut clog = db.clog().lock().unwrap();
            clog.set_status_tree(log.xid, &log.subxids, TransactionStatus::Aborted)?;
            db.xid_alloc().advance_past(log.xid);
            Ok(())
        }
        LogRecord::Checkpoint(_) => Ok(()),
    }
}

fn read_state_file_dir(dir: &std::path::Path) -> Result<Vec<XID>> {
    let entries = match fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut xids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.metadata()?.is_file() {
            continue;
        }
        let filename = match entry.file_name().into_string() {
            Ok(f) => f,
            Err(_) => continue,
        };
        if let Some(xid) = filename_to_xid(&filename) {
            xids.push(xid);
        }
    }
    Ok(xids)
}

/// First recovery pass: finds the minimum XID still needed by a
/// surviving prepared transaction, discarding spurious or corrupt files
/// along the way, and advances the next-XID counter past any
/// subtransaction XID that never got direct WAL evidence.
pub fn prescan(db: &Database) -> Result<XID> {
    let dir = db.config().twophase_dir();
    let next_xid = db.xid_alloc().read_next();
    let mut min_xid: Option<XID> = None;

    for xid in read_state_file_dir(&dir)? {
        if xid >= next_xid {
            log::warn!(
                "removing spurious two-phase state file for xid {} (next xid is {})",
                xid,
                next_xid
            );
            let _ = state_file::delete_state_file(&dir, xid);
            continue;
        }

        let decoded = match state_file::read(&dir, xid, db.config().state_file_max_bytes) {
            Some(d) => d,
            None => {
                // state_file::read already warns on the specific cause
                // (I/O error, bad CRC, or header xid mismatch).
                let _ = state_file::delete_state_file(&dir, xid);
                continue;
            }
        };

        min_xid = Some(min_xid.map_or(xid, |m| m.min(xid)));

        for &sub in &decoded.subxids {
            db.xid_alloc().advance_past(sub);
        }
    }

    Ok(min_xid.unwrap_or(next_xid))
}

/// Second recovery pass: reloads the GXACT registry, the process array,
/// and the in-memory subtransaction-parent map, and replays every
/// resource manager's `recover` callback.
pub fn recover(db: &Database) -> Result<()> {
    let dir = db.config().twophase_dir();

    for xid in read_state_file_dir(&dir)? {
        let status = db.clog().lock().unwrap().get_status(xid)?;
        if status == TransactionStatus::Committed || status == TransactionStatus::Aborted {
            log::warn!(
                "removing two-phase state file for xid {} already resolved by the clog",
                xid
            );
            let _ = state_file::delete_state_file(&dir, xid);
            continue;
        }

        let decoded = match state_file::read(&dir, xid, db.config().state_file_max_bytes) {
            Some(d) => d,
            None => {
                let _ = state_file::delete_state_file(&dir, xid);
                continue;
            }
        };

        for &sub in &decoded.subxids {
            db.subtrans().set_parent(sub, xid);
        }

        let slot = db.gxact().mark_as_preparing(
            db.proc_array(),
            xid,
            decoded.database,
            decoded.gid.clone(),
            decoded.owner,
        )?;
        db.gxact().load_subxact_data(slot, &decoded.subxids);
        db.gxact().mark_as_prepared(slot);
        db.proc_array().add(xid, slot);

        for rec in &decoded.records {
            db.rm_registry()
                .recover(rec, xid)
                .map_err(|e| Error::Internal(format!("recover callback failed for xid {}: {}", xid, e)))?;
        }
    }

    Ok(())
}
