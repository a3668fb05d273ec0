//! Prepare pipeline: assembly of a prepared transaction's record chain
//! followed by the durability protocol that commits it to WAL and to its
//! state file.

use crate::{
    db::Database,
    error::critical,
    gid::Gid,
    rm::RmId,
    state_file::{self, StateFileBuilder},
    wal::LogRecord,
    xact::CurrentXactFacts,
    Result, OID, XID,
};

/// One resource manager's registration for this prepare call.
pub struct PendingRecord {
    pub rmid: RmId,
    pub info: u8,
    pub data: Vec<u8>,
}

impl PendingRecord {
    pub fn new(rmid: RmId, info: u8, data: Vec<u8>) -> Self {
        Self { rmid, info, data }
    }
}

/// Reserves a GXACT slot, assembles the state-file chain, and durably
/// commits it (WAL PREPARE record, then the correct-CRC fsync), finally
/// publishing the GXACT as valid. The fallible middle section runs
/// behind a closure boundary so an early failure can unwind the
/// registry/process-array registration already made, leaving the GXACT
/// valid as a recyclable zombie rather than stuck half-registered.
pub fn prepare_transaction(
    db: &Database,
    xact: &dyn CurrentXactFacts,
    database: OID,
    owner: OID,
    gid: Gid,
    commit_rels: &[OID],
    abort_rels: &[OID],
    records: &[PendingRecord],
) -> Result<()> {
    let xid = xact.current_xid();
    let subxids = xact.subxids();

    let slot = db
        .gxact()
        .mark_as_preparing(db.proc_array(), xid, database, gid.clone(), owner)?;
    db.proc_array().add(xid, slot);

    let outcome = assemble_and_commit(db, xid, database, owner, &gid, &subxids, commit_rels, abort_rels, records, slot);

    match outcome {
        Ok(()) => {
            for &sub in &subxids {
                db.subtrans().set_parent(sub, xid);
            }
            db.gxact().mark_as_prepared(slot);
            Ok(())
        }
        Err(e) => {
            // The worker driving this prepare failed before the state
            // file became durable: unregister so a later preparer's
            // zombie sweep can recycle the slot.
            db.proc_array().remove(xid);
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn assemble_and_commit(
    db: &Database,
    xid: XID,
    database: OID,
    owner: OID,
    gid: &Gid,
    subxids: &[XID],
    commit_rels: &[OID],
    abort_rels: &[OID],
    records: &[PendingRecord],
    slot: usize,
) -> Result<()> {
    db.gxact().load_subxact_data(slot, subxids);

    let mut builder = StateFileBuilder::start(
        xid,
        database,
        owner,
        gid.clone(),
        subxids,
        commit_rels,
        abort_rels,
    );
    for rec in records {
        builder.register_record(rec.rmid, rec.info, &rec.data);
    }
    let chain = builder.end();

    let mut file = state_file::create_and_preallocate(db.config().twophase_dir(), xid, &chain)?;

    // Critical section: from here, any failure is process-fatal, not
    // recoverable. The checkpoint-start lock held shared here blocks a
    // checkpoint from declaring everything up to this LSN durable before
    // the state file's real CRC lands.
    let _checkpoint_guard = db.checkpoint_lock().read().unwrap();

    let body = chain.flatten();
    let (_, end_pos) = critical(
        "wal append of prepare record",
        db.wal().append(&LogRecord::XactPrepare { xid, body }),
    );
    critical("wal flush of prepare record", db.wal().flush(Some(end_pos)));

    critical(
        "state file crc finalization",
        state_file::finalize_crc(&mut file, &chain),
    );
    drop(file);

    Ok(())
}
