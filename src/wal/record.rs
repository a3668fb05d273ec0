//! WAL record payloads this crate produces and consumes: one
//! bincode-serializable enum covering checkpoints and every two-phase
//! commit transition.

use crate::{OID, XID};

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug)]
pub struct CheckpointLog {
    pub redo_lsn: super::LogPointer,
}

/// A prepared transaction's commit/abort payload: the XID, wallclock
/// time, and the relation/subtransaction lists needed to replay the
/// finish pipeline's WAL side effects.
#[derive(Serialize, Deserialize, Debug)]
pub struct XactFinishLog {
    pub xid: XID,
    pub wallclock: u64,
    pub rels: Vec<OID>,
    pub subxids: Vec<XID>,
}

#[derive(Serialize, Deserialize, Debug)]
pub enum LogRecord {
    Checkpoint(CheckpointLog),
    /// Body is the exact byte chain assembled during prepare, replayed
    /// via `state_file::recreate_state_file`.
    XactPrepare {
        xid: XID,
        #[serde(with = "serde_bytes")]
        body: Vec<u8>,
    },
    XactCommitPrepared(XactFinishLog),
    XactAbortPrepared(XactFinishLog),
}

impl LogRecord {
    pub fn create_checkpoint_log(redo_lsn: super::LogPointer) -> Self {
        LogRecord::Checkpoint(CheckpointLog { redo_lsn })
    }
}
