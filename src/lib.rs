mod clog;
mod config;
mod db;
mod error;
mod finish;
mod gid;
mod gxact;
mod lock_manager;
mod prepare;
mod proc_array;
mod recovery;
mod relation_remover;
mod rm;
mod state_file;
mod subtrans;
mod views;
mod wal;
mod xact;
mod xid;

#[cfg(test)]
mod test_util;

pub use self::{
    config::{init_logging, TwoPhaseConfig},
    db::Database,
    error::{Error, Result},
    gid::Gid,
    lock_manager::LockManager,
    prepare::PendingRecord,
    relation_remover::{FileRelationRemover, RelationRemover},
    rm::{ResourceManager, RmId, RmRecord, RmRegistry},
    views::PreparedXact,
    xact::{CurrentXactFacts, LocalXact, XidAllocator},
    xid::XID,
};

/// Object identifier for a database or a relation.
pub type OID = u64;
