//! The `prepared_xacts` introspection view: a read-only snapshot of
//! every currently valid (fully prepared, not mid-finish) global
//! transaction.

use crate::{db::Database, gid::Gid, OID, XID};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PreparedXact {
    pub xid: XID,
    pub gid: Gid,
    pub database: OID,
    pub owner: OID,
}

/// Lists every valid GXACT. A slot reserved but not yet committed to disk
/// (`valid == false`) is still mid-prepare or a recyclable zombie and is
/// deliberately excluded, matching `pg_prepared_xacts`'s documented
/// behavior of only showing transactions that have actually completed
/// PREPARE TRANSACTION.
pub fn list_prepared_xacts(db: &Database) -> Vec<PreparedXact> {
    db.gxact()
        .list_prepared()
        .into_iter()
        .filter(|snap| snap.valid)
        .map(|snap| PreparedXact {
            xid: snap.xid,
            gid: snap.gid,
            database: snap.database,
            owner: snap.owner,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::TwoPhaseConfig, relation_remover::FileRelationRemover, rm::RmRegistry, xact::LocalXact};

    #[test]
    fn excludes_unpublished_slots() {
        let dir = tempfile::tempdir().unwrap();
        let config = TwoPhaseConfig::new().root_path(dir.path()).max_prepared_xacts(2);
        let remover = Box::new(FileRelationRemover::new(config.base_path()));
        let db = Database::open(config, RmRegistry::new(), remover).unwrap();

        let xact = LocalXact::new(db.allocate_xid().unwrap(), Vec::new());
        let gid = Gid::new("gid-x").unwrap();
        db.prepare_transaction(&xact, 1, 7, gid.clone(), &[], &[], &[])
            .unwrap();

        let xacts = list_prepared_xacts(&db);
        assert_eq!(xacts.len(), 1);
        assert_eq!(xacts[0].gid, gid);
        assert_eq!(xacts[0].owner, 7);
    }
}
