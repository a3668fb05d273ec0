//! Storage-manager stand-in. A full storage manager (page I/O, buffer
//! pool, access methods) is out of scope here; the finish pipeline only
//! ever needs the "unlink this relation's files" primitive, so that's
//! all this provides.

use crate::{Result, OID};

use std::{
    fs,
    path::{Path, PathBuf},
};

pub trait RelationRemover: Send + Sync {
    fn unlink(&self, db: OID, rel_id: OID) -> Result<()>;
}

pub struct FileRelationRemover {
    base_path: PathBuf,
}

impl FileRelationRemover {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn rel_path(&self, db: OID, rel_id: OID) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(db.to_string());
        path.push(format!("{}_0", rel_id));
        path
    }
}

impl RelationRemover for FileRelationRemover {
    fn unlink(&self, db: OID, rel_id: OID) -> Result<()> {
        let path = self.rel_path(db, rel_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlinks_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let remover = FileRelationRemover::new(dir.path());

        let db_dir = dir.path().join("5");
        fs::create_dir_all(&db_dir).unwrap();
        fs::write(db_dir.join("100_0"), b"data").unwrap();

        assert!(remover.unlink(5, 100).is_ok());
        assert!(!db_dir.join("100_0").exists());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let remover = FileRelationRemover::new(dir.path());
        assert!(remover.unlink(5, 999).is_ok());
    }
}
