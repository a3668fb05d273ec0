//! The master record: a tiny, CRC-protected file recording the LSN of
//! the last checkpoint, read at startup to find where WAL replay must
//! begin. There is no buffer pool here to sync before writing it; the
//! "write the checkpoint WAL record" step lives on `Wal::create_checkpoint`,
//! which has access to the segment writer this module does not.

use crate::{Error, Result};

use super::LogPointer;

use std::{
    fs::{File, OpenOptions},
    io::prelude::*,
    path::{Path, PathBuf},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::crc32;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug)]
pub struct MasterRecord {
    pub last_checkpoint_lsn: LogPointer,
}

impl Default for MasterRecord {
    fn default() -> Self {
        Self {
            last_checkpoint_lsn: 0,
        }
    }
}

pub struct MasterRecordFile {
    file_path: PathBuf,
}

impl MasterRecordFile {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
        }
    }

    pub fn read(&self) -> Result<Option<MasterRecord>> {
        if !self.file_path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&self.file_path)?;
        let mut buffer = Vec::new();
        file.read_to_end(&mut buffer)?;

        if buffer.len() < 4 {
            return Err(Error::DataCorrupted("master record is corrupted".to_owned()));
        }

        let crc_buf = buffer.split_off(buffer.len() - 4);
        let crc_file = (&crc_buf[..]).read_u32::<LittleEndian>().unwrap();
        let crc = crc32::checksum_ieee(&buffer);

        if crc != crc_file {
            return Err(Error::DataCorrupted(
                "master record is corrupted (checksum does not match)".to_owned(),
            ));
        }

        let record = bincode::deserialize::<MasterRecord>(&buffer)
            .map_err(|_| Error::DataCorrupted("cannot deserialize the master record".to_owned()))?;

        Ok(Some(record))
    }

    pub fn write(&self, record: &MasterRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .read(false)
            .open(&self.file_path)?;

        let mut buffer = bincode::serialize(record).unwrap();
        let crc = crc32::checksum_ieee(&buffer);
        buffer.write_u32::<LittleEndian>(crc).unwrap();

        file.write_all(&buffer)?;
        file.sync_all()?;
        Ok(())
    }
}
