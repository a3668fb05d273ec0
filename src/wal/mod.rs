//! Write-ahead log: a segmented, append-only record stream plus a small
//! master record pointing at the last checkpoint. Record types are
//! `XactPrepare`, `XactCommitPrepared`, `XactAbortPrepared`, and a
//! `Checkpoint` record for replay bookkeeping. `Wal::append` accepts a
//! bincode-encoded `LogRecord`; `Wal::append_raw` takes a raw byte chain
//! directly (the state file's own `RecordChain`, flattened) for callers
//! that already have bytes to hand.

mod checkpoint;
mod reader;
mod record;
mod segment;

pub use self::{
    checkpoint::MasterRecord,
    record::{CheckpointLog, LogRecord, XactFinishLog},
};

use self::{checkpoint::MasterRecordFile, reader::WalReader, segment::Segment};

use crate::{Error, Result};

use std::{
    fs::{self, DirBuilder, File},
    ops::Deref,
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
};

use fs2::FileExt;

pub type LogPointer = u64;

const MASTER_RECORD_FILENAME: &str = "master";

pub fn is_valid_lsn(lsn: LogPointer) -> bool {
    lsn > 0
}

pub struct WalConfig {
    pub segment_capacity: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_capacity: 16 * 1024 * 1024,
        }
    }
}

impl WalConfig {
    pub fn new() -> Self {
        Self::default()
    }
}

pub struct Wal {
    #[allow(dead_code)]
    dir: File,
    path: PathBuf,
    capacity: usize,
    segment_creator: Mutex<SegmentCreator>,
    open_segment: RwLock<Segment>,
    master_record_file: MasterRecordFile,
}

impl Wal {
    pub fn open<P: AsRef<Path>>(path: P, config: &WalConfig) -> Result<Self> {
        if !path.as_ref().exists() {
            DirBuilder::new().recursive(true).create(&path)?;
        } else if !path.as_ref().is_dir() {
            return Err(Error::WrongObjectType(format!(
                "'{}' exists but is not a directory",
                path.as_ref().display()
            )));
        }

        let dir = File::open(&path)?;
        dir.try_lock_exclusive()?;

        let mut last_segno: u32 = 0;
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            let metadata = entry.metadata()?;

            if !metadata.is_file() {
                continue;
            }

            let filename = match entry.file_name().into_string() {
                Ok(f) => f,
                Err(_) => continue,
            };

            if filename == MASTER_RECORD_FILENAME {
                continue;
            }

            let segno = filename_to_segno(&filename)?;
            if segno > last_segno {
                last_segno = segno;
            }
        }

        let mut segment_creator = SegmentCreator::new(&path, config.segment_capacity, last_segno);
        let segment = if last_segno == 0 {
            segment_creator.next_segment()
        } else {
            segment_creator.open_segment(last_segno)
        }?;

        let mut master_path = path.as_ref().to_path_buf();
        master_path.push(MASTER_RECORD_FILENAME);
        let master_record_file = MasterRecordFile::new(master_path);
        if master_record_file.read()?.is_none() {
            master_record_file.write(&MasterRecord::default())?;
        }

        Ok(Wal {
            dir,
            path: path.as_ref().to_path_buf(),
            capacity: config.segment_capacity,
            segment_creator: Mutex::new(segment_creator),
            open_segment: RwLock::new(segment),
            master_record_file,
        })
    }

    pub fn append(&self, record: &LogRecord) -> Result<(LogPointer, LogPointer)> {
        let buf = bincode::serialize(record).unwrap();
        self.append_raw(&buf)
    }

    /// Inserts a raw byte chain, e.g. the prepare pipeline's flattened
    /// state-file `RecordChain`, passed as a single gather-write payload.
    pub fn append_raw<T>(&self, record: &T) -> Result<(LogPointer, LogPointer)>
    where
        T: Deref<Target = [u8]>,
    {
        let mut guard = self.open_segment.write().unwrap();

        if !guard.sufficient_capacity(record.len()) {
            if guard.dirty() {
                guard.flush_page(true)?;
            }

            let mut creator = self.segment_creator.lock().unwrap();
            *guard = creator.next_segment()?;
        }

        let start_pos = guard.current_lsn();
        match guard.append(record)? {
            Some(end_pos) => Ok((start_pos, end_pos)),
            None => Err(Error::Internal(
                "record did not fit in a freshly rolled segment".to_owned(),
            )),
        }
    }

    pub fn flush(&self, lsn: Option<LogPointer>) -> Result<()> {
        let mut guard = self.open_segment.write().unwrap();

        if let Some(lsn) = lsn {
            if guard.flushed_lsn() >= lsn {
                return Ok(());
            }
        }
        guard.flush_page(false)
    }

    pub fn current_lsn(&self) -> LogPointer {
        let guard = self.open_segment.read().unwrap();
        guard.current_lsn()
    }

    pub fn get_reader(&self, start_pos: LogPointer) -> Result<WalReader> {
        WalReader::open(&self.path, self.capacity, start_pos)
    }

    /// Returns the redo LSN that startup replay must begin from: the
    /// position recorded by the last checkpoint record, or 0 if none
    /// exists yet.
    pub fn redo_start_pos(&self) -> Result<LogPointer> {
        let master_record = match self.master_record_file.read()? {
            Some(r) => r,
            None => return Ok(0),
        };

        if !is_valid_lsn(master_record.last_checkpoint_lsn) {
            return Ok(0);
        }

        let reader = self.get_reader(master_record.last_checkpoint_lsn)?;
        match reader.read_record(master_record.last_checkpoint_lsn)? {
            None => Err(Error::DataCorrupted(
                "cannot load the checkpoint log record".to_owned(),
            )),
            Some((_, recbuf)) => match bincode::deserialize::<LogRecord>(&recbuf) {
                Ok(LogRecord::Checkpoint(ckpt)) => Ok(ckpt.redo_lsn),
                Ok(_) => Err(Error::DataCorrupted(
                    "last checkpoint pos points to a non-checkpoint record".to_owned(),
                )),
                Err(_) => Err(Error::DataCorrupted(
                    "cannot deserialize the checkpoint log record".to_owned(),
                )),
            },
        }
    }

    /// Writes a checkpoint record at the current LSN and updates the
    /// master record to point at it. Callers are expected to have
    /// already made their own durable state (e.g. the clog) consistent
    /// up to this LSN before calling this.
    pub fn create_checkpoint(&self) -> Result<()> {
        let redo_lsn = self.current_lsn();
        let checkpoint_log = LogRecord::create_checkpoint_log(redo_lsn);
        let (checkpoint_lsn, _) = self.append(&checkpoint_log)?;
        self.flush(Some(checkpoint_lsn))?;

        self.master_record_file.write(&MasterRecord {
            last_checkpoint_lsn: checkpoint_lsn,
        })
    }
}

fn filename_to_segno(filename: &str) -> Result<u32> {
    u32::from_str_radix(filename, 16).map_err(|_| {
        Error::WrongObjectType(format!(
            "unexpected segment in wal directory: '{}'",
            filename
        ))
    })
}

struct SegmentCreator {
    path: PathBuf,
    last_segno: u32,
    capacity: usize,
}

impl SegmentCreator {
    fn new<P: AsRef<Path>>(path: P, capacity: usize, last_segno: u32) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            last_segno,
            capacity,
        }
    }

    fn open_segment(&self, segno: u32) -> Result<Segment> {
        Segment::open(segno, self.segno_to_path(segno), self.capacity)
    }

    fn next_segment(&mut self) -> Result<Segment> {
        self.last_segno += 1;
        Segment::create(
            self.last_segno,
            self.segno_to_path(self.last_segno),
            self.capacity,
        )
    }

    fn segno_to_path(&self, segno: u32) -> PathBuf {
        let mut path = self.path.clone();
        path.push(format!("{:08X}", segno));
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_wal() -> (Wal, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let config = WalConfig::new();
        let wal = Wal::open(dir.path(), &config).unwrap();
        (wal, dir)
    }

    #[test]
    fn can_create_wal() {
        let (_, dir) = create_wal();

        let mut path = dir.path().to_path_buf();
        path.push("00000001");
        assert!(path.is_file());

        dir.close().unwrap();
    }

    #[test]
    fn can_append_and_read_raw() {
        let (wal, dir) = create_wal();

        let record: &[u8] = &[42u8; 100];
        for _ in 0..10 {
            assert!(wal.append_raw(&record).is_ok());
        }
        wal.flush(None).unwrap();

        let reader = wal.get_reader(0).unwrap();
        let mut count = 0;
        for rec in reader.iter() {
            let (_, recbuf) = rec.unwrap();
            count += 1;
            assert_eq!(record, &recbuf[..]);
        }
        assert_eq!(count, 10);

        dir.close().unwrap();
    }

    #[test]
    fn can_append_record_and_replay() {
        let (wal, dir) = create_wal();

        let record = LogRecord::XactCommitPrepared(XactFinishLog {
            xid: 1000,
            wallclock: 123,
            rels: vec![7],
            subxids: vec![1001],
        });
        let (start, end) = wal.append(&record).unwrap();
        assert!(end > start);
        wal.flush(Some(end)).unwrap();

        let reader = wal.get_reader(0).unwrap();
        let (_, recbuf) = reader.read_record(0).unwrap().expect("record present");
        match bincode::deserialize::<LogRecord>(&recbuf).unwrap() {
            LogRecord::XactCommitPrepared(log) => {
                assert_eq!(log.xid, 1000);
                assert_eq!(log.rels, vec![7]);
            }
            _ => panic!("wrong record type"),
        }

        dir.close().unwrap();
    }

    #[test]
    fn checkpoint_round_trips_redo_pos() {
        let (wal, dir) = create_wal();

        wal.append_raw(&[1u8; 16].as_ref()).unwrap();
        wal.flush(None).unwrap();
        wal.create_checkpoint().unwrap();

        assert!(wal.redo_start_pos().unwrap() <= wal.current_lsn());

        dir.close().unwrap();
    }
}
