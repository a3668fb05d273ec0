//! Commit-status log: a compact, durable map from XID to
//! `{in-progress, committed, aborted}`, paged on disk and cached with an
//! LRU of recently touched pages.

use crate::{xid::is_invalid_xid, Error, Result, XID};

use std::{
    fs::{File, OpenOptions},
    io::{self, prelude::*, SeekFrom},
    path::Path,
};

use lru::LruCache;

const CLOG_PAGE_SIZE: usize = 4096;
const CLOG_CACHE_CAPACITY: usize = 128;

const BITS_PER_XID: usize = 2;
const XIDS_PER_BYTE: usize = 8 / BITS_PER_XID;
const XIDS_PER_PAGE: usize = XIDS_PER_BYTE * CLOG_PAGE_SIZE;

#[inline(always)]
fn xid_to_page_num(xid: XID) -> usize {
    xid as usize / XIDS_PER_PAGE
}

#[inline(always)]
fn xid_to_page_index(xid: XID) -> usize {
    xid as usize % XIDS_PER_PAGE
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    InProgress = 0,
    Committed = 1,
    Aborted = 2,
    SubCommitted = 3,
}

impl From<u8> for TransactionStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::InProgress,
            1 => Self::Committed,
            2 => Self::Aborted,
            _ => Self::SubCommitted,
        }
    }
}

struct ClogPage {
    page_num: usize,
    buffer: [u8; CLOG_PAGE_SIZE],
    dirty: bool,
}

impl ClogPage {
    fn new(page_num: usize) -> Self {
        Self {
            page_num,
            buffer: [0u8; CLOG_PAGE_SIZE],
            dirty: false,
        }
    }

    fn zero_page(&mut self) {
        for b in self.buffer.iter_mut() {
            *b = 0;
        }
    }
}

/// Records the status of every XID ever allocated.
pub struct Clog {
    last_page_num: usize,
    file: File,
    lru: LruCache<usize, ClogPage>,
}

impl Clog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = if path.exists() {
            if !path.is_file() {
                return Err(Error::WrongObjectType(
                    "clog exists but is not a regular file".to_owned(),
                ));
            } else {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(false)
                    .open(path)?
            }
        } else {
            File::create(path)?
        };

        let metadata = file.metadata()?;

        if metadata.len() as usize % CLOG_PAGE_SIZE != 0 {
            return Err(Error::DataCorrupted(
                "the last page of the clog is torn".to_owned(),
            ));
        }

        let last_page_num = metadata.len() as usize / CLOG_PAGE_SIZE;

        let mut clog = Self {
            last_page_num,
            file,
            lru: LruCache::new(CLOG_CACHE_CAPACITY),
        };

        if last_page_num == 0 {
            let page = clog.new_page(0)?;
            clog.write_page(0, &page)?;
            clog.put_page(page);
        }

        Ok(clog)
    }

    pub fn init_state(&mut self, xid: XID) {
        self.last_page_num = xid_to_page_num(xid);
    }

    fn alloc_page(&mut self, page_num: usize) -> Result<ClogPage> {
        if self.lru.len() < CLOG_CACHE_CAPACITY {
            Ok(ClogPage::new(page_num))
        } else {
            match self.lru.pop_lru() {
                Some((page_num, mut page)) => {
                    if page.dirty {
                        self.write_page(page_num, &page)?;
                        page.dirty = false;
                    }
                    Ok(page)
                }
                _ => unreachable!(),
            }
        }
    }

    fn put_page(&mut self, page: ClogPage) {
        self.lru.put(page.page_num, page);
    }

    fn read_page(&mut self, page_num: usize, page: &mut ClogPage) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(page_num as u64 * CLOG_PAGE_SIZE as u64))?;

        match self.file.read_exact(&mut page.buffer) {
            Err(e) => {
                if e.kind() == io::ErrorKind::UnexpectedEof {
                    Err(Error::DataCorrupted(format!(
                        "could not read page {} of the clog: unexpected EOF",
                        page_num,
                    )))
                } else {
                    Err(Error::FileAccess(format!(
                        "could not read page {} of the clog",
                        page_num,
                    )))
                }
            }
            _ => Ok(()),
        }
    }

    fn write_page(&mut self, page_num: usize, page: &ClogPage) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(page_num as u64 * CLOG_PAGE_SIZE as u64))?;

        match self.file.write_all(&page.buffer) {
            Err(_) => Err(Error::FileAccess(format!(
                "could not write page {} of the clog",
                page_num,
            ))),
            _ => Ok(()),
        }
    }

    fn new_page(&mut self, page_num: usize) -> Result<ClogPage> {
        let mut page = self.alloc_page(page_num)?;
        page.zero_page();
        self.last_page_num = page_num;

        Ok(page)
    }

    fn fetch_page(&mut self, page_num: usize) -> Result<ClogPage> {
        if page_num > self.last_page_num {
            return Err(Error::InvalidArgument(
                "page number > last page number".to_owned(),
            ));
        }

        match self.lru.pop(&page_num) {
            Some(page) => Ok(page),
            None => {
                let mut page = self.alloc_page(page_num)?;
                self.read_page(page_num, &mut page)?;
                Ok(page)
            }
        }
    }

    /// Extends the clog to cover a freshly allocated XID, zeroing the new
    /// page. A no-op unless `xid` is the first XID of a new page.
    pub fn extend(&mut self, xid: XID) -> Result<()> {
        if is_invalid_xid(xid) || xid_to_page_index(xid) != 0 {
            Ok(())
        } else {
            let page_num = xid_to_page_num(xid);
            let page = self.new_page(page_num)?;
            self.put_page(page);
            Ok(())
        }
    }

    pub fn get_status(&mut self, xid: XID) -> Result<TransactionStatus> {
        if is_invalid_xid(xid) {
            return Ok(TransactionStatus::InProgress);
        }

        let page_num = xid_to_page_num(xid);
        let page = self.fetch_page(page_num)?;

        let index = xid_to_page_index(xid);
        let bytepos = index / XIDS_PER_BYTE;
        let byteoff = index % XIDS_PER_BYTE;

        let status =
            TransactionStatus::from((page.buffer[bytepos] >> (byteoff * BITS_PER_XID)) & 3u8);
        self.put_page(page);

        Ok(status)
    }

    pub fn set_status(&mut self, xid: XID, status: TransactionStatus) -> Result<()> {
        let page_num = xid_to_page_num(xid);
        let mut page = self.fetch_page(page_num)?;
        let index = xid_to_page_index(xid);
        let bytepos = index / XIDS_PER_BYTE;
        let byteoff = index % XIDS_PER_BYTE;

        page.buffer[bytepos] &= !(3u8 << (byteoff * BITS_PER_XID));
        page.buffer[bytepos] |= (status as u8) << (byteoff * BITS_PER_XID);
        page.dirty = true;

        self.put_page(page);

        Ok(())
    }

    /// Marks a whole subtransaction tree in one call, parent first so a
    /// crash partway through never leaves a child looking committed while
    /// its parent still reads in-progress.
    pub fn set_status_tree(
        &mut self,
        top_xid: XID,
        subxids: &[XID],
        status: TransactionStatus,
    ) -> Result<()> {
        self.set_status(top_xid, status)?;
        for &sub in subxids {
            self.set_status(sub, status)?;
        }
        Ok(())
    }

    pub fn checkpoint(&mut self) -> Result<()> {
        for (page_num, page) in self.lru.iter_mut() {
            if !page.dirty {
                continue;
            }

            self.file
                .seek(SeekFrom::Start(*page_num as u64 * CLOG_PAGE_SIZE as u64))?;

            if self.file.write_all(&page.buffer).is_err() {
                return Err(Error::FileAccess(format!(
                    "could not write page {} of the clog",
                    page_num,
                )));
            }

            page.dirty = false;
        }
        Ok(())
    }

    pub fn redo_zero_page(&mut self, page_num: usize) -> Result<()> {
        let page = self.new_page(page_num)?;
        self.write_page(page_num, &page)?;
        self.put_page(page);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_get_set_transaction_status() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut clog = Clog::open(file.path()).unwrap();

        for i in 1..100u32 {
            assert!(clog
                .set_status(i, TransactionStatus::from((i % 3) as u8))
                .is_ok());
        }

        for i in 1..100u32 {
            let status = clog.get_status(i).unwrap();
            assert_eq!(TransactionStatus::from((i % 3) as u8), status);
        }

        file.close().unwrap();
    }

    #[test]
    fn invalid_xid_reads_as_in_progress() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut clog = Clog::open(file.path()).unwrap();
        assert_eq!(clog.get_status(0).unwrap(), TransactionStatus::InProgress);
    }
}
