//! One physical WAL segment file: a sequence of fixed-size pages, each
//! holding zero or more record chunks. A record larger than one page's
//! free space is split across chunks tagged `First`/`Middle`/`Last`; a
//! chunk never crosses the boundary where less than `RECORD_HEADER_SIZE`
//! bytes remain in a page — that tail is left zeroed and the writer
//! jumps to the next page.
//!
//! `Segment` is the append/flush side. `SegmentView` is the read side;
//! it loads the whole file into memory up front rather than
//! memory-mapping it (see DESIGN.md for why).

use std::{
    fs::{File, OpenOptions},
    io::prelude::*,
    ops::Deref,
    path::Path,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::crc32;

use super::LogPointer;
use crate::{Error, Result};

const SEGMENT_PAGE_SIZE: usize = 0x2000;
const RECORD_HEADER_SIZE: usize = 7;

#[derive(Clone, Copy, PartialEq, Eq)]
enum RecordHeaderType {
    None = 0,
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl From<u8> for RecordHeaderType {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Full,
            2 => Self::First,
            3 => Self::Middle,
            4 => Self::Last,
            _ => Self::None,
        }
    }
}

pub struct Segment {
    segno: u32,
    file: File,
    page: Option<[u8; SEGMENT_PAGE_SIZE]>,
    page_allocated: usize,
    page_flushed: usize,
    page_start: usize,
    capacity: usize,
}

fn check_capacity(capacity: usize) -> Result<()> {
    if capacity > RECORD_HEADER_SIZE {
        Ok(())
    } else {
        Err(Error::InvalidArgument(
            "segment capacity is smaller than record header size".to_owned(),
        ))
    }
}

impl Segment {
    pub fn create<P: AsRef<Path>>(segno: u32, path: P, capacity: usize) -> Result<Self> {
        check_capacity(capacity)?;

        let file = OpenOptions::new()
            .read(false)
            .write(true)
            .create(true)
            .open(&path)?;

        Ok(Segment {
            segno,
            file,
            page: Some([0u8; SEGMENT_PAGE_SIZE]),
            page_allocated: 0,
            page_flushed: 0,
            page_start: 0,
            capacity,
        })
    }

    pub fn open<P: AsRef<Path>>(segno: u32, path: P, capacity: usize) -> Result<Self> {
        check_capacity(capacity)?;

        let mut file = OpenOptions::new()
            .read(false)
            .write(true)
            .create(false)
            .open(&path)?;

        let metadata = file.metadata()?;
        let file_size = metadata.len() as usize;

        if file_size > capacity {
            return Err(Error::InvalidArgument(format!(
                "invalid segment capacity: file size = {}, capacity = {}",
                file_size, capacity
            )));
        }

        let mut page_start = file_size;

        if file_size % SEGMENT_PAGE_SIZE != 0 {
            let padding = SEGMENT_PAGE_SIZE - (file_size % SEGMENT_PAGE_SIZE);
            let zero_bytes = vec![0u8; padding];
            file.write_all(&zero_bytes[..])?;
            page_start += padding;
        }

        Ok(Segment {
            segno,
            file,
            page: Some([0u8; SEGMENT_PAGE_SIZE]),
            page_allocated: 0,
            page_flushed: 0,
            page_start,
            capacity,
        })
    }

    pub fn append<T>(&mut self, record: &T) -> Result<Option<LogPointer>>
    where
        T: Deref<Target = [u8]>,
    {
        match &mut self.page {
            None => Err(Error::InvalidState(
                "log segment is not writable".to_owned(),
            )),
            Some(page) => {
                let mut length = record.len();
                let mut offset = 0;

                if !Self::_sufficient_capacity(
                    self.page_allocated,
                    self.page_start,
                    self.capacity,
                    record.len(),
                ) {
                    return Ok(None);
                }

                let mut record_type = RecordHeaderType::None;

                while length > 0 {
                    if SEGMENT_PAGE_SIZE - self.page_allocated <= RECORD_HEADER_SIZE {
                        self.file
                            .write_all(&page[self.page_flushed..SEGMENT_PAGE_SIZE])?;

                        for i in page.iter_mut() {
                            *i = 0;
                        }

                        self.page_allocated = 0;
                        self.page_flushed = 0;
                        self.page_start += SEGMENT_PAGE_SIZE;
                    }

                    let chunk_size = std::cmp::min(
                        length,
                        SEGMENT_PAGE_SIZE - self.page_allocated - RECORD_HEADER_SIZE,
                    );
                    let last_chunk = chunk_size == length;

                    record_type = match record_type {
                        RecordHeaderType::None => {
                            if last_chunk {
                                RecordHeaderType::Full
                            } else {
                                RecordHeaderType::First
                            }
                        }
                        RecordHeaderType::First | RecordHeaderType::Middle => {
                            if last_chunk {
                                RecordHeaderType::Last
                            } else {
                                RecordHeaderType::Middle
                            }
                        }
                        _ => RecordHeaderType::None,
                    };

                    let chunk = &record[offset..offset + chunk_size];
                    let record_start = self.page_allocated;
                    page[self.page_allocated] = record_type as u8;
                    self.page_allocated += 1;
                    (&mut page[self.page_allocated..])
                        .write_u16::<LittleEndian>(chunk_size as u16)?;
                    self.page_allocated += 2;
                    page[self.page_allocated..self.page_allocated + chunk_size]
                        .copy_from_slice(chunk);
                    self.page_allocated += chunk_size;
                    let crc = crc32::checksum_ieee(&page[record_start..self.page_allocated]);
                    (&mut page[self.page_allocated..]).write_u32::<LittleEndian>(crc)?;
                    self.page_allocated += 4;

                    length -= chunk_size;
                    offset += chunk_size;
                }

                Ok(Some(self.current_lsn()))
            }
        }
    }

    pub fn flush_page(&mut self, reset: bool) -> Result<()> {
        match &mut self.page {
            None => Err(Error::InvalidState(
                "log segment is not writable".to_owned(),
            )),
            Some(page) => {
                let reset = reset || self.page_allocated + RECORD_HEADER_SIZE >= SEGMENT_PAGE_SIZE;

                if reset {
                    self.page_allocated = SEGMENT_PAGE_SIZE;
                }

                self.file
                    .write_all(&page[self.page_flushed..self.page_allocated])?;
                self.page_flushed = self.page_allocated;

                if reset {
                    for i in page.iter_mut() {
                        *i = 0;
                    }

                    self.page_allocated = 0;
                    self.page_flushed = 0;
                    self.page_start += SEGMENT_PAGE_SIZE;
                }

                self.file.sync_data()?;

                Ok(())
            }
        }
    }

    pub fn segment_start(&self) -> LogPointer {
        ((self.segno as usize - 1) * self.capacity) as LogPointer
    }

    pub fn current_lsn(&self) -> LogPointer {
        self.segment_start() + (self.page_start + self.page_allocated) as LogPointer
    }

    pub fn flushed_lsn(&self) -> LogPointer {
        self.segment_start() + (self.page_start + self.page_flushed) as LogPointer
    }

    fn _sufficient_capacity(
        page_allocated: usize,
        page_start: usize,
        capacity: usize,
        record_size: usize,
    ) -> bool {
        let mut remaining = SEGMENT_PAGE_SIZE - page_allocated;
        remaining += (SEGMENT_PAGE_SIZE - RECORD_HEADER_SIZE)
            * ((capacity - page_start) / SEGMENT_PAGE_SIZE - 1);

        remaining >= record_size
    }

    pub fn sufficient_capacity(&self, record_size: usize) -> bool {
        self.page.map_or(false, |_| {
            Self::_sufficient_capacity(
                self.page_allocated,
                self.page_start,
                self.capacity,
                record_size,
            )
        })
    }

    pub fn dirty(&self) -> bool {
        self.page_allocated != self.page_flushed
    }
}

/// Read-only view of one segment's on-disk bytes, used by `WalReader`
/// during replay. Loads the whole segment into memory rather than
/// memory-mapping it.
pub struct SegmentView {
    buf: Vec<u8>,
}

impl SegmentView {
    pub fn open<P: AsRef<Path>>(path: P, _capacity: usize) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(Self { buf })
    }

    /// Reconstructs the record chunked starting at segment-relative byte
    /// `offset`, returning the assembled payload and the number of bytes
    /// consumed (including headers, CRCs, and any page-boundary skip).
    /// `Ok(None)` means there is nothing more to read from this segment
    /// at or after `offset` (either genuinely unwritten space, or a torn
    /// chunk at the tail from a crash mid-write).
    pub fn read_record(&self, offset: usize) -> Result<Option<(Vec<u8>, usize)>> {
        let mut pos = offset;
        let mut data = Vec::new();

        loop {
            let page_off = pos % SEGMENT_PAGE_SIZE;
            let page_start = pos - page_off;

            if SEGMENT_PAGE_SIZE - page_off <= RECORD_HEADER_SIZE {
                if !data.is_empty() {
                    return Err(Error::DataCorrupted(
                        "wal record chunk crossed a page boundary dead zone".to_owned(),
                    ));
                }
                pos = page_start + SEGMENT_PAGE_SIZE;
                continue;
            }

            if page_start + page_off + 3 > self.buf.len() {
                return Ok(None);
            }

            let record_type = RecordHeaderType::from(self.buf[page_start + page_off]);
            if record_type == RecordHeaderType::None {
                return Ok(None);
            }

            let chunk_data_start = page_start + page_off + 3;
            let chunk_size = (&self.buf[page_start + page_off + 1..chunk_data_start])
                .read_u16::<LittleEndian>()? as usize;
            let chunk_data_end = chunk_data_start + chunk_size;
            let crc_end = chunk_data_end + 4;

            if crc_end > self.buf.len() {
                return Ok(None);
            }

            let crc_stored = (&self.buf[chunk_data_end..crc_end]).read_u32::<LittleEndian>()?;
            let crc_computed = crc32::checksum_ieee(&self.buf[page_start + page_off..chunk_data_end]);
            if crc_stored != crc_computed {
                return Ok(None);
            }

            data.extend_from_slice(&self.buf[chunk_data_start..chunk_data_end]);
            pos = crc_end;

            match record_type {
                RecordHeaderType::Full | RecordHeaderType::Last => {
                    return Ok(Some((data, pos - offset)));
                }
                _ => continue,
            }
        }
    }
}
