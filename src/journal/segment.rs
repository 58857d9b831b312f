//! On-disk journal segments
//!
//! A segment is a sequence of length-prefixed bincode frames:
//!
//! - magic (4 bytes LE), then one frame holding the [`SegmentHeader`];
//! - one frame per transaction, each holding the batch `Vec<Row>`; the last
//!   row of every batch has `is_commit` set;
//! - a sealing marker (a length prefix of `0xFFFF_FFFF`) written when the
//!   segment is closed.
//!
//! A segment without the sealing marker may have a torn tail. Recovery either
//! refuses it or renames it to `<name>.corrupted` and keeps the complete
//! prefix, depending on the force-recovery flag.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::config::LogMode;
use crate::error::{Error, Result};
use crate::row::Row;
use crate::vclock::Vclock;

pub const SEGMENT_MAGIC: u32 = 0x4d53_4c47;
pub const SEGMENT_VERSION: u16 = 1;
/// Length-prefix value that marks a cleanly sealed segment.
const SEAL_MARKER: u32 = 0xffff_ffff;
/// Preallocation chunk. Growth happens in these steps to keep the append
/// path off the block allocator.
pub const PREALLOC_CHUNK: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub version: u16,
    /// Peer that produced this segment.
    pub peer_id: u32,
    /// Random token of the journal instance that created the file.
    pub run_id: u64,
    /// Vclock of the latest checkpoint known when the segment was opened.
    pub prev_checkpoint: Vclock,
    /// Vclock sum at segment creation; also encoded in the file name.
    pub start_sum: i64,
}

/// Name segments by the vclock sum at creation so a directory listing sorts
/// them in log order.
pub fn segment_file_name(start_sum: i64) -> String {
    format!("{:020}.xlog", start_sum)
}

pub fn segment_path(dir: &Path, start_sum: i64) -> PathBuf {
    dir.join(segment_file_name(start_sum))
}

/// Parse the start sum back out of a segment file name.
pub fn parse_segment_name(name: &str) -> Option<i64> {
    let stem = name.strip_suffix(".xlog")?;
    stem.parse::<i64>().ok()
}

/// Encode one transaction batch into a single length-prefixed frame. The
/// writer hands the whole frame to one `write_all`, so a batch either lands
/// contiguously or gets truncated away as a unit.
pub fn encode_batch(rows: &[Row]) -> Result<Vec<u8>> {
    let body = bincode::serialize(rows)
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.to_vec())
}

/// Append side of a segment.
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    mode: LogMode,
    /// Bytes of real data written so far (header included).
    len: u64,
    /// Bytes reserved on disk via preallocation.
    allocated: u64,
    sealed: bool,
}

impl SegmentWriter {
    pub fn create(path: PathBuf, header: &SegmentHeader, mode: LogMode) -> Result<SegmentWriter> {
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        let mut buf = BytesMut::new();
        buf.put_u32_le(SEGMENT_MAGIC);
        let header_body = bincode::serialize(header)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        buf.put_u32_le(header_body.len() as u32);
        buf.put_slice(&header_body);
        file.write_all(&buf)?;
        if mode == LogMode::Fsync {
            file.sync_data()?;
        }
        let len = buf.len() as u64;
        Ok(SegmentWriter {
            file,
            path,
            mode,
            len,
            allocated: len,
            sealed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// Make sure at least `len` more bytes fit into the reserved space.
    /// Returns the I/O error untouched so the caller can recognize ENOSPC.
    pub fn preallocate(&mut self, len: u64) -> std::io::Result<()> {
        let needed = self.len + len;
        if needed <= self.allocated {
            return Ok(());
        }
        let target = needed.max(self.allocated + PREALLOC_CHUNK);
        self.file.set_len(target)?;
        self.allocated = target;
        Ok(())
    }

    /// Append one pre-encoded batch frame. On failure the file is truncated
    /// back to the last complete frame boundary, so a torn write never leaves
    /// half a batch behind.
    pub fn append_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        debug_assert!(!self.sealed);
        let boundary = self.len;
        match self.write_frame_inner(frame) {
            Ok(()) => {
                self.len = boundary + frame.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Roll the file back to the last committed boundary. A
                // failure here is unrecoverable for this segment anyway.
                let _ = self.file.set_len(boundary);
                let _ = self.file.seek(SeekFrom::Start(boundary));
                self.allocated = boundary;
                Err(e)
            }
        }
    }

    fn write_frame_inner(&mut self, frame: &[u8]) -> std::io::Result<()> {
        self.file.write_all(frame)?;
        self.file.flush()?;
        if self.mode == LogMode::Fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Write the sealing marker and trim the preallocated tail.
    pub fn seal(&mut self) -> std::io::Result<()> {
        if self.sealed {
            return Ok(());
        }
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u32_le(SEAL_MARKER);
        self.file.write_all(&buf)?;
        self.len += 4;
        self.file.set_len(self.len)?;
        self.file.flush()?;
        self.file.sync_data()?;
        self.sealed = true;
        Ok(())
    }
}

/// What a sequential read of a segment found.
pub struct SegmentContents {
    pub header: SegmentHeader,
    pub batches: Vec<Vec<Row>>,
    /// Whether the sealing marker was present.
    pub sealed: bool,
    /// Whether the file ended in the middle of a frame.
    pub torn: bool,
}

/// Read side of a segment.
pub struct SegmentReader {
    reader: BufReader<File>,
    header: SegmentHeader,
    /// Real data length (preallocated tail excluded is not knowable; EOF on
    /// a zeroed tail reads as a torn frame, which recovery treats the same).
    done: bool,
    sealed: bool,
    torn: bool,
}

impl SegmentReader {
    pub fn open(path: &Path) -> Result<SegmentReader> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(|_| {
            Error::Recovery(format!("segment {:?} is too short for a header", path))
        })?;
        if u32::from_le_bytes(magic) != SEGMENT_MAGIC {
            return Err(Error::Recovery(format!("segment {:?} has a bad magic", path)));
        }
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut header_buf = vec![0u8; len];
        reader.read_exact(&mut header_buf)?;
        let header: SegmentHeader = bincode::deserialize(&header_buf)
            .map_err(|e| Error::Recovery(format!("segment {:?} header: {}", path, e)))?;
        if header.version != SEGMENT_VERSION {
            return Err(Error::Recovery(format!(
                "segment {:?} has unsupported version {}",
                path, header.version
            )));
        }
        Ok(SegmentReader {
            reader,
            header,
            done: false,
            sealed: false,
            torn: false,
        })
    }

    pub fn header(&self) -> &SegmentHeader {
        &self.header
    }

    /// Whether the sealing marker was reached. Meaningful once `next_batch`
    /// returned `None`.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Whether the file ended mid-frame. Meaningful once `next_batch`
    /// returned `None`.
    pub fn is_torn(&self) -> bool {
        self.torn
    }

    /// Next complete batch, or `None` at the end of readable data. A torn
    /// tail also ends the stream; check `is_sealed` to tell the cases apart.
    pub fn next_batch(&mut self) -> Result<Option<Vec<Row>>> {
        if self.done {
            return Ok(None);
        }
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.done = true;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_buf);
        if len == SEAL_MARKER {
            self.done = true;
            self.sealed = true;
            return Ok(None);
        }
        // A zeroed preallocated tail reads as a zero-length frame.
        if len == 0 {
            self.done = true;
            return Ok(None);
        }
        let mut batch_buf = vec![0u8; len as usize];
        match self.reader.read_exact(&mut batch_buf) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.done = true;
                self.torn = true;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        match bincode::deserialize::<Vec<Row>>(&batch_buf) {
            Ok(rows) => Ok(Some(rows)),
            Err(_) => {
                // A frame that doesn't decode is a torn or zero-filled tail.
                self.done = true;
                self.torn = true;
                Ok(None)
            }
        }
    }

    /// Drain the whole segment.
    pub fn read_all(mut self) -> Result<SegmentContents> {
        let mut batches = Vec::new();
        while let Some(batch) = self.next_batch()? {
            batches.push(batch);
        }
        Ok(SegmentContents {
            sealed: self.sealed,
            torn: self.torn,
            header: self.header,
            batches,
        })
    }
}
