//! Append-only framed record files.
//!
//! Each record is stored as `u32 size | payload | u32 size` (big-endian) so
//! scans can run in either direction. When the active file outgrows
//! `target_log_size` its content rotates into a numbered `.arc` segment
//! beside it; scans stitch segments and the active file back together in
//! write order.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use parking_lot::Mutex;
use tracing::warn;

use crate::core::errors::Result;
use crate::log::record::MAX_RECORD_BYTES;

/// Bytes added to every payload by the leading and trailing size words.
pub const FRAME_OVERHEAD: u64 = 8;

/// One log file plus its archival lineage. The descriptor mutex serializes
/// positional writes; archival runs under the same mutex so appends never
/// interleave with rotation.
#[derive(Debug)]
pub struct LogFile {
    path: PathBuf,
    fd: Mutex<File>,
}

impl LogFile {
    /// Open for durable read-write, creating the file if missing. A torn
    /// trailing frame from a previous crash is truncated away.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut fd = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let valid = scan_valid_len(&mut fd)?;
        let len = fd.metadata()?.len();
        if valid < len {
            warn!(path = %path.display(), from = valid, to = len, "truncating torn log tail");
            fd.set_len(valid)?;
            fd.sync_data()?;
        }
        Ok(Self { path, fd: Mutex::new(fd) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one framed payload. Durability is deferred to [`LogFile::sync`]
    /// so a flush batch pays for one sync.
    pub fn append_framed(&self, payload: &[u8]) -> Result<u64> {
        let size = (payload.len() as u32).to_be_bytes();
        let mut fd = self.fd.lock();
        let end = fd.seek(SeekFrom::End(0))?;
        let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD as usize);
        frame.extend_from_slice(&size);
        frame.extend_from_slice(payload);
        frame.extend_from_slice(&size);
        fd.write_all(&frame)?;
        Ok(end + frame.len() as u64)
    }

    pub fn sync(&self) -> Result<()> {
        self.fd.lock().sync_data()?;
        Ok(())
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.fd.lock().metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Rotate the current content into the next `.arc` segment and truncate
    /// the active file. Records written afterwards carry higher LSNs, so
    /// segment order equals LSN order. The segment is written under a
    /// temporary name and renamed into place, so concurrent scans never see
    /// a half-written segment.
    pub fn archive(&self) -> Result<PathBuf> {
        let mut fd = self.fd.lock();
        let seq = next_segment_seq(&self.path)?;
        let segment_path = segment_path(&self.path, seq);
        let staging_path = segment_path.with_extension("arc.tmp");
        fd.seek(SeekFrom::Start(0))?;
        let mut content = Vec::new();
        fd.read_to_end(&mut content)?;
        let mut segment = File::create(&staging_path)?;
        segment.write_all(&content)?;
        segment.sync_all()?;
        std::fs::rename(&staging_path, &segment_path)?;
        fd.set_len(0)?;
        fd.sync_data()?;
        Ok(segment_path)
    }

    /// Archive segments for a log path, oldest first.
    pub fn segments(path: &Path) -> Result<Vec<PathBuf>> {
        let Some(dir) = path.parent() else {
            return Ok(Vec::new());
        };
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(Vec::new());
        };
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut seqs = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if let Some(seq) = parse_segment_name(name, file_name) {
                seqs.push(seq);
            }
        }
        seqs.sort_unstable();
        Ok(seqs.into_iter().map(|s| segment_path(path, s)).collect())
    }
}

fn segment_path(path: &Path, seq: u64) -> PathBuf {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("log");
    path.with_file_name(format!("{name}.{seq}.arc"))
}

fn parse_segment_name(base: &str, candidate: &str) -> Option<u64> {
    let rest = candidate.strip_prefix(base)?.strip_prefix('.')?;
    let seq = rest.strip_suffix(".arc")?;
    seq.parse().ok()
}

fn next_segment_seq(path: &Path) -> Result<u64> {
    let existing = LogFile::segments(path)?;
    let last = existing
        .iter()
        .filter_map(|p| p.file_name()?.to_str())
        .filter_map(|n| {
            let base = path.file_name()?.to_str()?;
            parse_segment_name(base, n)
        })
        .max();
    Ok(last.map(|s| s + 1).unwrap_or(1))
}

/// Walk frames forward and report the length of the valid prefix.
fn scan_valid_len(fd: &mut File) -> Result<u64> {
    let len = fd.metadata()?.len();
    let mut pos = 0u64;
    fd.seek(SeekFrom::Start(0))?;
    loop {
        if pos + FRAME_OVERHEAD > len {
            return Ok(pos);
        }
        let size = fd.read_u32::<BigEndian>()? as u64;
        if size > MAX_RECORD_BYTES as u64 || pos + FRAME_OVERHEAD + size > len {
            return Ok(pos);
        }
        fd.seek(SeekFrom::Current(size as i64))?;
        let mut suffix = [0u8; 4];
        fd.read_exact(&mut suffix)?;
        if BigEndian::read_u32(&suffix) as u64 != size {
            return Ok(pos);
        }
        pos += FRAME_OVERHEAD + size;
    }
}
