//! Restartable lazy scans over a persisted log: archive segments plus the
//! active file, forward or reverse.
//!
//! Iterators snapshot each file's length at creation, so concurrent
//! appenders never perturb a scan in flight. Dropping an iterator closes its
//! file handles.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt};

use crate::core::errors::{Result, StorageError};
use crate::log::record::{LogRecord, MAX_RECORD_BYTES};
use crate::log::store::{LogFile, FRAME_OVERHEAD};

struct Segment {
    file: File,
    /// End of file at iterator creation.
    end: u64,
    pos: u64,
}

fn open_segments(path: &Path) -> Result<Vec<Segment>> {
    let mut paths: Vec<PathBuf> = LogFile::segments(path)?;
    if path.exists() {
        paths.push(path.to_path_buf());
    }
    let mut segments = Vec::with_capacity(paths.len());
    for p in paths {
        let file = File::open(&p)?;
        let end = file.metadata()?.len();
        segments.push(Segment { file, end, pos: 0 });
    }
    Ok(segments)
}

/// Forward scan: archive segments oldest-first, then the active file.
pub struct ForwardLogIterator {
    segments: Vec<Segment>,
    current: usize,
}

impl ForwardLogIterator {
    pub fn new(path: &Path) -> Result<Self> {
        Ok(Self { segments: open_segments(path)?, current: 0 })
    }

    fn read_next(&mut self) -> Result<Option<LogRecord>> {
        loop {
            let Some(segment) = self.segments.get_mut(self.current) else {
                return Ok(None);
            };
            if segment.pos + FRAME_OVERHEAD > segment.end {
                self.current += 1;
                continue;
            }
            segment.file.seek(SeekFrom::Start(segment.pos))?;
            let size = segment.file.read_u32::<BigEndian>()? as u64;
            if size > MAX_RECORD_BYTES as u64 || segment.pos + FRAME_OVERHEAD + size > segment.end {
                return Err(StorageError(format!(
                    "corrupt log frame at offset {}",
                    segment.pos
                ))
                .into());
            }
            let mut payload = vec![0u8; size as usize];
            segment.file.read_exact(&mut payload)?;
            let suffix = segment.file.read_u32::<BigEndian>()? as u64;
            if suffix != size {
                return Err(StorageError(format!(
                    "frame suffix {suffix} does not match prefix {size} at offset {}",
                    segment.pos
                ))
                .into());
            }
            segment.pos += FRAME_OVERHEAD + size;
            return Ok(Some(LogRecord::decode(&payload)?));
        }
    }
}

impl Iterator for ForwardLogIterator {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

/// Reverse scan: the active file newest-first, then archive segments
/// newest-first.
pub struct BackwardLogIterator {
    segments: Vec<Segment>,
    current: usize,
}

impl BackwardLogIterator {
    pub fn new(path: &Path) -> Result<Self> {
        let mut segments = open_segments(path)?;
        segments.reverse();
        for segment in &mut segments {
            segment.pos = segment.end;
        }
        Ok(Self { segments, current: 0 })
    }

    fn read_prev(&mut self) -> Result<Option<LogRecord>> {
        loop {
            let Some(segment) = self.segments.get_mut(self.current) else {
                return Ok(None);
            };
            if segment.pos < FRAME_OVERHEAD {
                self.current += 1;
                continue;
            }
            segment.file.seek(SeekFrom::Start(segment.pos - 4))?;
            let size = segment.file.read_u32::<BigEndian>()? as u64;
            if size > MAX_RECORD_BYTES as u64 || segment.pos < FRAME_OVERHEAD + size {
                return Err(StorageError(format!(
                    "corrupt log frame suffix at offset {}",
                    segment.pos
                ))
                .into());
            }
            let start = segment.pos - FRAME_OVERHEAD - size;
            segment.file.seek(SeekFrom::Start(start))?;
            let prefix = segment.file.read_u32::<BigEndian>()? as u64;
            if prefix != size {
                return Err(StorageError(format!(
                    "frame prefix {prefix} does not match suffix {size} at offset {start}"
                ))
                .into());
            }
            let mut payload = vec![0u8; size as usize];
            segment.file.read_exact(&mut payload)?;
            segment.pos = start;
            return Ok(Some(LogRecord::decode(&payload)?));
        }
    }
}

impl Iterator for BackwardLogIterator {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_prev().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::LogData;
    use tempfile::tempdir;

    fn record(lsn: u64) -> LogRecord {
        LogRecord {
            lsn,
            timestamp: lsn,
            body: LogData::Commit { tx: lsn },
        }
    }

    fn write_all(file: &LogFile, lsns: &[u64]) {
        for lsn in lsns {
            file.append_framed(&record(*lsn).encode()).unwrap();
        }
        file.sync().unwrap();
    }

    #[test]
    fn forward_equals_reversed_backward() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("active.log");
        let file = LogFile::open(&path).unwrap();
        write_all(&file, &[1, 2, 3, 4, 5]);

        let forward: Vec<u64> = ForwardLogIterator::new(&path)
            .unwrap()
            .map(|r| r.unwrap().lsn)
            .collect();
        let mut backward: Vec<u64> = BackwardLogIterator::new(&path)
            .unwrap()
            .map(|r| r.unwrap().lsn)
            .collect();
        backward.reverse();
        assert_eq!(forward, vec![1, 2, 3, 4, 5]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn scans_stitch_archived_segments_in_lsn_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("active.log");
        let file = LogFile::open(&path).unwrap();
        write_all(&file, &[1, 2]);
        file.archive().unwrap();
        write_all(&file, &[3, 4]);
        file.archive().unwrap();
        write_all(&file, &[5]);

        let forward: Vec<u64> = ForwardLogIterator::new(&path)
            .unwrap()
            .map(|r| r.unwrap().lsn)
            .collect();
        assert_eq!(forward, vec![1, 2, 3, 4, 5]);

        let backward: Vec<u64> = BackwardLogIterator::new(&path)
            .unwrap()
            .map(|r| r.unwrap().lsn)
            .collect();
        assert_eq!(backward, vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn iterator_snapshots_end_of_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("active.log");
        let file = LogFile::open(&path).unwrap();
        write_all(&file, &[1, 2]);

        let iter = ForwardLogIterator::new(&path).unwrap();
        write_all(&file, &[3]);
        let seen: Vec<u64> = iter.map(|r| r.unwrap().lsn).collect();
        assert_eq!(seen, vec![1, 2]);
    }

    #[test]
    fn empty_log_yields_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("active.log");
        LogFile::open(&path).unwrap();
        assert_eq!(ForwardLogIterator::new(&path).unwrap().count(), 0);
        assert_eq!(BackwardLogIterator::new(&path).unwrap().count(), 0);
    }
}
