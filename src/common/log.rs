//! Append-only framed record log
//!
//! Shared by the procedure store and the region-state table.
//! Frame format: [MAGIC][SEQUENCE][KIND][KEY][PAYLOAD_LEN][PAYLOAD][CRC32]
//!
//! Replay stops at the first torn or corrupted frame; everything before it is
//! returned. `rewrite` replaces the log with a compacted set of frames.

use crate::common::{crc32, Error, Result, WalSyncPolicy};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const LOG_MAGIC: [u8; 4] = [0x52, 0x4D, 0x4C, 0x31]; // "RML1"
const HEADER_LEN: usize = 4 + 8 + 1 + 8 + 4;
const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// A single frame read back from the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub sequence: u64,
    pub kind: u8,
    pub key: u64,
    pub payload: Vec<u8>,
}

fn encode_frame(out: &mut Vec<u8>, sequence: u64, kind: u8, key: u64, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::Wal(format!(
            "payload too large: {} bytes",
            payload.len()
        )));
    }

    let start = out.len();
    out.extend_from_slice(&LOG_MAGIC);
    out.extend_from_slice(&sequence.to_le_bytes());
    out.push(kind);
    out.extend_from_slice(&key.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);

    // Checksum covers everything after the magic
    let checksum = crc32(&out[start + 4..]);
    out.extend_from_slice(&checksum.to_le_bytes());
    Ok(())
}

pub struct RecordLog {
    path: PathBuf,
    writer: BufWriter<File>,
    next_sequence: u64,
    sync_policy: WalSyncPolicy,
}

impl RecordLog {
    /// Open or create the log, continuing after the last valid sequence
    pub fn open(path: impl AsRef<Path>, sync_policy: WalSyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut next_sequence = 0;
        let mut valid_len = 0u64;
        Self::scan(&path, |record, end| {
            next_sequence = next_sequence.max(record.sequence + 1);
            valid_len = end;
            Ok(())
        })?;

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)?;

        // Drop a torn tail so new frames are not appended behind garbage
        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                "Truncating torn tail of {} at offset {}",
                path.display(),
                valid_len
            );
            file.set_len(valid_len)?;
        }

        let mut file = file;
        std::io::Seek::seek(&mut file, std::io::SeekFrom::End(0))?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
            next_sequence,
            sync_policy,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    /// Append one frame and sync per policy. Returns the frame's sequence.
    pub fn append(&mut self, kind: u8, key: u64, payload: &[u8]) -> Result<u64> {
        let sequence = self.write_frame(kind, key, payload)?;
        self.maybe_sync()?;
        Ok(sequence)
    }

    /// Append several frames with a single write and sync. The whole batch
    /// is encoded first, so a bad frame leaves nothing behind.
    pub fn append_all<'a, I>(&mut self, frames: I) -> Result<u64>
    where
        I: IntoIterator<Item = (u8, u64, &'a [u8])>,
    {
        let mut batch = Vec::new();
        let mut sequence = self.next_sequence;
        for (kind, key, payload) in frames {
            encode_frame(&mut batch, sequence, kind, key, payload)?;
            sequence += 1;
        }
        if batch.is_empty() {
            return Ok(self.next_sequence);
        }

        self.writer.write_all(&batch)?;
        let last = sequence - 1;
        self.next_sequence = sequence;
        self.maybe_sync()?;
        Ok(last)
    }

    fn write_frame(&mut self, kind: u8, key: u64, payload: &[u8]) -> Result<u64> {
        let sequence = self.next_sequence;
        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
        encode_frame(&mut frame, sequence, kind, key, payload)?;

        self.writer.write_all(&frame)?;
        self.next_sequence += 1;
        Ok(sequence)
    }

    fn maybe_sync(&mut self) -> Result<()> {
        match self.sync_policy {
            WalSyncPolicy::Always => {
                self.writer.flush()?;
                self.writer.get_ref().sync_data()?;
            }
            WalSyncPolicy::Interval => {
                self.writer.flush()?;
            }
            WalSyncPolicy::Never => {}
        }
        Ok(())
    }

    /// Force everything buffered to disk
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Replay every valid frame in order
    pub fn replay<F>(path: impl AsRef<Path>, mut callback: F) -> Result<()>
    where
        F: FnMut(LogRecord) -> Result<()>,
    {
        Self::scan(path.as_ref(), |record, _| callback(record))
    }

    fn scan<F>(path: &Path, mut callback: F) -> Result<()>
    where
        F: FnMut(LogRecord, u64) -> Result<()>,
    {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut offset = 0u64;

        loop {
            match Self::read_frame(&mut reader) {
                Ok(Some((record, len))) => {
                    offset += len as u64;
                    callback(record, offset)?;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Log replay of {} stopped: {}", path.display(), e);
                    break;
                }
            }
        }

        Ok(())
    }

    fn read_frame<R: Read>(reader: &mut R) -> Result<Option<(LogRecord, usize)>> {
        let mut header = [0u8; HEADER_LEN];
        match reader.read_exact(&mut header[..4]) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if header[..4] != LOG_MAGIC {
            return Err(Error::Wal("Invalid log magic".into()));
        }

        reader.read_exact(&mut header[4..])?;
        let sequence = u64::from_le_bytes(read_array(&header[4..12]));
        let kind = header[12];
        let key = u64::from_le_bytes(read_array(&header[13..21]));
        let len = u32::from_le_bytes(read_array(&header[21..25])) as usize;

        if len > MAX_PAYLOAD {
            return Err(Error::Wal(format!("frame length {} out of range", len)));
        }

        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header[4..]);
        hasher.update(&payload);
        if hasher.finalize() != stored {
            return Err(Error::Wal("Checksum mismatch".into()));
        }

        Ok(Some((
            LogRecord {
                sequence,
                kind,
                key,
                payload,
            },
            HEADER_LEN + len + 4,
        )))
    }

    /// Atomically replace the log contents with `frames` (compaction)
    pub fn rewrite<'a, I>(&mut self, frames: I) -> Result<()>
    where
        I: IntoIterator<Item = (u8, u64, &'a [u8])>,
    {
        self.writer.flush()?;

        let tmp_path = self.path.with_extension("compact");
        let tmp = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut compacted = RecordLog {
            path: tmp_path.clone(),
            writer: BufWriter::new(tmp),
            next_sequence: self.next_sequence,
            sync_policy: self.sync_policy,
        };
        for (kind, key, payload) in frames {
            compacted.write_frame(kind, key, payload)?;
        }
        compacted.sync()?;
        let next_sequence = compacted.next_sequence;
        drop(compacted);

        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.next_sequence = next_sequence;

        Ok(())
    }
}

fn read_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}
