//! Reads committed mutations back off a replica's private log.
//!
//! Private log files are named `log.<index>.<start_offset>`, where `index`
//! is a monotonically increasing file sequence number and `start_offset` is
//! the byte offset the whole log stream had reached when this file was
//! opened for writing. A block is one length-prefixed, CRC-framed mutation
//! record; [`LogReader::replay_block`] decodes as many complete records as
//! are currently available starting at its cursor, handing each to a
//! visitor, and leaves the cursor positioned for a later resumed call.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::checksum::crc32;
use crate::error::{DuplicationError, Result};
use crate::types::{Ballot, Decree, Mutation, MutationUpdate};

const BLOCK_MAGIC: u32 = 0x4B44_5550; // "KDUP"

/// One private log file discovered on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileRef {
    pub index: u32,
    pub start_offset: u64,
    pub path: PathBuf,
}

/// Parses a `log.<index>.<start_offset>` file name.
pub fn parse_log_filename(name: &str) -> Option<(u32, u64)> {
    let mut parts = name.splitn(3, '.');
    if parts.next()? != "log" {
        return None;
    }
    let index: u32 = parts.next()?.parse().ok()?;
    let start_offset: u64 = parts.next()?.parse().ok()?;
    Some((index, start_offset))
}

/// Formats a `log.<index>.<start_offset>` file name.
pub fn format_log_filename(index: u32, start_offset: u64) -> String {
    format!("log.{index}.{start_offset}")
}

/// Lists and parses every private log file directly under `dir`. Entries
/// that don't match the naming convention are ignored rather than treated
/// as an error, matching the tolerant directory scan of the source system.
pub fn list_log_files(dir: &Path) -> Result<Vec<LogFileRef>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if let Some((index, start_offset)) = parse_log_filename(&name) {
            files.push(LogFileRef {
                index,
                start_offset,
                path: entry.path(),
            });
        }
    }
    files.sort_by_key(|f| f.index);
    Ok(files)
}

/// Indexes `files` by their sequence number for fast successor lookup.
pub fn open_log_file_map(files: &[LogFileRef]) -> BTreeMap<u32, LogFileRef> {
    files.iter().cloned().map(|f| (f.index, f)).collect()
}

/// The file with the smallest sequence number, i.e. the oldest log still on
/// disk — where a fresh duplicator with no prior position starts reading.
pub fn find_log_file_with_min_index(files: &[LogFileRef]) -> Option<LogFileRef> {
    files.iter().min_by_key(|f| f.index).cloned()
}

/// The file immediately following `current_index`, if the replica has
/// already rotated to it.
pub fn next_log_file(files: &BTreeMap<u32, LogFileRef>, current_index: u32) -> Option<LogFileRef> {
    files.get(&(current_index + 1)).cloned()
}

/// Serializes `mu` into its on-disk block form.
///
/// Layout: `[MAGIC:u32][decree:i64][ballot:i64][n_updates:u16]
/// {[opcode:i32][tag:u8][len:u32][payload]}*[crc32:u32]`, all integers
/// little-endian. The CRC covers everything preceding it.
pub fn encode_mutation(mu: &Mutation) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&BLOCK_MAGIC.to_le_bytes());
    buf.extend_from_slice(&mu.decree.get().to_le_bytes());
    buf.extend_from_slice(&mu.ballot.get().to_le_bytes());
    buf.extend_from_slice(&(mu.updates.len() as u16).to_le_bytes());
    for update in &mu.updates {
        buf.extend_from_slice(&update.opcode.to_le_bytes());
        buf.push(update.serialization_tag);
        buf.extend_from_slice(&(update.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&update.payload);
    }
    let crc = crc32(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf
}

/// Resumable reader over one private log file.
pub struct LogReader {
    reader: BufReader<File>,
    cursor_offset: u64,
}

impl LogReader {
    /// Opens `path` and seeks to `start_offset`.
    pub fn open(path: &Path, start_offset: u64) -> Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(start_offset))?;
        Ok(Self {
            reader: BufReader::new(file),
            cursor_offset: start_offset,
        })
    }

    /// Byte offset of the next unread block.
    pub fn cursor_offset(&self) -> u64 {
        self.cursor_offset
    }

    /// Decodes as many complete blocks as are currently buffered on disk,
    /// calling `visitor` with each in file order, and advances the cursor
    /// past each one as it's consumed (so a later resumed call starts
    /// exactly where this one left off, even if `visitor` returns an
    /// error partway through).
    ///
    /// # Errors
    ///
    /// - [`DuplicationError::Eof`] once zero bytes remain — the clean,
    ///   expected end of an exhausted file, signalling the caller to check
    ///   for a rotation.
    /// - [`DuplicationError::Corrupt`] if a trailing partial block is
    ///   found (the writer may still be appending it) or a block's CRC
    ///   fails to validate. Either way the caller should wait and retry
    ///   rather than treat the file as done.
    pub fn replay_block(&mut self, mut visitor: impl FnMut(Mutation) -> Result<()>) -> Result<()> {
        loop {
            match self.read_one_block() {
                Ok(Some(mu)) => visitor(mu)?,
                Ok(None) => return Err(DuplicationError::Eof),
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads a single block, returning `Ok(None)` only on a clean,
    /// zero-byte end of file.
    fn read_one_block(&mut self) -> Result<Option<Mutation>> {
        let mut header = [0u8; 4 + 8 + 8 + 2];
        if let Err(e) = self.reader.read_exact(&mut header) {
            return if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Ok(None)
            } else {
                Err(DuplicationError::Io(e))
            };
        }

        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        if magic != BLOCK_MAGIC {
            return Err(DuplicationError::Corrupt(format!(
                "bad block magic {magic:#x} at offset {}",
                self.cursor_offset
            )));
        }
        let decree = i64::from_le_bytes(header[4..12].try_into().unwrap());
        let ballot = i64::from_le_bytes(header[12..20].try_into().unwrap());
        let n_updates = u16::from_le_bytes(header[20..22].try_into().unwrap());

        let mut body = header.to_vec();
        let mut updates = Vec::with_capacity(n_updates as usize);
        for _ in 0..n_updates {
            let mut update_header = [0u8; 4 + 1 + 4];
            if self.read_exact_or_corrupt(&mut update_header)?.is_none() {
                return Err(DuplicationError::Corrupt(format!(
                    "truncated update header at offset {}",
                    self.cursor_offset
                )));
            }
            body.extend_from_slice(&update_header);

            let opcode = i32::from_le_bytes(update_header[0..4].try_into().unwrap());
            let tag = update_header[4];
            let len = u32::from_le_bytes(update_header[5..9].try_into().unwrap()) as usize;

            let mut payload = vec![0u8; len];
            if self.read_exact_or_corrupt(&mut payload)?.is_none() {
                return Err(DuplicationError::Corrupt(format!(
                    "truncated payload at offset {}",
                    self.cursor_offset
                )));
            }
            body.extend_from_slice(&payload);

            updates.push(MutationUpdate {
                opcode,
                serialization_tag: tag,
                payload: payload.into(),
            });
        }

        let mut crc_bytes = [0u8; 4];
        if self.read_exact_or_corrupt(&mut crc_bytes)?.is_none() {
            return Err(DuplicationError::Corrupt(format!(
                "truncated crc at offset {}",
                self.cursor_offset
            )));
        }
        let stored_crc = u32::from_le_bytes(crc_bytes);
        let computed_crc = crc32(&body);
        if stored_crc != computed_crc {
            return Err(DuplicationError::Corrupt(format!(
                "crc mismatch at offset {} (decree {decree})",
                self.cursor_offset
            )));
        }

        self.cursor_offset += (body.len() + 4) as u64;

        Ok(Some(Mutation::new(Decree::from(decree), Ballot::new(ballot), updates)))
    }

    /// Like `read_exact`, but a partial (non-zero, short) read is reported
    /// as `Ok(None)` so the caller can surface it as `Corrupt` rather than
    /// an opaque I/O error — a half-written trailing block looks exactly
    /// like this.
    fn read_exact_or_corrupt(&mut self, buf: &mut [u8]) -> Result<Option<()>> {
        match self.reader.read_exact(buf) {
            Ok(()) => Ok(Some(())),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(DuplicationError::Io(e)),
        }
    }
}
