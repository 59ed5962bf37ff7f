//! Backup archive framing.
//!
//! Layout: the 8-byte magic, then entries of
//! `tag:u8 | name_len:u32 LE | name | payload_len:u64 LE | payload`,
//! then a single end tag. Names are relative `/`-separated paths.
//!
//! The writer hashes every byte it emits, so size and checksum of the whole
//! archive are known the moment it is finished, without reading it back.

use crate::core::{Result, StateError};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

const ARCHIVE_MAGIC: &[u8; 8] = b"DOCSARC1";
const ENTRY_FILE: u8 = 0x01;
const ENTRY_END: u8 = 0xFF;
const MAX_ENTRY_NAME_LEN: usize = 4096;

/// Archive entry holding the provisional metadata document.
pub const METADATA_ENTRY: &str = "metadata.json";

/// Size and digest of a finished archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub size: u64,
    pub checksum: String,
}

/// Pass-through writer that tracks the SHA-256 and length of what it writes.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub fn finish(self) -> (W, ArchiveSummary) {
        let summary = ArchiveSummary {
            size: self.written,
            checksum: hex::encode(self.hasher.finalize()),
        };
        (self.inner, summary)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ============================================================================
// Writer
// ============================================================================

pub struct ArchiveWriter<W: Write> {
    out: HashingWriter<W>,
    entries: usize,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(inner: W) -> Result<Self> {
        let mut out = HashingWriter::new(inner);
        out.write_all(ARCHIVE_MAGIC)?;
        Ok(Self { out, entries: 0 })
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn add_bytes(&mut self, name: &str, payload: &[u8]) -> Result<()> {
        self.write_header(name, payload.len() as u64)?;
        self.out.write_all(payload)?;
        Ok(())
    }

    /// Streams a file into the archive. Fails if the file changes length while
    /// it is being copied.
    pub fn add_file(&mut self, name: &str, path: &Path) -> Result<u64> {
        let mut file = fs::File::open(path)?;
        let expected = file.metadata()?.len();
        self.write_header(name, expected)?;
        let copied = io::copy(&mut (&mut file).take(expected), &mut self.out)?;
        if copied != expected {
            return Err(StateError::Io(format!(
                "{} shrank while archiving ({} of {} bytes)",
                path.display(),
                copied,
                expected
            )));
        }
        Ok(copied)
    }

    /// Writes the end marker and returns the inner writer with the archive summary.
    pub fn finish(mut self) -> Result<(W, ArchiveSummary)> {
        self.out.write_all(&[ENTRY_END])?;
        self.out.flush()?;
        Ok(self.out.finish())
    }

    fn write_header(&mut self, name: &str, payload_len: u64) -> Result<()> {
        validate_entry_name(name)?;
        let name_len = name.len() as u32;
        self.out.write_all(&[ENTRY_FILE])?;
        self.out.write_all(&name_len.to_le_bytes())?;
        self.out.write_all(name.as_bytes())?;
        self.out.write_all(&payload_len.to_le_bytes())?;
        self.entries += 1;
        Ok(())
    }
}

// ============================================================================
// Reader
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub name: String,
    pub size: u64,
}

/// Sequential reader over an archive produced by [`ArchiveWriter`].
pub struct ArchiveReader<R: Read> {
    reader: R,
    unread: u64,
    finished: bool,
}

impl<R: Read> ArchiveReader<R> {
    pub fn open(mut reader: R) -> Result<Self> {
        let mut magic = [0u8; 8];
        read_exact(&mut reader, &mut magic)?;
        if &magic != ARCHIVE_MAGIC {
            return Err(StateError::CorruptRecord("not a backup archive (bad magic)".to_string()));
        }
        Ok(Self {
            reader,
            unread: 0,
            finished: false,
        })
    }

    /// Advances to the next entry, skipping whatever is left of the current one.
    pub fn next_entry(&mut self) -> Result<Option<EntryHeader>> {
        if self.finished {
            return Ok(None);
        }
        self.skip_payload()?;

        let mut tag = [0u8; 1];
        read_exact(&mut self.reader, &mut tag)?;
        match tag[0] {
            ENTRY_END => {
                self.finished = true;
                return Ok(None);
            }
            ENTRY_FILE => {}
            other => {
                return Err(StateError::CorruptRecord(format!("unknown archive entry tag 0x{:02x}", other)));
            }
        }

        let mut len = [0u8; 4];
        read_exact(&mut self.reader, &mut len)?;
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_ENTRY_NAME_LEN {
            return Err(StateError::CorruptRecord(format!("archive entry name length {} is implausible", len)));
        }
        let mut name = vec![0u8; len];
        read_exact(&mut self.reader, &mut name)?;
        let name = String::from_utf8(name)
            .map_err(|_| StateError::CorruptRecord("archive entry name is not utf-8".to_string()))?;
        validate_entry_name(&name).map_err(|e| StateError::CorruptRecord(e.to_string()))?;

        let mut size = [0u8; 8];
        read_exact(&mut self.reader, &mut size)?;
        let size = u64::from_le_bytes(size);
        self.unread = size;
        Ok(Some(EntryHeader { name, size }))
    }

    /// Copies the current entry's payload into `out`.
    pub fn copy_payload<W: Write>(&mut self, out: &mut W) -> Result<u64> {
        let expected = self.unread;
        let copied = io::copy(&mut (&mut self.reader).take(expected), out)?;
        self.unread = 0;
        if copied != expected {
            return Err(truncated());
        }
        Ok(copied)
    }

    pub fn read_payload(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.unread.min(1 << 20) as usize);
        self.copy_payload(&mut out)?;
        Ok(out)
    }

    pub fn list(mut self) -> Result<Vec<EntryHeader>> {
        let mut headers = Vec::new();
        while let Some(header) = self.next_entry()? {
            headers.push(header);
        }
        Ok(headers)
    }

    /// Extracts every entry below `dir`, which must be empty or absent.
    pub fn extract_all(mut self, dir: &Path) -> Result<Vec<String>> {
        if dir.exists() && fs::read_dir(dir)?.next().is_some() {
            return Err(StateError::InvalidInput(format!(
                "extract target {} must be empty",
                dir.display()
            )));
        }
        fs::create_dir_all(dir)?;
        let base = fs::canonicalize(dir)?;

        let mut names = Vec::new();
        while let Some(header) = self.next_entry()? {
            let target = resolve_output_path(&base, &header.name)?;
            let mut file = fs::File::create(&target)?;
            self.copy_payload(&mut file)?;
            file.sync_all()?;
            names.push(header.name);
        }
        Ok(names)
    }

    fn skip_payload(&mut self) -> Result<()> {
        if self.unread > 0 {
            self.copy_payload(&mut io::sink())?;
        }
        Ok(())
    }
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => truncated(),
        _ => e.into(),
    })
}

fn truncated() -> StateError {
    StateError::CorruptRecord("backup archive is truncated".to_string())
}

/// Entry names must be non-empty relative paths made only of normal components.
pub fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StateError::InvalidInput("archive entry name must not be empty".to_string()));
    }
    if name.len() > MAX_ENTRY_NAME_LEN {
        return Err(StateError::InvalidInput(format!(
            "archive entry name is longer than {} bytes",
            MAX_ENTRY_NAME_LEN
        )));
    }
    if name.contains('\\') {
        return Err(StateError::InvalidInput(format!(
            "archive entry name must not contain backslashes: {}",
            name
        )));
    }
    let normal = name
        .split('/')
        .all(|segment| matches!(Path::new(segment).components().next(), Some(Component::Normal(_))));
    if !normal {
        return Err(StateError::InvalidInput(format!(
            "archive entry name contains a disallowed path component: {}",
            name
        )));
    }
    Ok(())
}

fn resolve_output_path(base: &Path, name: &str) -> Result<PathBuf> {
    let out = base.join(name);
    let parent = out
        .parent()
        .ok_or_else(|| StateError::InvalidInput(format!("archive entry {} has no parent", name)))?;
    fs::create_dir_all(parent)?;
    if !fs::canonicalize(parent)?.starts_with(base) {
        return Err(StateError::CorruptRecord(format!(
            "archive entry {} escapes the extract directory",
            name
        )));
    }
    Ok(out)
}
