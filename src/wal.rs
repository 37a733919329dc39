//! Framed, checksummed record logs. Every store keeps its state as one of these.
//!
//! A frame is `[u32 le: payload len][bincode payload][u32 le: crc32 of payload]`.
//! Replay keeps the longest valid prefix, so a write torn by a crash only
//! loses the frame it was writing.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::limits::MAX_WAL_FRAME_BYTES;

fn write_frame<E: Serialize>(out: &mut impl Write, record: &E) -> io::Result<()> {
    let payload =
        bincode::serialize(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_WAL_FRAME_BYTES {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "WAL record too large"));
    }
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// `Ok(None)` at a clean end of file and at any torn or corrupt tail.
fn read_frame(input: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let Some(len) = read_u32(input)? else {
        return Ok(None);
    };
    let len = len as usize;
    if len > MAX_WAL_FRAME_BYTES {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !fill(input, &mut payload)? {
        return Ok(None);
    }
    match read_u32(input)? {
        Some(crc) if crc == crc32fast::hash(&payload) => Ok(Some(payload)),
        _ => Ok(None),
    }
}

fn read_u32(input: &mut impl Read) -> io::Result<Option<u32>> {
    let mut buf = [0u8; 4];
    Ok(fill(input, &mut buf)?.then(|| u32::from_le_bytes(buf)))
}

/// False when the input ends before `buf` is full.
fn fill(input: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match input.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn compact_path(path: &Path) -> PathBuf {
    path.with_extension("wal.tmp")
}

fn open_for_append(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

/// An open log of `E` records. Owned by exactly one writer task.
pub struct Wal<E> {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
    _record: PhantomData<fn(E)>,
}

impl<E: Serialize + DeserializeOwned> Wal<E> {
    pub fn open(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            writer: open_for_append(path)?,
            path: path.to_path_buf(),
            appends_since_compact: 0,
            _record: PhantomData,
        })
    }

    #[cfg(test)]
    pub fn append(&mut self, record: &E) -> io::Result<()> {
        self.append_buffered(record)?;
        self.flush_sync()
    }

    /// Not durable until the next `flush_sync`.
    pub fn append_buffered(&mut self, record: &E) -> io::Result<()> {
        write_frame(&mut self.writer, record)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `records` to the side file that `swap_compact_file` installs.
    pub fn write_compact_file(path: &Path, records: &[E]) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(compact_path(path))?);
        for record in records {
            write_frame(&mut out, record)?;
        }
        out.flush()?;
        out.get_ref().sync_all()
    }

    /// Rename the side file over the log and keep appending to the new file.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(compact_path(&self.path), &self.path)?;
        self.writer = open_for_append(&self.path)?;
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every record up to the first torn, corrupt or undecodable frame.
    /// A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<E>> {
        let mut input = match File::open(path) {
            Ok(f) => BufReader::new(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut records = Vec::new();
        while let Some(payload) = read_frame(&mut input)? {
            match bincode::deserialize(&payload) {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }
        Ok(records)
    }
}
