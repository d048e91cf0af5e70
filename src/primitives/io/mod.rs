#![forbid(unsafe_code)]

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufReader, BufWriter, ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use tracing::trace;

use crate::primitives::bytes::{ReadableChannel, WritableChannel};
use crate::types::{Result, StageError};

const IO_BUFFER: usize = 64 * 1024;

/// Buffered, append-only file channel.
pub struct FileWriteChannel {
    path: PathBuf,
    out: BufWriter<File>,
    written: u64,
}

impl FileWriteChannel {
    /// Creates (or truncates) the file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(StageError::from)?;
        trace!(path = %path.display(), "io.file_write.create");
        Ok(Self {
            path,
            out: BufWriter::with_capacity(IO_BUFFER, file),
            written: 0,
        })
    }

    /// Path backing this channel.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total bytes accepted so far.
    pub fn position(&self) -> u64 {
        self.written
    }

    /// Flushes and closes the file.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        trace!(path = %self.path.display(), bytes = self.written, "io.file_write.close");
        Ok(())
    }

    fn write_all(&mut self, src: &[u8]) -> Result<()> {
        self.out.write_all(src).map_err(StageError::from)?;
        self.written += src.len() as u64;
        Ok(())
    }
}

impl WritableChannel for FileWriteChannel {
    fn put_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])
    }

    fn put_i16(&mut self, v: i16) -> Result<()> {
        self.write_all(&v.to_be_bytes())
    }

    fn put_i32(&mut self, v: i32) -> Result<()> {
        self.write_all(&v.to_be_bytes())
    }

    fn put_i64(&mut self, v: i64) -> Result<()> {
        self.write_all(&v.to_be_bytes())
    }

    fn put_bytes(&mut self, src: &[u8]) -> Result<()> {
        self.write_all(src)
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush().map_err(StageError::from)
    }
}

/// Buffered, forward-only file channel.
pub struct FileReadChannel {
    path: PathBuf,
    inp: BufReader<File>,
}

impl FileReadChannel {
    /// Opens `path` for reading from the start.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(StageError::from)?;
        Ok(Self {
            path,
            inp: BufReader::with_capacity(IO_BUFFER, file),
        })
    }

    /// Path backing this channel.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_exact(&mut self, dst: &mut [u8]) -> Result<()> {
        match self.inp.read_exact(dst) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => Err(StageError::corruption(
                format!("unexpected end of {}", self.path.display()),
            )),
            Err(err) => Err(StageError::from(err)),
        }
    }
}

impl ReadableChannel for FileReadChannel {
    fn get_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn get_i16(&mut self) -> Result<i16> {
        let mut b = [0u8; 2];
        self.read_exact(&mut b)?;
        Ok(i16::from_be_bytes(b))
    }

    fn get_i32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.read_exact(&mut b)?;
        Ok(i32::from_be_bytes(b))
    }

    fn get_i64(&mut self) -> Result<i64> {
        let mut b = [0u8; 8];
        self.read_exact(&mut b)?;
        Ok(i64::from_be_bytes(b))
    }

    fn get_bytes(&mut self, dst: &mut [u8]) -> Result<()> {
        self.read_exact(dst)
    }
}

/// Removes `path`, treating an already-missing file as success.
pub fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("chan.bin");
        let mut w = FileWriteChannel::create(&path).unwrap();
        w.put_i16(-3).unwrap();
        w.put_i64(1 << 40).unwrap();
        w.put_string("mundo").unwrap();
        assert_eq!(w.position(), 2 + 8 + 4 + 5);
        w.close().unwrap();

        let mut r = FileReadChannel::open(&path).unwrap();
        assert_eq!(r.get_i16().unwrap(), -3);
        assert_eq!(r.get_i64().unwrap(), 1 << 40);
        assert_eq!(r.get_string().unwrap(), "mundo");
    }

    #[test]
    fn read_past_eof_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("short.bin");
        let mut w = FileWriteChannel::create(&path).unwrap();
        w.put_u8(1).unwrap();
        w.close().unwrap();

        let mut r = FileReadChannel::open(&path).unwrap();
        let err = r.get_i32().unwrap_err();
        assert!(matches!(err, StageError::Corruption(_)), "{err:?}");
    }

    #[test]
    fn remove_missing_file_is_ok() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent");
        assert!(!remove_if_exists(&path).unwrap());
        fs::write(&path, b"x").unwrap();
        assert!(remove_if_exists(&path).unwrap());
        assert!(!path.exists());
    }
}
