//! Raw byte-stream access to the protected file.
//!
//! The integrity engine talks to storage through the [`RawStream`] trait so
//! tests (and other backends) can stand in for a real file. [`FileStream`]
//! is the disk-backed implementation.

use crate::error::{Result, VeristreamError};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Primitive byte-stream operations consumed by the integrity engine.
pub trait RawStream {
    fn tell(&mut self) -> Result<u64>;
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn sync(&mut self) -> Result<()>;
    fn file_size(&mut self) -> Result<u64>;
}

/// Capability requested when opening a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

impl OpenMode {
    pub fn writable(self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::ReadWrite)
    }

    pub fn readable(self) -> bool {
        matches!(self, OpenMode::Read | OpenMode::ReadWrite)
    }
}

/// Flags for write-capable opens.
///
/// `append` is positioning policy, not an OS open flag: the integrity
/// engine targets end-of-file itself so it can still rewrite earlier
/// blocks at their own offsets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub create: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    fn validate(self, mode: OpenMode) -> Result<()> {
        if !mode.writable() && (self.create || self.truncate || self.append) {
            return Err(VeristreamError::UnsupportedFlags(
                "create/truncate/append require a write-capable open".to_string(),
            ));
        }
        if self.truncate && self.append {
            return Err(VeristreamError::UnsupportedFlags(
                "truncate and append are mutually exclusive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Disk-backed stream over a protected file.
///
/// Write-capable modes open the file readable as well: flushing a partial
/// block requires reading the bytes already on disk.
pub struct FileStream {
    file: File,
    path: PathBuf,
}

impl FileStream {
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode, flags: OpenFlags) -> Result<Self> {
        flags.validate(mode)?;

        let mut options = OpenOptions::new();
        options.read(true);
        if mode.writable() {
            options
                .write(true)
                .create(flags.create)
                .truncate(flags.truncate);
        }
        let file = options.open(&path)?;

        Ok(FileStream {
            file,
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RawStream for FileStream {
    fn tell(&mut self) -> Result<u64> {
        Ok(self.file.stream_position()?)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.file.seek(pos)?)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf)?)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        Ok(self.file.write(buf)?)
    }

    fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn file_size(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

/// Read until `buf` is full or the stream ends; returns bytes read.
pub(crate) fn read_full<S: RawStream>(stream: &mut S, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Write all of `data`, surfacing a zero-length write as an error.
pub(crate) fn write_all<S: RawStream>(stream: &mut S, data: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < data.len() {
        let n = stream.write(&data[written..])?;
        if n == 0 {
            return Err(VeristreamError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "stream refused to accept more bytes",
            )));
        }
        written += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_write_then_read_back() {
        let temp = NamedTempFile::new().unwrap();
        let mut stream = FileStream::open(
            temp.path(),
            OpenMode::ReadWrite,
            OpenFlags::default(),
        )
        .unwrap();

        stream.write(b"hello stream").unwrap();
        assert_eq!(stream.tell().unwrap(), 12);
        assert_eq!(stream.file_size().unwrap(), 12);

        stream.seek(SeekFrom::Start(6)).unwrap();
        let mut buf = [0u8; 6];
        assert_eq!(stream.read(&mut buf).unwrap(), 6);
        assert_eq!(&buf, b"stream");
    }

    #[test]
    fn test_truncate_flag() {
        let temp = NamedTempFile::new().unwrap();
        std::fs::write(temp.path(), b"old content").unwrap();

        let mut stream = FileStream::open(
            temp.path(),
            OpenMode::Write,
            OpenFlags {
                truncate: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(stream.file_size().unwrap(), 0);
    }

    #[test]
    fn test_read_mode_rejects_write_flags() {
        let temp = NamedTempFile::new().unwrap();
        let result = FileStream::open(
            temp.path(),
            OpenMode::Read,
            OpenFlags {
                create: true,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(VeristreamError::UnsupportedFlags(_))));
    }

    #[test]
    fn test_truncate_append_conflict() {
        let temp = NamedTempFile::new().unwrap();
        let result = FileStream::open(
            temp.path(),
            OpenMode::Write,
            OpenFlags {
                truncate: true,
                append: true,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(VeristreamError::UnsupportedFlags(_))));
    }

    #[test]
    fn test_open_missing_without_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileStream::open(
            dir.path().join("absent.bin"),
            OpenMode::Write,
            OpenFlags::default(),
        );
        assert!(matches!(result, Err(VeristreamError::Io(_))));
    }
}
