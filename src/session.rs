//! Stream lifecycle management for one protected file.
//!
//! A [`ProtectedFile`] owns the validation metadata and the currently-open
//! concrete stream. It enforces one open stream at a time, matches every
//! open against the one name the metadata protects, and persists the
//! validation file on sync/close. When configuration disables integrity
//! checking, opens fall through to plain file access; the choice is made
//! once, at open time.

use crate::cache::CacheBuffer;
use crate::config::IntegrityConfig;
use crate::crc::ChecksumAlgorithm;
use crate::engine::IntegrityEngine;
use crate::error::{Result, VeristreamError};
use crate::metadata::{initial_checksums, FileChecksums, ValidationFile};
use crate::stream::{FileStream, OpenFlags, OpenMode, RawStream};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default cache size when the caller supplies no buffer, in pages.
pub const DEFAULT_CACHE_PAGES: usize = 16;

enum ActiveStream<'buf> {
    Plain {
        stream: FileStream,
        mode: OpenMode,
    },
    Checked {
        engine: IntegrityEngine<'buf, FileStream>,
        mode: OpenMode,
    },
}

impl ActiveStream<'_> {
    fn mode(&self) -> OpenMode {
        match self {
            ActiveStream::Plain { mode, .. } => *mode,
            ActiveStream::Checked { mode, .. } => *mode,
        }
    }
}

/// One protected file: its validation metadata plus at most one open stream.
pub struct ProtectedFile<'buf> {
    validation: ValidationFile,
    validation_path: PathBuf,
    config: IntegrityConfig,
    stream: Option<ActiveStream<'buf>>,
}

impl<'buf> ProtectedFile<'buf> {
    /// Bootstrap a validation file for `protected_file`.
    ///
    /// If the file already has content, its initial per-block checksums are
    /// computed by reading it block by block; otherwise the checksum list
    /// starts empty.
    pub fn create_validation_file<P, Q>(
        validation_path: P,
        config: &IntegrityConfig,
        protected_file: Q,
        block_length: u32,
        algorithm: ChecksumAlgorithm,
    ) -> Result<()>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let protected_file = protected_file.as_ref();
        if validation_path.as_ref().as_os_str().is_empty() {
            return Err(VeristreamError::EmptyPath);
        }
        let relative_name = protected_file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or(VeristreamError::EmptyPath)?
            .to_string();

        let mut metadata =
            FileChecksums::new(relative_name, protected_file, block_length, algorithm)?;

        if protected_file.exists() {
            let mut stream =
                FileStream::open(protected_file, OpenMode::Read, OpenFlags::default())?;
            metadata.checksums = initial_checksums(&mut stream, block_length, algorithm)?;
        }

        info!(
            "Creating validation file for '{}' ({} initial checksums, {} blocks)",
            metadata.relative_name,
            metadata.checksums.len(),
            algorithm.name()
        );
        let record = ValidationFile::new(config.target.clone(), metadata);
        record.store(validation_path)
    }

    /// Load an existing validation file and bind it to this manager.
    ///
    /// Unless integrity checking is disabled, the record's self-checksum is
    /// verified before any block checksum inside it is trusted. The
    /// protected file is expected to live next to the validation file.
    pub fn open<P: AsRef<Path>>(validation_path: P, config: IntegrityConfig) -> Result<Self> {
        let validation_path = validation_path.as_ref().to_path_buf();
        info!("Opening validation file {:?}", validation_path);

        let mut validation = ValidationFile::load(&validation_path, !config.disabled)?;
        validation.file.full_name = validation_path
            .parent()
            .unwrap_or_else(|| Path::new(""))
            .join(&validation.file.relative_name);

        Ok(ProtectedFile {
            validation,
            validation_path,
            config,
            stream: None,
        })
    }

    /// The name this manager's metadata protects.
    pub fn protected_name(&self) -> &str {
        &self.validation.file.relative_name
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Open a read stream with a default cache buffer.
    pub fn open_for_read(&mut self, name: &str) -> Result<()> {
        let buffer = self.default_buffer();
        self.open_stream(name, OpenMode::Read, OpenFlags::default(), buffer)
    }

    /// Open a read stream over a caller-owned cache buffer.
    pub fn open_for_read_with_buffer(
        &mut self,
        name: &str,
        cache_buffer: &'buf mut [u8],
    ) -> Result<()> {
        self.open_stream(
            name,
            OpenMode::Read,
            OpenFlags::default(),
            CacheBuffer::Borrowed(cache_buffer),
        )
    }

    /// Open a write stream with a default cache buffer.
    pub fn open_for_write(&mut self, name: &str, flags: OpenFlags) -> Result<()> {
        let buffer = self.default_buffer();
        self.open_stream(name, OpenMode::Write, flags, buffer)
    }

    /// Open a write stream over a caller-owned cache buffer.
    pub fn open_for_write_with_buffer(
        &mut self,
        name: &str,
        flags: OpenFlags,
        cache_buffer: &'buf mut [u8],
    ) -> Result<()> {
        self.open_stream(
            name,
            OpenMode::Write,
            flags,
            CacheBuffer::Borrowed(cache_buffer),
        )
    }

    /// Open a read-write stream.
    pub fn open_for_read_write(&mut self, name: &str, flags: OpenFlags) -> Result<()> {
        let buffer = self.default_buffer();
        self.open_stream(name, OpenMode::ReadWrite, flags, buffer)
    }

    /// Read at the stream cursor. Requires a read-capable open stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.stream.as_mut() {
            None => Err(VeristreamError::StreamNotOpen),
            Some(active) if !active.mode().readable() => Err(VeristreamError::StreamNotReadable),
            Some(ActiveStream::Plain { stream, .. }) => stream.read(buf),
            Some(ActiveStream::Checked { engine, .. }) => engine.read(buf),
        }
    }

    /// Write at the stream cursor. Requires a write-capable open stream.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        match self.stream.as_mut() {
            None => Err(VeristreamError::StreamNotOpen),
            Some(active) if !active.mode().writable() => Err(VeristreamError::StreamNotWritable),
            Some(ActiveStream::Plain { stream, .. }) => stream.write(data),
            Some(ActiveStream::Checked { engine, .. }) => engine.write(data),
        }
    }

    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        match self.stream.as_mut() {
            None => Err(VeristreamError::StreamNotOpen),
            Some(ActiveStream::Plain { stream, .. }) => stream.seek(pos),
            Some(ActiveStream::Checked { engine, .. }) => engine.seek(pos),
        }
    }

    /// Flush dirty blocks, sync the raw stream, and persist the validation
    /// metadata. A no-op success on a read-only stream; an error while
    /// closed.
    pub fn sync(&mut self) -> Result<()> {
        match self.stream.as_mut() {
            None => Err(VeristreamError::StreamNotOpen),
            Some(active) if !active.mode().writable() => Ok(()),
            Some(ActiveStream::Plain { stream, .. }) => stream.sync(),
            Some(ActiveStream::Checked { engine, .. }) => {
                engine.sync()?;
                self.validation.file = engine.metadata().clone();
                self.validation.store(&self.validation_path)
            }
        }
    }

    /// Flush a write-capable stream, persist the validation metadata, and
    /// transition to closed. Closing an already-closed manager is a no-op
    /// success. The stream is torn down even when the final flush fails;
    /// the error is reported.
    pub fn close(&mut self) -> Result<()> {
        let Some(active) = self.stream.take() else {
            return Ok(());
        };
        debug!("Closing stream for '{}'", self.protected_name());

        match active {
            ActiveStream::Plain { mut stream, mode } => {
                if mode.writable() {
                    stream.sync()?;
                }
                Ok(())
            }
            ActiveStream::Checked { mut engine, mode } => {
                if mode.writable() {
                    engine.sync()?;
                    let (_, metadata) = engine.into_parts();
                    self.validation.file = metadata;
                    self.validation.store(&self.validation_path)?;
                }
                Ok(())
            }
        }
    }

    /// Size of the protected file, counting unflushed cached tails while a
    /// write stream is open.
    pub fn get_file_size(&mut self, name: &str) -> Result<u64> {
        self.check_name(name)?;
        match self.stream.as_mut() {
            Some(ActiveStream::Plain { stream, .. }) => stream.file_size(),
            Some(ActiveStream::Checked { engine, .. }) => engine.file_size(),
            None => Ok(std::fs::metadata(&self.validation.file.full_name)?.len()),
        }
    }

    /// Read the checksum list for `name` out of a validation file on disk.
    pub fn get_checksums<P: AsRef<Path>>(
        name: &str,
        validation_path: P,
        config: &IntegrityConfig,
    ) -> Result<Vec<u64>> {
        let validation = ValidationFile::load(validation_path, !config.disabled)?;
        if !validation.file.matches_name(name) {
            return Err(VeristreamError::UnprotectedName(name.to_string()));
        }
        Ok(validation.file.checksums)
    }

    /// Validate the protected file's entire current content against the
    /// recorded checksums without opening a caller-visible stream.
    pub fn verify(&mut self, name: &str) -> Result<()> {
        self.check_name(name)?;
        if self.stream.is_some() {
            return Err(VeristreamError::StreamAlreadyOpen);
        }

        let stream = FileStream::open(
            &self.validation.file.full_name,
            OpenMode::Read,
            OpenFlags::default(),
        )?;
        let block_length = self.validation.file.block_length as usize;
        let mut engine = IntegrityEngine::new(
            stream,
            self.validation.file.clone(),
            vec![0u8; block_length],
        )?;
        engine.pre_validate(false)
    }

    /// Buffer headroom of the open stream's cache; see
    /// [`BlockCache::remaining_capacity`](crate::cache::BlockCache::remaining_capacity).
    pub fn remaining_capacity(&self) -> Result<u64> {
        match self.stream.as_ref() {
            Some(ActiveStream::Checked { engine, .. }) => Ok(engine.remaining_capacity()),
            Some(ActiveStream::Plain { .. }) => Ok(0),
            None => Err(VeristreamError::StreamNotOpen),
        }
    }

    fn default_buffer(&self) -> CacheBuffer<'buf> {
        let block_length = self.validation.file.block_length as usize;
        CacheBuffer::Owned(vec![0u8; DEFAULT_CACHE_PAGES * block_length].into_boxed_slice())
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if self.validation.file.matches_name(name) {
            Ok(())
        } else {
            Err(VeristreamError::UnprotectedName(name.to_string()))
        }
    }

    fn open_stream(
        &mut self,
        name: &str,
        mode: OpenMode,
        flags: OpenFlags,
        buffer: CacheBuffer<'buf>,
    ) -> Result<()> {
        if self.stream.is_some() {
            return Err(VeristreamError::StreamAlreadyOpen);
        }
        // Name matching comes first: a mismatch must never touch the raw
        // stream.
        self.check_name(name)?;

        let path = self.validation.file.full_name.clone();
        let mut stream = FileStream::open(&path, mode, flags)?;
        debug!("Opened {:?} stream for '{}'", mode, name);

        // Truncation discards the content every recorded checksum covered.
        if flags.truncate {
            self.validation.file.checksums.clear();
        }

        if self.config.disabled {
            if flags.append {
                stream.seek(SeekFrom::End(0))?;
            }
            self.stream = Some(ActiveStream::Plain { stream, mode });
            return Ok(());
        }

        let mut engine = IntegrityEngine::new(stream, self.validation.file.clone(), buffer)?;
        if flags.append {
            engine.enable_append_mode();
        }
        self.stream = Some(ActiveStream::Checked { engine, mode });
        Ok(())
    }
}

impl Drop for ProtectedFile<'_> {
    fn drop(&mut self) {
        // Best-effort close; errors cannot be surfaced from drop.
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BLOCK: u32 = 128;

    fn setup(dir: &TempDir) -> (PathBuf, PathBuf, IntegrityConfig) {
        let data_path = dir.path().join("payload.bin");
        let validation_path = dir.path().join("payload.vstream");
        let config = IntegrityConfig::new("unit-test-target");
        (data_path, validation_path, config)
    }

    fn create(dir: &TempDir) -> (PathBuf, PathBuf, IntegrityConfig) {
        let (data_path, validation_path, config) = setup(dir);
        ProtectedFile::create_validation_file(
            &validation_path,
            &config,
            &data_path,
            BLOCK,
            ChecksumAlgorithm::Crc32,
        )
        .unwrap();
        (data_path, validation_path, config)
    }

    #[test]
    fn test_create_open_write_read_cycle() {
        let dir = TempDir::new().unwrap();
        let (data_path, validation_path, config) = create(&dir);

        let mut protected = ProtectedFile::open(&validation_path, config.clone()).unwrap();
        protected
            .open_for_write(
                "payload.bin",
                OpenFlags {
                    create: true,
                    ..Default::default()
                },
            )
            .unwrap();
        protected.write(b"guarded payload").unwrap();
        protected.close().unwrap();

        assert_eq!(std::fs::read(&data_path).unwrap(), b"guarded payload");

        let mut protected = ProtectedFile::open(&validation_path, config).unwrap();
        protected.open_for_read("payload.bin").unwrap();
        let mut buf = [0u8; 15];
        assert_eq!(protected.read(&mut buf).unwrap(), 15);
        assert_eq!(&buf, b"guarded payload");
        protected.close().unwrap();
    }

    #[test]
    fn test_name_mismatch_never_touches_raw_stream() {
        let dir = TempDir::new().unwrap();
        let (data_path, validation_path, config) = create(&dir);

        let mut protected = ProtectedFile::open(&validation_path, config).unwrap();
        let result = protected.open_for_write(
            "imposter.bin",
            OpenFlags {
                create: true,
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(VeristreamError::UnprotectedName(_))));
        // Even with `create`, no file appeared.
        assert!(!data_path.exists());
    }

    #[test]
    fn test_second_open_rejected() {
        let dir = TempDir::new().unwrap();
        let (_, validation_path, config) = create(&dir);

        let mut protected = ProtectedFile::open(&validation_path, config).unwrap();
        protected
            .open_for_write(
                "payload.bin",
                OpenFlags {
                    create: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert!(matches!(
            protected.open_for_read("payload.bin"),
            Err(VeristreamError::StreamAlreadyOpen)
        ));
    }

    #[test]
    fn test_close_is_idempotent_and_sync_needs_open() {
        let dir = TempDir::new().unwrap();
        let (_, validation_path, config) = create(&dir);

        let mut protected = ProtectedFile::open(&validation_path, config).unwrap();
        assert!(protected.close().is_ok());
        assert!(protected.close().is_ok());
        assert!(matches!(
            protected.sync(),
            Err(VeristreamError::StreamNotOpen)
        ));
    }

    #[test]
    fn test_sync_on_read_stream_is_noop() {
        let dir = TempDir::new().unwrap();
        let (data_path, validation_path, config) = create(&dir);
        std::fs::write(&data_path, b"").unwrap();

        let mut protected = ProtectedFile::open(&validation_path, config).unwrap();
        protected.open_for_read("payload.bin").unwrap();
        assert!(protected.sync().is_ok());
    }

    #[test]
    fn test_disabled_config_bypasses_engine() {
        let dir = TempDir::new().unwrap();
        let (data_path, validation_path, mut config) = create(&dir);

        {
            let mut protected = ProtectedFile::open(&validation_path, config.clone()).unwrap();
            protected
                .open_for_write(
                    "payload.bin",
                    OpenFlags {
                        create: true,
                        ..Default::default()
                    },
                )
                .unwrap();
            protected.write(&vec![0x42; BLOCK as usize]).unwrap();
            protected.close().unwrap();
        }

        // Corrupt the payload on disk.
        let mut raw = std::fs::read(&data_path).unwrap();
        raw[0] ^= 0xFF;
        std::fs::write(&data_path, &raw).unwrap();

        // Checked open detects it...
        let mut protected = ProtectedFile::open(&validation_path, config.clone()).unwrap();
        protected.open_for_read("payload.bin").unwrap();
        let mut buf = vec![0u8; BLOCK as usize];
        assert!(matches!(
            protected.read(&mut buf),
            Err(VeristreamError::IntegrityViolation { .. })
        ));
        protected.close().unwrap();

        // ...while a disabled open reads the corrupted bytes verbatim.
        config.disabled = true;
        let mut protected = ProtectedFile::open(&validation_path, config).unwrap();
        protected.open_for_read("payload.bin").unwrap();
        assert_eq!(protected.read(&mut buf).unwrap(), BLOCK as usize);
        assert_eq!(buf[0], 0x42 ^ 0xFF);
    }

    #[test]
    fn test_bootstrap_over_existing_content() {
        let dir = TempDir::new().unwrap();
        let (data_path, validation_path, config) = setup(&dir);
        std::fs::write(&data_path, vec![0x77; BLOCK as usize * 2 + 5]).unwrap();

        ProtectedFile::create_validation_file(
            &validation_path,
            &config,
            &data_path,
            BLOCK,
            ChecksumAlgorithm::Crc32,
        )
        .unwrap();

        let checksums =
            ProtectedFile::get_checksums("payload.bin", &validation_path, &config).unwrap();
        assert_eq!(checksums.len(), 3);

        let mut protected = ProtectedFile::open(&validation_path, config).unwrap();
        assert!(protected.verify("payload.bin").is_ok());
    }

    #[test]
    fn test_verify_flags_corruption() {
        let dir = TempDir::new().unwrap();
        let (data_path, validation_path, config) = setup(&dir);
        std::fs::write(&data_path, vec![0x10; BLOCK as usize]).unwrap();
        ProtectedFile::create_validation_file(
            &validation_path,
            &config,
            &data_path,
            BLOCK,
            ChecksumAlgorithm::Crc32,
        )
        .unwrap();

        let mut raw = std::fs::read(&data_path).unwrap();
        raw[7] ^= 0x01;
        std::fs::write(&data_path, &raw).unwrap();

        let mut protected = ProtectedFile::open(&validation_path, config).unwrap();
        assert!(matches!(
            protected.verify("payload.bin"),
            Err(VeristreamError::IntegrityViolation { block_id: 0 })
        ));
    }

    #[test]
    fn test_get_file_size_checks_name() {
        let dir = TempDir::new().unwrap();
        let (data_path, validation_path, config) = create(&dir);
        std::fs::write(&data_path, b"123456").unwrap();

        let mut protected = ProtectedFile::open(&validation_path, config).unwrap();
        assert_eq!(protected.get_file_size("payload.bin").unwrap(), 6);
        assert!(matches!(
            protected.get_file_size("other.bin"),
            Err(VeristreamError::UnprotectedName(_))
        ));
    }

    #[test]
    fn test_truncate_resets_checksums() {
        let dir = TempDir::new().unwrap();
        let (data_path, validation_path, config) = setup(&dir);
        std::fs::write(&data_path, vec![0x99; BLOCK as usize * 2]).unwrap();
        ProtectedFile::create_validation_file(
            &validation_path,
            &config,
            &data_path,
            BLOCK,
            ChecksumAlgorithm::Crc32,
        )
        .unwrap();

        let mut protected = ProtectedFile::open(&validation_path, config.clone()).unwrap();
        protected
            .open_for_write(
                "payload.bin",
                OpenFlags {
                    truncate: true,
                    ..Default::default()
                },
            )
            .unwrap();
        protected.write(b"fresh").unwrap();
        protected.close().unwrap();

        let checksums =
            ProtectedFile::get_checksums("payload.bin", &validation_path, &config).unwrap();
        assert_eq!(checksums.len(), 1);
        assert_eq!(std::fs::read(&data_path).unwrap(), b"fresh");
    }
}
