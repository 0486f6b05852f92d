//! Veristream — integrity-protected block I/O
//!
//! Reads and writes to a protected file are split into fixed-size blocks,
//! each covered by a stored checksum, so corruption of file content —
//! accidental or malicious — is detected before the caller ever observes
//! bad data.
//!
//! ## Features
//!
//! - **Fixed-size blocks** checksummed with CRC32 (blocks up to 4 KiB) or
//!   CRC64 (up to 4 MiB)
//! - **LRU page cache** carved out of a caller-owned buffer; zero-copy,
//!   no hidden allocation
//! - **Flush-time checksumming**: pages touched many times are hashed once
//! - **Self-checking validation files**: the checksum record protects
//!   itself against wholesale replacement
//! - **Strict failure model**: tamper detection never silently passes and
//!   is never retried
//!
//! ## Example
//!
//! ```rust,no_run
//! use veristream::{ChecksumAlgorithm, IntegrityConfig, OpenFlags, ProtectedFile};
//!
//! # fn main() -> veristream::Result<()> {
//! let config = IntegrityConfig::new("my-service");
//!
//! // Bootstrap a validation file next to the data file.
//! ProtectedFile::create_validation_file(
//!     "data/payload.vstream",
//!     &config,
//!     "data/payload.bin",
//!     1024,
//!     ChecksumAlgorithm::Crc32,
//! )?;
//!
//! // Writes go through the integrity engine; checksums are recorded at
//! // flush time and persisted on close.
//! let mut protected = ProtectedFile::open("data/payload.vstream", config)?;
//! protected.open_for_write("payload.bin", OpenFlags { create: true, ..Default::default() })?;
//! protected.write(b"important bytes")?;
//! protected.close()?;
//!
//! // Later reads validate every checksummed block as it is loaded.
//! protected.open_for_read("payload.bin")?;
//! let mut buf = [0u8; 15];
//! protected.read(&mut buf)?;
//! protected.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ ProtectedFile (stream lifecycle)             │
//! │  - one open stream at a time                 │
//! │  - name matching, persistence on sync/close  │
//! ├──────────────────────────────────────────────┤
//! │ IntegrityEngine                              │
//! │  - logical cursor → block id                 │
//! │  - validate on load, checksum on flush       │
//! ├──────────────────────┬───────────────────────┤
//! │ BlockCache (LRU)     │ RawStream (disk I/O)  │
//! │  - caller's buffer   │  - seek/read/write    │
//! │  - evictee handback  │  - sync, file size    │
//! ├──────────────────────┴───────────────────────┤
//! │ ValidationFile (JSON record, self-checked)   │
//! │  - per-block checksum list                   │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Everything is single-threaded and synchronous; callers serialize access
//! to one open stream. Distinct protected files are fully independent.

pub mod cache;
pub mod config;
pub mod crc;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod session;
pub mod stream;

// Re-export commonly used types
pub use cache::{BlockCache, CacheBuffer, CacheStats, EvictedBlock, PageLoad, PageRef};
pub use config::IntegrityConfig;
pub use crc::{checksum_of, ChecksumAccumulator, ChecksumAlgorithm};
pub use engine::IntegrityEngine;
pub use error::{Result, VeristreamError};
pub use metadata::{FileChecksums, ValidationFile, FORMAT_VERSION, MAX_VALIDATION_FILE_SIZE};
pub use session::{ProtectedFile, DEFAULT_CACHE_PAGES};
pub use stream::{FileStream, OpenFlags, OpenMode, RawStream};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
