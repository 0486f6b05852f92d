//! Validation metadata and the persisted validation-file record.
//!
//! A validation file is a JSON record: format version, the owning target
//! identifier, and one protected-file entry carrying the per-block checksum
//! list. The record protects itself with a CRC32 over its own serialization
//! so a wholesale swap of the checksums file is caught before any block
//! checksum inside it is trusted.

use crate::crc::{checksum_of, ChecksumAlgorithm};
use crate::error::{Result, VeristreamError};
use crate::stream::RawStream;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Current validation-file format version.
pub const FORMAT_VERSION: &str = "1.0.0";

/// Parse bound for a serialized validation file.
pub const MAX_VALIDATION_FILE_SIZE: u64 = 4 * 1024 * 1024;

/// Per-file validation metadata: which file is protected and the checksum
/// of every block recorded so far. `checksums[i]` covers block `i`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChecksums {
    /// Name the caller must present when opening.
    pub relative_name: String,

    /// Resolved path of the protected file. Not persisted; rebuilt by the
    /// host when the validation file is loaded.
    #[serde(skip)]
    pub full_name: PathBuf,

    /// Ordered per-block checksums. CRC32 values occupy the low 32 bits.
    pub checksums: Vec<u64>,

    /// Fixed block length for this file, bounded by the algorithm.
    pub block_length: u32,

    /// Checksum algorithm covering each block.
    pub algorithm: ChecksumAlgorithm,
}

impl FileChecksums {
    pub fn new(
        relative_name: impl Into<String>,
        full_name: impl Into<PathBuf>,
        block_length: u32,
        algorithm: ChecksumAlgorithm,
    ) -> Result<Self> {
        let relative_name = relative_name.into();
        let full_name = full_name.into();

        if relative_name.is_empty() || full_name.as_os_str().is_empty() {
            return Err(VeristreamError::EmptyPath);
        }
        if block_length == 0 {
            return Err(VeristreamError::InvalidBlockLength(0));
        }
        if u64::from(block_length) > algorithm.max_block_length() {
            return Err(VeristreamError::BlockLengthOverAlgorithmBound {
                length: u64::from(block_length),
                max: algorithm.max_block_length(),
                algorithm: algorithm.name(),
            });
        }

        Ok(FileChecksums {
            relative_name,
            full_name,
            checksums: Vec::new(),
            block_length,
            algorithm,
        })
    }

    /// Whether `name` is the file this metadata protects. Accepts the
    /// relative name or the resolved path.
    pub fn matches_name(&self, name: &str) -> bool {
        self.relative_name == name || self.full_name == Path::new(name)
    }

    /// Stored checksum for `block_id`, if one was ever recorded. Blocks
    /// beyond the recorded range (e.g. freshly appended data) have none and
    /// are read without validation.
    pub fn checksum_for(&self, block_id: u64) -> Option<u64> {
        usize::try_from(block_id)
            .ok()
            .and_then(|index| self.checksums.get(index).copied())
    }

    /// Store `checksum` for `block_id`, extending the list if the block is
    /// new. A write that skipped past end-of-file leaves zero-filled blocks
    /// behind it, so gap entries are checksums of an all-zero block.
    pub fn record_checksum(&mut self, block_id: u64, checksum: u64) {
        let index = usize::try_from(block_id).expect("block id exceeds address space");
        if index < self.checksums.len() {
            self.checksums[index] = checksum;
            return;
        }

        if index > self.checksums.len() {
            let zero_block = vec![0u8; self.block_length as usize];
            let zero_checksum = checksum_of(self.algorithm, &zero_block);
            self.checksums.resize(index, zero_checksum);
        }
        self.checksums.push(checksum);
    }
}

/// Persisted container for one file's validation metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationFile {
    /// Format version (semver). Major version 1 is accepted.
    pub format_version: String,

    /// Identifier of the owning target, from configuration.
    pub target: String,

    /// Creation timestamp (RFC 3339).
    pub created: String,

    /// The single protected-file record.
    pub file: FileChecksums,

    /// CRC32 of this record's serialization with this field zeroed.
    #[serde(default)]
    pub checksum: u32,
}

impl ValidationFile {
    pub fn new(target: impl Into<String>, file: FileChecksums) -> Self {
        ValidationFile {
            format_version: FORMAT_VERSION.to_string(),
            target: target.into(),
            created: chrono::Utc::now().to_rfc3339(),
            file,
            checksum: 0,
        }
    }

    /// Serialize to bytes with a fresh self-checksum.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut record = self.clone();
        record.checksum = 0;
        let unsealed = serde_json::to_vec_pretty(&record)?;
        record.checksum = crc32fast::hash(&unsealed);
        Ok(serde_json::to_vec_pretty(&record)?)
    }

    /// Parse from bytes. With `verify`, the record's self-checksum is
    /// recomputed and compared before anything inside it is trusted.
    pub fn from_bytes(bytes: &[u8], verify: bool) -> Result<Self> {
        if bytes.len() as u64 > MAX_VALIDATION_FILE_SIZE {
            return Err(VeristreamError::ValidationFileTooLarge {
                size: bytes.len() as u64,
                max: MAX_VALIDATION_FILE_SIZE,
            });
        }

        let record: ValidationFile = serde_json::from_slice(bytes)?;

        let version = Version::parse(&record.format_version)
            .map_err(|_| VeristreamError::UnsupportedVersion(record.format_version.clone()))?;
        if version.major != 1 {
            return Err(VeristreamError::UnsupportedVersion(record.format_version));
        }

        if verify {
            record.verify_self_checksum()?;
        }
        Ok(record)
    }

    /// Recompute the record checksum and compare against the stored value.
    pub fn verify_self_checksum(&self) -> Result<()> {
        let mut record = self.clone();
        record.checksum = 0;
        let unsealed = serde_json::to_vec_pretty(&record)?;
        let computed = crc32fast::hash(&unsealed);
        if computed != self.checksum {
            return Err(VeristreamError::ValidationFileTampered {
                stored: self.checksum,
                computed,
            });
        }
        Ok(())
    }

    /// Load and parse a validation file from disk.
    pub fn load<P: AsRef<Path>>(path: P, verify: bool) -> Result<Self> {
        let size = std::fs::metadata(&path)?.len();
        if size > MAX_VALIDATION_FILE_SIZE {
            return Err(VeristreamError::ValidationFileTooLarge {
                size,
                max: MAX_VALIDATION_FILE_SIZE,
            });
        }
        let bytes = std::fs::read(&path)?;
        Self::from_bytes(&bytes, verify)
    }

    /// Persist to disk, resealing the self-checksum.
    pub fn store<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        debug!(
            "Persisting validation file for '{}' ({} checksums)",
            self.file.relative_name,
            self.file.checksums.len()
        );
        std::fs::write(path, self.to_bytes()?)?;
        Ok(())
    }
}

/// Compute initial per-block checksums of an existing file by reading it
/// sequentially, one block at a time. Used when bootstrapping a validation
/// file for a file that already has content.
pub fn initial_checksums<S: RawStream>(
    stream: &mut S,
    block_length: u32,
    algorithm: ChecksumAlgorithm,
) -> Result<Vec<u64>> {
    let mut checksums = Vec::new();
    let mut block = vec![0u8; block_length as usize];

    stream.seek(SeekFrom::Start(0))?;
    loop {
        let filled = crate::stream::read_full(stream, &mut block)?;
        if filled == 0 {
            break;
        }
        checksums.push(checksum_of(algorithm, &block[..filled]));
        if filled < block.len() {
            break;
        }
    }
    Ok(checksums)
}
