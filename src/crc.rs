//! Incremental CRC computation for block checksums.
//!
//! Two algorithms are supported: CRC32 (IEEE, via `crc32fast`) and CRC64
//! (ECMA-182, table-driven). The algorithm bounds the block length a single
//! checksum may safely cover, so the bound lives here next to the selector.

use serde::{Deserialize, Serialize};

/// Largest block a 32-bit checksum safely covers.
pub const CRC32_MAX_BLOCK_LENGTH: u64 = 4 * 1024;

/// Largest block a 64-bit checksum safely covers.
pub const CRC64_MAX_BLOCK_LENGTH: u64 = 4 * 1024 * 1024;

/// ECMA-182 polynomial, reflected form.
const CRC64_POLYNOMIAL: u64 = 0xC96C_5795_D787_0F42;

/// Precomputed CRC64 lookup table, generated at compile time.
const CRC64_TABLE: [u64; 256] = generate_crc64_table();

const fn generate_crc64_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u64;
        let mut j = 0;
        while j < 8 {
            if crc & 1 == 1 {
                crc = (crc >> 1) ^ CRC64_POLYNOMIAL;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Checksum algorithm used for a protected file's blocks.
///
/// Serialized as `"32-bit"` / `"64-bit"` in validation files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    #[serde(rename = "32-bit")]
    Crc32,
    #[serde(rename = "64-bit")]
    Crc64,
}

impl ChecksumAlgorithm {
    /// Maximum block length this algorithm may safely cover.
    pub fn max_block_length(self) -> u64 {
        match self {
            ChecksumAlgorithm::Crc32 => CRC32_MAX_BLOCK_LENGTH,
            ChecksumAlgorithm::Crc64 => CRC64_MAX_BLOCK_LENGTH,
        }
    }

    /// Human-readable name, matching the serialized form.
    pub fn name(self) -> &'static str {
        match self {
            ChecksumAlgorithm::Crc32 => "32-bit",
            ChecksumAlgorithm::Crc64 => "64-bit",
        }
    }
}

/// Incremental checksum accumulator.
///
/// Constructed fresh per block (re)computation: fold bytes in with
/// [`update`](ChecksumAccumulator::update), then consume the running state
/// with [`finalize`](ChecksumAccumulator::finalize). CRC32 results occupy
/// the low 32 bits of the returned value.
#[derive(Clone)]
pub enum ChecksumAccumulator {
    Crc32(crc32fast::Hasher),
    Crc64(u64),
}

impl ChecksumAccumulator {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Crc32 => ChecksumAccumulator::Crc32(crc32fast::Hasher::new()),
            ChecksumAlgorithm::Crc64 => ChecksumAccumulator::Crc64(u64::MAX),
        }
    }

    /// Fold `data` into the running state.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            ChecksumAccumulator::Crc32(hasher) => hasher.update(data),
            ChecksumAccumulator::Crc64(state) => {
                let mut crc = *state;
                for &byte in data {
                    let index = ((crc ^ u64::from(byte)) & 0xFF) as usize;
                    crc = (crc >> 8) ^ CRC64_TABLE[index];
                }
                *state = crc;
            }
        }
    }

    /// Consume the accumulator and return the checksum value.
    pub fn finalize(self) -> u64 {
        match self {
            ChecksumAccumulator::Crc32(hasher) => u64::from(hasher.finalize()),
            ChecksumAccumulator::Crc64(state) => state ^ u64::MAX,
        }
    }
}

/// One-shot checksum of a byte span.
pub fn checksum_of(algorithm: ChecksumAlgorithm, data: &[u8]) -> u64 {
    let mut acc = ChecksumAccumulator::new(algorithm);
    acc.update(data);
    acc.finalize()
}
