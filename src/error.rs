use thiserror::Error;

#[derive(Error, Debug)]
pub enum VeristreamError {
    #[error("Integrity violation: checksum mismatch in block {block_id}")]
    IntegrityViolation { block_id: u64 },

    #[error("Validation file failed its self-check (stored {stored:#010x}, computed {computed:#010x})")]
    ValidationFileTampered { stored: u32, computed: u32 },

    #[error("A stream is already open for this validation set")]
    StreamAlreadyOpen,

    #[error("No stream is open")]
    StreamNotOpen,

    #[error("Open stream does not allow reads")]
    StreamNotReadable,

    #[error("Open stream does not allow writes")]
    StreamNotWritable,

    #[error("File name '{0}' is not protected by this validation file")]
    UnprotectedName(String),

    #[error("Invalid block length: {0}")]
    InvalidBlockLength(u64),

    #[error("Block length {length} exceeds the {algorithm} maximum of {max} bytes")]
    BlockLengthOverAlgorithmBound {
        length: u64,
        max: u64,
        algorithm: &'static str,
    },

    #[error("Path cannot be empty")]
    EmptyPath,

    #[error("Unsupported open flags: {0}")]
    UnsupportedFlags(String),

    #[error("Cache buffer too small: {buffer} bytes cannot hold one {block_length}-byte block")]
    InsufficientCacheBuffer { buffer: usize, block_length: usize },

    #[error("Unsupported validation file version: {0}")]
    UnsupportedVersion(String),

    #[error("Validation file too large: {size} bytes (max {max})")]
    ValidationFileTooLarge { size: u64, max: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Validation file parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VeristreamError>;
