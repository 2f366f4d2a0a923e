use thiserror::Error;

use crate::consts::Region;

/// Errors reported while parsing or generating an NVM3 image.
///
/// Every variant that refers to a location in the buffer carries the absolute
/// byte offset of the offending page or object header.
#[derive(Error, Debug)]
pub enum Error {
    #[error("buffer ends at offset {offset:#x}: {needed} bytes needed, {available} available")]
    ShortBuffer {
        offset: usize,
        needed: usize,
        available: usize,
    },

    #[error("invalid page magic {magic:#06x} at offset {offset:#x} (expected 0xb29a)")]
    BadMagic { offset: usize, magic: u16 },

    #[error("unsupported page format version {version} at offset {offset:#x} (expected 1)")]
    UnsupportedVersion { offset: usize, version: u16 },

    #[error("erase counter fails its Berger code in the page at offset {offset:#x}")]
    BergerMismatch { offset: usize },

    #[error("erase counter and its stored complement disagree in the page at offset {offset:#x}")]
    EraseCountComplementMismatch { offset: usize },

    #[error("unknown page status {status:#010x} at offset {offset:#x}")]
    InvalidPageStatus { offset: usize, status: u32 },

    #[error(
        "object header CRC mismatch at offset {offset:#x} for key {key:#07x}: \
         stored {stored:#06x}, computed {computed:#06x}"
    )]
    ObjectCrcMismatch {
        offset: usize,
        key: u32,
        stored: u16,
        computed: u16,
    },

    #[error("unknown object type {raw_type} at offset {offset:#x}")]
    UnknownObjectType { offset: usize, raw_type: u8 },

    #[error("malformed object header at offset {offset:#x}")]
    MalformedObjectHeader { offset: usize },

    #[error("large object {key:#07x} is missing its final fragment")]
    TruncatedObject { key: u32 },

    #[error("fragment for key {key:#07x} has no preceding first fragment")]
    OrphanedFragment { key: u32 },

    #[error("objects for the {region} region exceed its capacity (stopped at key {key:#07x})")]
    InsufficientSpace { region: Region, key: u32 },

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("object {key:#07x} is too large to serialize ({size} bytes)")]
    ObjectTooLarge { key: u32, size: usize },

    #[error("counter object {key:#07x} must carry exactly 4 payload bytes, got {size}")]
    InvalidCounterSize { key: u32, size: usize },
}

impl Error {
    /// Shift a window-relative byte offset to an image-absolute one.
    pub(crate) fn offset_by(self, base: usize) -> Self {
        match self {
            Error::ShortBuffer {
                offset,
                needed,
                available,
            } => Error::ShortBuffer {
                offset: offset + base,
                needed,
                available,
            },
            Error::ObjectCrcMismatch {
                offset,
                key,
                stored,
                computed,
            } => Error::ObjectCrcMismatch {
                offset: offset + base,
                key,
                stored,
                computed,
            },
            Error::UnknownObjectType { offset, raw_type } => Error::UnknownObjectType {
                offset: offset + base,
                raw_type,
            },
            Error::MalformedObjectHeader { offset } => Error::MalformedObjectHeader {
                offset: offset + base,
            },
            other => other,
        }
    }
}
