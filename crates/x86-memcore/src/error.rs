use thiserror::Error;

use crate::combiner::CombineError;
use crate::memory::BlockHandle;

/// Errors surfaced by address-space level operations.
///
/// Bounds problems inside a block never appear here: address spaces recover
/// from them with the byte-wise access path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// A directory references a handle the arena does not own.
    ///
    /// This is a wiring bug in the memory map; callers must halt rather than
    /// continue with diverging views.
    #[error("block handle {} is not owned by this arena", handle.index())]
    UnknownBlock {
        /// Offending handle.
        handle: BlockHandle,
    },
    /// A block index beyond the 32-bit address space was mapped.
    #[error("block index {index:#x} is outside the address space")]
    IndexOutOfRange {
        /// Offending block index.
        index: u32,
    },
    /// A block-granular operation was given an unaligned address.
    #[error("address {addr:#010x} is not block aligned")]
    Misaligned {
        /// Offending address.
        addr: u32,
    },
    /// Code was requested from an address with no block behind it.
    #[error("no block mapped at {addr:#010x}")]
    Unmapped {
        /// Requested guest address.
        addr: u32,
    },
    /// Not even a leaf block could be built for the entry point.
    #[error("translation at {addr:#010x} failed: {source}")]
    Translation {
        /// Requested guest address.
        addr: u32,
        /// Decoder or compiler failure.
        #[source]
        source: CombineError,
    },
}

impl MemoryError {
    /// Faults that indicate a broken memory map rather than guest behaviour.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownBlock { .. } | Self::IndexOutOfRange { .. } | Self::Misaligned { .. }
        )
    }
}
