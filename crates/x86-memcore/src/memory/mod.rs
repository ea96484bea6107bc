//! Paged guest memory: block variants, the block arena and address spaces.

/// Shared block capability set and bounds errors.
pub mod block;
/// Code-caching block variant.
pub mod code_cache;
/// Deferred-allocation block variant.
pub mod lazy;
/// Eagerly backed RAM and ROM block variants.
pub mod ram;

/// Arena of block variants addressed by stable handles.
pub mod arena;
/// Per-view block directories and cross-block access paths.
pub mod space;
/// Owner of the arena and the physical/linear views.
pub mod system;

pub use arena::{Block, BlockArena, BlockHandle};
pub use block::{BlockError, MemoryBlock};
pub use code_cache::CodeCacheBlock;
pub use lazy::LazyBlock;
pub use ram::{RamBlock, RomBlock};
pub use space::{AddressSpace, SpaceAccess, SpaceKind, OPEN_BUS_BYTE};
pub use system::MemorySystem;

/// Size in bytes of one addressable block.
pub const BLOCK_SIZE: usize = 4096;

/// Shift converting an address into its block index.
pub const BLOCK_SHIFT: u32 = 12;

/// Mask selecting the in-block offset of an address.
pub const BLOCK_MASK: u32 = 0xFFF;

/// Size in bytes of the flat guest address space (4 GiB).
pub const ADDRESS_SPACE_BYTES: u64 = 1 << 32;

/// Number of block slots needed to cover the whole address space.
pub const BLOCK_COUNT: u32 = 1 << (32 - BLOCK_SHIFT);

const _: () = assert!(BLOCK_SIZE == 1 << BLOCK_SHIFT);
const _: () = assert!(BLOCK_MASK as usize == BLOCK_SIZE - 1);

/// Returns the index of the block containing `addr`.
#[must_use]
pub const fn block_index(addr: u32) -> u32 {
    addr >> BLOCK_SHIFT
}

/// Returns the offset of `addr` inside its block.
#[must_use]
pub const fn block_offset(addr: u32) -> usize {
    (addr & BLOCK_MASK) as usize
}

/// Returns the first address covered by block `index`.
#[must_use]
pub const fn block_base(index: u32) -> u32 {
    index << BLOCK_SHIFT
}

/// Returns how many bytes remain between `addr` and the end of its block.
#[must_use]
pub const fn bytes_to_block_end(addr: u32) -> usize {
    BLOCK_SIZE - block_offset(addr)
}

#[cfg(test)]
mod tests {
    use super::{
        block_base, block_index, block_offset, bytes_to_block_end, BLOCK_COUNT, BLOCK_SIZE,
    };

    #[test]
    fn block_arithmetic_at_boundaries() {
        assert_eq!(block_index(0), 0);
        assert_eq!(block_index(0x0FFF), 0);
        assert_eq!(block_index(0x1000), 1);
        assert_eq!(block_index(u32::MAX), BLOCK_COUNT - 1);

        assert_eq!(block_offset(0x1234), 0x234);
        assert_eq!(block_offset(u32::MAX), BLOCK_SIZE - 1);

        assert_eq!(block_base(1), 0x1000);
        assert_eq!(block_base(BLOCK_COUNT - 1), 0xFFFF_F000);
    }

    #[test]
    fn bytes_to_block_end_counts_the_current_byte() {
        assert_eq!(bytes_to_block_end(0x2000), BLOCK_SIZE);
        assert_eq!(bytes_to_block_end(0x2FFF), 1);
        assert_eq!(bytes_to_block_end(0x2FFE), 2);
    }
}
