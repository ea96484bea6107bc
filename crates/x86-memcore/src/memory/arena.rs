//! Single owner of every block, addressed by stable handles.
//!
//! Address-space directories store [`BlockHandle`]s rather than blocks, so
//! re-typing a block is one slot swap here and every view that holds the
//! handle observes it immediately.

use tracing::debug;

use super::block::{BlockError, MemoryBlock};
use super::code_cache::CodeCacheBlock;
use super::lazy::LazyBlock;
use super::ram::{RamBlock, RomBlock};
use crate::error::MemoryError;

/// Stable reference to a block slot in a [`BlockArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHandle(usize);

impl BlockHandle {
    /// Slot index inside the arena.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Closed set of block variants.
#[derive(Debug, Clone)]
pub enum Block {
    /// Allocated on first touch.
    Lazy(LazyBlock),
    /// Eagerly allocated, writable.
    Ram(RamBlock),
    /// Firmware image, read-only.
    Rom(RomBlock),
    /// Bytes plus compiled code per entry offset.
    CodeCache(CodeCacheBlock),
}

impl Default for Block {
    fn default() -> Self {
        Self::Lazy(LazyBlock::new())
    }
}

impl Block {
    /// Short variant name for diagnostics.
    #[must_use]
    pub const fn kind_name(&self) -> &'static str {
        match self {
            Self::Lazy(_) => "lazy",
            Self::Ram(_) => "ram",
            Self::Rom(_) => "rom",
            Self::CodeCache(_) => "code-cache",
        }
    }

    /// Returns the code cache when this block has been converted.
    #[must_use]
    pub const fn as_code_cache(&self) -> Option<&CodeCacheBlock> {
        match self {
            Self::CodeCache(cache) => Some(cache),
            _ => None,
        }
    }

    fn into_code_cache(self) -> CodeCacheBlock {
        match self {
            Self::CodeCache(cache) => cache,
            Self::Lazy(mut lazy) => CodeCacheBlock::from_contents(lazy.take_contents(), true),
            Self::Ram(mut ram) => CodeCacheBlock::from_contents(ram.take_contents(), true),
            Self::Rom(rom) => CodeCacheBlock::from_contents(rom.contents().into(), false),
        }
    }

    fn inner_mut(&mut self) -> &mut dyn MemoryBlock {
        match self {
            Self::Lazy(block) => block,
            Self::Ram(block) => block,
            Self::Rom(block) => block,
            Self::CodeCache(block) => block,
        }
    }
}

impl MemoryBlock for Block {
    fn size(&self) -> usize {
        match self {
            Self::Lazy(block) => block.size(),
            Self::Ram(block) => block.size(),
            Self::Rom(block) => block.size(),
            Self::CodeCache(block) => block.size(),
        }
    }

    fn copy_out(&mut self, offset: usize, dst: &mut [u8]) -> Result<(), BlockError> {
        self.inner_mut().copy_out(offset, dst)
    }

    fn copy_in(&mut self, offset: usize, src: &[u8]) -> Result<(), BlockError> {
        self.inner_mut().copy_in(offset, src)
    }

    /// Writable code caches revert to an unallocated [`LazyBlock`], dropping
    /// their translations. ROM-derived caches keep their image.
    fn clear(&mut self) {
        match self {
            Self::CodeCache(cache) if cache.is_writable() => *self = Self::default(),
            _ => self.inner_mut().clear(),
        }
    }

    fn is_allocated(&self) -> bool {
        match self {
            Self::Lazy(block) => block.is_allocated(),
            Self::Ram(_) | Self::Rom(_) | Self::CodeCache(_) => true,
        }
    }
}

impl From<LazyBlock> for Block {
    fn from(block: LazyBlock) -> Self {
        Self::Lazy(block)
    }
}

impl From<RamBlock> for Block {
    fn from(block: RamBlock) -> Self {
        Self::Ram(block)
    }
}

impl From<RomBlock> for Block {
    fn from(block: RomBlock) -> Self {
        Self::Rom(block)
    }
}

impl From<CodeCacheBlock> for Block {
    fn from(block: CodeCacheBlock) -> Self {
        Self::CodeCache(block)
    }
}

/// Storage for every block referenced by any address space.
///
/// Slots are never reclaimed. Unmapping or replacing a block in a directory
/// leaves its slot in place, so handles stay valid for the arena's lifetime
/// and the arena only grows. Reuse a handle with [`BlockArena::replace`] to
/// bound its size.
#[derive(Debug, Default)]
pub struct BlockArena {
    slots: Vec<Block>,
}

impl BlockArena {
    /// Creates an empty arena.
    #[must_use]
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Number of blocks stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` when no block has been stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Stores `block` and returns its handle.
    pub fn insert(&mut self, block: impl Into<Block>) -> BlockHandle {
        let handle = BlockHandle(self.slots.len());
        self.slots.push(block.into());
        handle
    }

    /// Returns the block behind `handle`.
    #[must_use]
    pub fn get(&self, handle: BlockHandle) -> Option<&Block> {
        self.slots.get(handle.index())
    }

    /// Returns the block behind `handle` mutably.
    pub fn get_mut(&mut self, handle: BlockHandle) -> Option<&mut Block> {
        self.slots.get_mut(handle.index())
    }

    /// Swaps the block behind `handle` for `block`, returning the old one.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::UnknownBlock`] if `handle` is not from this arena.
    pub fn replace(
        &mut self,
        handle: BlockHandle,
        block: impl Into<Block>,
    ) -> Result<Block, MemoryError> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .ok_or(MemoryError::UnknownBlock { handle })?;
        Ok(std::mem::replace(slot, block.into()))
    }

    /// Re-types the block behind `handle` as a code cache, keeping its bytes.
    ///
    /// Already-converted blocks are left alone. Returns the converted cache.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::UnknownBlock`] if `handle` is not from this arena.
    pub fn convert_to_code_cache(
        &mut self,
        handle: BlockHandle,
    ) -> Result<&mut CodeCacheBlock, MemoryError> {
        let slot = self
            .slots
            .get_mut(handle.index())
            .ok_or(MemoryError::UnknownBlock { handle })?;
        if !matches!(slot, Block::CodeCache(_)) {
            let previous = std::mem::take(slot);
            debug!(
                handle = handle.index(),
                from = previous.kind_name(),
                "converting block to code cache"
            );
            *slot = Block::CodeCache(previous.into_code_cache());
        }
        match slot {
            Block::CodeCache(cache) => Ok(cache),
            Block::Lazy(_) | Block::Ram(_) | Block::Rom(_) => {
                Err(MemoryError::UnknownBlock { handle })
            }
        }
    }
}
