//! Owner of the block arena and both address-space views.

use tracing::debug;

use super::arena::{Block, BlockArena, BlockHandle};
use super::ram::RomBlock;
use super::space::{AddressSpace, SpaceAccess, SpaceKind};
use super::{block_index, block_offset, BLOCK_COUNT, BLOCK_SIZE, OPEN_BUS_BYTE};
use crate::error::MemoryError;

/// Guest memory as owned by one execution loop.
///
/// Blocks are shared between the physical and linear views by handle, so a
/// block converted through one view is converted in both.
#[derive(Debug)]
pub struct MemorySystem {
    arena: BlockArena,
    physical: AddressSpace,
    linear: AddressSpace,
}

impl Default for MemorySystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySystem {
    /// Creates a system with no blocks mapped.
    #[must_use]
    pub fn new() -> Self {
        Self {
            arena: BlockArena::new(),
            physical: AddressSpace::new(SpaceKind::Physical),
            linear: AddressSpace::new(SpaceKind::Linear),
        }
    }

    /// Shared block storage.
    #[must_use]
    pub const fn arena(&self) -> &BlockArena {
        &self.arena
    }

    /// Directory of the requested view.
    #[must_use]
    pub const fn space(&self, kind: SpaceKind) -> &AddressSpace {
        match kind {
            SpaceKind::Physical => &self.physical,
            SpaceKind::Linear => &self.linear,
        }
    }

    /// Mutable directory of the requested view.
    pub fn space_mut(&mut self, kind: SpaceKind) -> &mut AddressSpace {
        match kind {
            SpaceKind::Physical => &mut self.physical,
            SpaceKind::Linear => &mut self.linear,
        }
    }

    /// Access through the requested view.
    pub fn view(&mut self, kind: SpaceKind) -> SpaceAccess<'_> {
        match kind {
            SpaceKind::Physical => self.physical.bind(&mut self.arena),
            SpaceKind::Linear => self.linear.bind(&mut self.arena),
        }
    }

    /// Access through the physical view.
    pub fn physical(&mut self) -> SpaceAccess<'_> {
        self.view(SpaceKind::Physical)
    }

    /// Access through the linear view.
    pub fn linear(&mut self) -> SpaceAccess<'_> {
        self.view(SpaceKind::Linear)
    }

    /// Stores `block` in the arena without mapping it.
    pub fn install(&mut self, block: impl Into<Block>) -> BlockHandle {
        self.arena.insert(block)
    }

    /// Stores `block` and maps it at block `index` in both views.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::IndexOutOfRange`] when `index` is past the
    /// address space.
    pub fn map_shared(
        &mut self,
        index: u32,
        block: impl Into<Block>,
    ) -> Result<BlockHandle, MemoryError> {
        if index >= BLOCK_COUNT {
            return Err(MemoryError::IndexOutOfRange { index });
        }
        let handle = self.arena.insert(block);
        self.physical.map_block(index, handle)?;
        self.linear.map_block(index, handle)?;
        Ok(handle)
    }

    /// Points every slot of both views referencing `old` at `new`.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::UnknownBlock`] when `new` is not in the arena.
    pub fn replace_blocks(
        &mut self,
        old: BlockHandle,
        new: BlockHandle,
    ) -> Result<usize, MemoryError> {
        if self.arena.get(new).is_none() {
            return Err(MemoryError::UnknownBlock { handle: new });
        }
        Ok(self.physical.replace_blocks(old, new) + self.linear.replace_blocks(old, new))
    }

    /// Maps `image` as read-only blocks starting at block-aligned `base`.
    ///
    /// The last block is padded with [`OPEN_BUS_BYTE`].
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Misaligned`] for an unaligned base and
    /// [`MemoryError::IndexOutOfRange`] when the image runs past 4 GiB. Nothing
    /// is mapped when an error is returned.
    pub fn load_rom(&mut self, base: u32, image: &[u8]) -> Result<Vec<BlockHandle>, MemoryError> {
        if block_offset(base) != 0 {
            return Err(MemoryError::Misaligned { addr: base });
        }
        let first = block_index(base);
        let blocks = image.len().div_ceil(BLOCK_SIZE);
        let end = u64::from(first).saturating_add(u64::try_from(blocks).unwrap_or(u64::MAX));
        if end > u64::from(BLOCK_COUNT) {
            return Err(MemoryError::IndexOutOfRange { index: BLOCK_COUNT });
        }
        let mut handles = Vec::with_capacity(blocks);
        for (index, chunk) in (first..).zip(image.chunks(BLOCK_SIZE)) {
            handles.push(self.map_shared(index, RomBlock::padded(chunk, OPEN_BUS_BYTE))?);
        }
        debug!(base, len = image.len(), blocks = handles.len(), "mapped rom image");
        Ok(handles)
    }
}
