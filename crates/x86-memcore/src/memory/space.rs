//! Address-space views over the shared block arena.
//!
//! An [`AddressSpace`] is only a directory from block index to
//! [`BlockHandle`]. Accesses go through a [`SpaceAccess`], which pairs the
//! directory with the arena for the duration of a borrow.

use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, trace};

use super::arena::{Block, BlockArena, BlockHandle};
use super::block::MemoryBlock;
use super::{block_index, block_offset, bytes_to_block_end, BLOCK_COUNT, BLOCK_SIZE};
use crate::codeblock::{CodeBlock, ExecuteOutcome, ExecutionContext};
use crate::combiner::{CodeBlockCombiner, CombineError};
use crate::decode::{ByteCursor, Compiler, Decoder};
use crate::error::MemoryError;

/// Value read from addresses with no block behind them.
pub const OPEN_BUS_BYTE: u8 = 0xFF;

/// Which view of guest memory a space represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum SpaceKind {
    /// Addresses as seen on the memory bus.
    Physical,
    /// Addresses after segmentation and paging.
    Linear,
}

/// Sparse directory mapping 4 KiB block indices to arena handles.
#[derive(Debug, Clone)]
pub struct AddressSpace {
    kind: SpaceKind,
    directory: HashMap<u32, BlockHandle>,
}

impl AddressSpace {
    /// Creates an empty space of the given kind.
    #[must_use]
    pub fn new(kind: SpaceKind) -> Self {
        Self {
            kind,
            directory: HashMap::new(),
        }
    }

    /// View this space represents.
    #[must_use]
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Installs `handle` at block `index`, returning the handle it displaced.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::IndexOutOfRange`] for indices past the 4 GiB
    /// address space.
    pub fn map_block(
        &mut self,
        index: u32,
        handle: BlockHandle,
    ) -> Result<Option<BlockHandle>, MemoryError> {
        if index >= BLOCK_COUNT {
            return Err(MemoryError::IndexOutOfRange { index });
        }
        Ok(self.directory.insert(index, handle))
    }

    /// Removes the block at `index`, returning its handle.
    pub fn unmap_block(&mut self, index: u32) -> Option<BlockHandle> {
        self.directory.remove(&index)
    }

    /// Handle installed at block `index`.
    #[must_use]
    pub fn handle_for_index(&self, index: u32) -> Option<BlockHandle> {
        self.directory.get(&index).copied()
    }

    /// Handle of the block whose 4 KiB range contains `addr`.
    #[must_use]
    pub fn handle_at(&self, addr: u32) -> Option<BlockHandle> {
        self.handle_for_index(block_index(addr))
    }

    /// Number of directory slots in use.
    #[must_use]
    pub fn mapped_block_count(&self) -> usize {
        self.directory.len()
    }

    /// Points every slot referencing `old` at `new`.
    ///
    /// Returns the number of slots rewritten; zero when `old` is absent.
    pub fn replace_blocks(&mut self, old: BlockHandle, new: BlockHandle) -> usize {
        if old == new {
            return 0;
        }
        let mut replaced = 0;
        for handle in self.directory.values_mut().filter(|handle| **handle == old) {
            *handle = new;
            replaced += 1;
        }
        if replaced > 0 {
            debug!(
                space = ?self.kind,
                old = old.index(),
                new = new.index(),
                replaced,
                "replaced directory slots"
            );
        }
        replaced
    }

    /// Pairs this directory with `arena` for access.
    pub fn bind<'a>(&'a self, arena: &'a mut BlockArena) -> SpaceAccess<'a> {
        SpaceAccess { space: self, arena }
    }
}

/// Borrowed view resolving addresses through one directory.
#[derive(Debug)]
pub struct SpaceAccess<'a> {
    space: &'a AddressSpace,
    arena: &'a mut BlockArena,
}

#[allow(clippy::cast_possible_truncation)]
const fn span_len(len: usize) -> u32 {
    len as u32
}

impl SpaceAccess<'_> {
    /// Directory backing this view.
    #[must_use]
    pub const fn space(&self) -> &AddressSpace {
        self.space
    }

    /// Block whose range contains `addr`, for reading.
    #[must_use]
    pub fn read_block_at(&self, addr: u32) -> Option<&Block> {
        self.space
            .handle_at(addr)
            .and_then(|handle| self.arena.get(handle))
    }

    /// Block whose range contains `addr`, for writing.
    pub fn write_block_at(&mut self, addr: u32) -> Option<&mut Block> {
        let handle = self.space.handle_at(addr)?;
        self.arena.get_mut(handle)
    }

    /// Reads one byte; unmapped addresses read as [`OPEN_BUS_BYTE`].
    pub fn get_byte(&mut self, addr: u32) -> u8 {
        let offset = block_offset(addr);
        match self.write_block_at(addr).map(|block| block.get_byte(offset)) {
            Some(Ok(value)) => value,
            _ => {
                trace!(addr, "open bus read");
                OPEN_BUS_BYTE
            }
        }
    }

    /// Reads a little-endian word.
    pub fn get_word(&mut self, addr: u32) -> u16 {
        let offset = block_offset(addr);
        if let Some(Ok(value)) = self.write_block_at(addr).map(|block| block.get_word(offset)) {
            return value;
        }
        u16::from_le_bytes(self.compose(addr))
    }

    /// Reads a little-endian doubleword.
    pub fn get_doubleword(&mut self, addr: u32) -> u32 {
        let offset = block_offset(addr);
        if let Some(Ok(value)) = self
            .write_block_at(addr)
            .map(|block| block.get_doubleword(offset))
        {
            return value;
        }
        u32::from_le_bytes(self.compose(addr))
    }

    /// Reads a little-endian quadword.
    pub fn get_quadword(&mut self, addr: u32) -> u64 {
        let offset = block_offset(addr);
        if let Some(Ok(value)) = self
            .write_block_at(addr)
            .map(|block| block.get_quadword(offset))
        {
            return value;
        }
        u64::from_le_bytes(self.compose(addr))
    }

    /// Writes one byte; writes to unmapped addresses are dropped.
    pub fn set_byte(&mut self, addr: u32, value: u8) {
        let offset = block_offset(addr);
        let stored = self
            .write_block_at(addr)
            .is_some_and(|block| block.set_byte(offset, value).is_ok());
        if !stored {
            trace!(addr, value, "dropped write to unmapped address");
        }
    }

    /// Writes a little-endian word.
    pub fn set_word(&mut self, addr: u32, value: u16) {
        let offset = block_offset(addr);
        let stored = self
            .write_block_at(addr)
            .is_some_and(|block| block.set_word(offset, value).is_ok());
        if !stored {
            self.scatter(addr, &value.to_le_bytes());
        }
    }

    /// Writes a little-endian doubleword.
    pub fn set_doubleword(&mut self, addr: u32, value: u32) {
        let offset = block_offset(addr);
        let stored = self
            .write_block_at(addr)
            .is_some_and(|block| block.set_doubleword(offset, value).is_ok());
        if !stored {
            self.scatter(addr, &value.to_le_bytes());
        }
    }

    /// Writes a little-endian quadword.
    pub fn set_quadword(&mut self, addr: u32, value: u64) {
        let offset = block_offset(addr);
        let stored = self
            .write_block_at(addr)
            .is_some_and(|block| block.set_quadword(offset, value).is_ok());
        if !stored {
            self.scatter(addr, &value.to_le_bytes());
        }
    }

    fn compose<const N: usize>(&mut self, addr: u32) -> [u8; N] {
        let mut bytes = [0u8; N];
        for (delta, byte) in (0u32..).zip(bytes.iter_mut()) {
            *byte = self.get_byte(addr.wrapping_add(delta));
        }
        bytes
    }

    fn scatter(&mut self, addr: u32, bytes: &[u8]) {
        for (delta, byte) in (0u32..).zip(bytes) {
            self.set_byte(addr.wrapping_add(delta), *byte);
        }
    }

    /// Fills `dst` from guest memory starting at `addr`, block by block.
    pub fn copy_out(&mut self, addr: u32, dst: &mut [u8]) {
        let mut remaining = dst;
        let mut cur = addr;
        while !remaining.is_empty() {
            let take = bytes_to_block_end(cur).min(remaining.len());
            let (chunk, rest) = std::mem::take(&mut remaining).split_at_mut(take);
            let offset = block_offset(cur);
            let copied = self
                .write_block_at(cur)
                .is_some_and(|block| block.copy_out(offset, chunk).is_ok());
            if !copied {
                for (delta, byte) in (0u32..).zip(chunk.iter_mut()) {
                    *byte = self.get_byte(cur.wrapping_add(delta));
                }
            }
            cur = cur.wrapping_add(span_len(take));
            remaining = rest;
        }
    }

    /// Stores `src` into guest memory starting at `addr`, block by block.
    pub fn copy_in(&mut self, addr: u32, src: &[u8]) {
        let mut remaining = src;
        let mut cur = addr;
        while !remaining.is_empty() {
            let take = bytes_to_block_end(cur).min(remaining.len());
            let (chunk, rest) = remaining.split_at(take);
            let offset = block_offset(cur);
            let copied = self
                .write_block_at(cur)
                .is_some_and(|block| block.copy_in(offset, chunk).is_ok());
            if !copied {
                self.scatter(cur, chunk);
            }
            cur = cur.wrapping_add(span_len(take));
            remaining = rest;
        }
    }

    /// Resets every block mapped in this view.
    pub fn clear(&mut self) {
        for handle in self.space.directory.values() {
            if let Some(block) = self.arena.get_mut(*handle) {
                block.clear();
            }
        }
    }

    /// Returns the code block for the entry point at `addr`.
    ///
    /// The containing block is converted into a code cache first. Cached
    /// translations are reused; otherwise the combiner runs over the block's
    /// bytes followed by the next mapped block, so spanning instructions can
    /// still be decoded.
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Unmapped`] when nothing is mapped at `addr`,
    /// [`MemoryError::UnknownBlock`] for a dangling directory entry and
    /// [`MemoryError::Translation`] when no block can be built.
    pub fn decode_code_block_at<D: Decoder, C: Compiler>(
        &mut self,
        addr: u32,
        combiner: &mut CodeBlockCombiner<D, C>,
    ) -> Result<Rc<dyn CodeBlock>, MemoryError> {
        let handle = self
            .space
            .handle_at(addr)
            .ok_or(MemoryError::Unmapped { addr })?;
        let offset = block_offset(addr);

        let cache = self.arena.convert_to_code_cache(handle)?;
        if let Some(block) = cache.code_block_at(offset) {
            return Ok(block);
        }
        let mut window = cache.contents().to_vec();
        if window.len() == BLOCK_SIZE {
            self.append_next_block(addr, &mut window);
        }

        let mut cursor = ByteCursor::new(&window);
        let block = cursor
            .seek(offset)
            .map_err(CombineError::from)
            .and_then(|()| combiner.combine(&mut cursor))
            .map_err(|source| MemoryError::Translation { addr, source })?;

        if let Some(Block::CodeCache(cache)) = self.arena.get_mut(handle) {
            if !cache.insert_code_block(offset, Rc::clone(&block)) {
                trace!(addr, "spanning block left uncached");
            }
        }
        Ok(block)
    }

    fn append_next_block(&mut self, addr: u32, window: &mut Vec<u8>) {
        let Some(next) = block_index(addr)
            .checked_add(1)
            .and_then(|index| self.space.handle_for_index(index))
        else {
            return;
        };
        let Some(block) = self.arena.get_mut(next) else {
            return;
        };
        let start = window.len();
        window.resize(start + block.size(), 0);
        if block.is_allocated() && block.copy_out(0, &mut window[start..]).is_err() {
            window.truncate(start);
        }
    }

    /// Runs the code block for the entry point at `addr` against `cpu`.
    ///
    /// # Errors
    ///
    /// Propagates the errors of [`SpaceAccess::decode_code_block_at`].
    pub fn execute_at<D: Decoder, C: Compiler>(
        &mut self,
        addr: u32,
        cpu: &mut dyn ExecutionContext,
        combiner: &mut CodeBlockCombiner<D, C>,
    ) -> Result<ExecuteOutcome, MemoryError> {
        let block = self.decode_code_block_at(addr, combiner)?;
        Ok(block.execute(cpu))
    }
}
