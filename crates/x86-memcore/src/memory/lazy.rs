//! Block whose backing buffer is allocated on first touch.

use super::block::{check_bounds, BlockError, MemoryBlock};
use super::BLOCK_SIZE;

/// Deferred-allocation block.
///
/// The buffer stays `None` until the first read or write. Because nothing can
/// be written before allocation, a zero-filled buffer is always an exact
/// reconstruction of the block's contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LazyBlock {
    size: usize,
    buffer: Option<Box<[u8]>>,
}

impl Default for LazyBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl LazyBlock {
    /// Creates an unallocated full-size block.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_size(BLOCK_SIZE)
    }

    /// Creates an unallocated block of `size` bytes, clamped to [`BLOCK_SIZE`].
    #[must_use]
    pub const fn with_size(size: usize) -> Self {
        let size = if size > BLOCK_SIZE { BLOCK_SIZE } else { size };
        Self { size, buffer: None }
    }

    fn buffer_mut(&mut self) -> &mut [u8] {
        let size = self.size;
        self.buffer
            .get_or_insert_with(|| vec![0u8; size].into_boxed_slice())
    }

    /// Hands the contents over to a new owner, leaving this block unallocated.
    ///
    /// An unallocated block yields a zero-filled buffer.
    pub(crate) fn take_contents(&mut self) -> Box<[u8]> {
        let size = self.size;
        self.buffer
            .take()
            .unwrap_or_else(|| vec![0u8; size].into_boxed_slice())
    }
}

impl MemoryBlock for LazyBlock {
    fn size(&self) -> usize {
        self.size
    }

    fn copy_out(&mut self, offset: usize, dst: &mut [u8]) -> Result<(), BlockError> {
        check_bounds(offset, dst.len(), self.size)?;
        let buffer = self.buffer_mut();
        dst.copy_from_slice(&buffer[offset..offset + dst.len()]);
        Ok(())
    }

    fn copy_in(&mut self, offset: usize, src: &[u8]) -> Result<(), BlockError> {
        check_bounds(offset, src.len(), self.size)?;
        let buffer = self.buffer_mut();
        buffer[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn clear(&mut self) {
        self.buffer = None;
    }

    fn is_allocated(&self) -> bool {
        self.buffer.is_some()
    }
}
