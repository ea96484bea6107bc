//! Eagerly backed block variants.

use tracing::trace;

use super::block::{check_bounds, BlockError, MemoryBlock};
use super::BLOCK_SIZE;

/// Writable block with its buffer allocated up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamBlock {
    data: Box<[u8]>,
}

impl Default for RamBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl RamBlock {
    /// Creates a zeroed full-size block.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: vec![0u8; BLOCK_SIZE].into_boxed_slice(),
        }
    }

    pub(crate) fn take_contents(&mut self) -> Box<[u8]> {
        std::mem::take(&mut self.data)
    }
}

impl MemoryBlock for RamBlock {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn copy_out(&mut self, offset: usize, dst: &mut [u8]) -> Result<(), BlockError> {
        check_bounds(offset, dst.len(), self.data.len())?;
        dst.copy_from_slice(&self.data[offset..offset + dst.len()]);
        Ok(())
    }

    fn copy_in(&mut self, offset: usize, src: &[u8]) -> Result<(), BlockError> {
        check_bounds(offset, src.len(), self.data.len())?;
        self.data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn clear(&mut self) {
        self.data.fill(0);
    }
}

/// Read-only block holding a firmware image slice.
///
/// Guest writes are dropped. `clear` leaves the image intact since the image
/// is part of the machine, not of guest state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RomBlock {
    data: Box<[u8]>,
}

impl RomBlock {
    /// Creates a ROM block from `image`, truncated to [`BLOCK_SIZE`] bytes.
    #[must_use]
    pub fn new(image: &[u8]) -> Self {
        let len = image.len().min(BLOCK_SIZE);
        Self {
            data: image[..len].to_vec().into_boxed_slice(),
        }
    }

    /// Creates a full-size ROM block from `image`, padding the tail with `fill`.
    #[must_use]
    pub fn padded(image: &[u8], fill: u8) -> Self {
        let mut data = vec![fill; BLOCK_SIZE];
        let len = image.len().min(BLOCK_SIZE);
        data[..len].copy_from_slice(&image[..len]);
        Self {
            data: data.into_boxed_slice(),
        }
    }

    pub(crate) fn contents(&self) -> &[u8] {
        &self.data
    }
}

impl MemoryBlock for RomBlock {
    fn size(&self) -> usize {
        self.data.len()
    }

    fn copy_out(&mut self, offset: usize, dst: &mut [u8]) -> Result<(), BlockError> {
        check_bounds(offset, dst.len(), self.data.len())?;
        dst.copy_from_slice(&self.data[offset..offset + dst.len()]);
        Ok(())
    }

    fn copy_in(&mut self, offset: usize, src: &[u8]) -> Result<(), BlockError> {
        check_bounds(offset, src.len(), self.data.len())?;
        trace!(offset, len = src.len(), "dropping write to rom block");
        Ok(())
    }

    fn clear(&mut self) {}
}
