//! Capability set shared by every block variant.

use thiserror::Error;

/// Bounds violation reported by a single block.
///
/// Address spaces treat this as a signal to retry the access byte-by-byte
/// across neighbouring blocks; it never reaches the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum BlockError {
    /// The access does not fit between `offset` and the end of the block.
    #[error("access of {width} bytes at offset {offset:#x} exceeds block size {size:#x}")]
    OutOfBounds {
        /// Block-local offset of the first byte.
        offset: usize,
        /// Width of the access in bytes.
        width: usize,
        /// Logical size of the block.
        size: usize,
    },
}

/// Validates that `width` bytes starting at `offset` fit in a block of `size` bytes.
///
/// # Errors
///
/// Returns [`BlockError::OutOfBounds`] when the range runs past `size`.
pub const fn check_bounds(offset: usize, width: usize, size: usize) -> Result<(), BlockError> {
    match offset.checked_add(width) {
        Some(end) if end <= size => Ok(()),
        _ => Err(BlockError::OutOfBounds {
            offset,
            width,
            size,
        }),
    }
}

/// Fixed-capacity byte container backing one 4 KiB slice of guest memory.
///
/// Multi-byte values are little-endian. Reads take `&mut self` because some
/// variants allocate their backing buffer on first touch.
pub trait MemoryBlock {
    /// Logical size of the block in bytes.
    fn size(&self) -> usize;

    /// Copies `dst.len()` bytes starting at `offset` into `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::OutOfBounds`] when the range does not fit.
    fn copy_out(&mut self, offset: usize, dst: &mut [u8]) -> Result<(), BlockError>;

    /// Copies `src` into the block starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::OutOfBounds`] when the range does not fit.
    fn copy_in(&mut self, offset: usize, src: &[u8]) -> Result<(), BlockError>;

    /// Resets the block to its empty state.
    fn clear(&mut self);

    /// Returns `true` once backing storage exists.
    fn is_allocated(&self) -> bool {
        true
    }

    /// Reads one byte.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::OutOfBounds`] when `offset` is past the end.
    fn get_byte(&mut self, offset: usize) -> Result<u8, BlockError> {
        let mut buf = [0u8; 1];
        self.copy_out(offset, &mut buf)?;
        Ok(buf[0])
    }

    /// Reads a little-endian 16-bit value.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::OutOfBounds`] when the value straddles the end.
    fn get_word(&mut self, offset: usize) -> Result<u16, BlockError> {
        let mut buf = [0u8; 2];
        self.copy_out(offset, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads a little-endian 32-bit value.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::OutOfBounds`] when the value straddles the end.
    fn get_doubleword(&mut self, offset: usize) -> Result<u32, BlockError> {
        let mut buf = [0u8; 4];
        self.copy_out(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Reads a little-endian 64-bit value.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::OutOfBounds`] when the value straddles the end.
    fn get_quadword(&mut self, offset: usize) -> Result<u64, BlockError> {
        let mut buf = [0u8; 8];
        self.copy_out(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Writes one byte.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::OutOfBounds`] when `offset` is past the end.
    fn set_byte(&mut self, offset: usize, value: u8) -> Result<(), BlockError> {
        self.copy_in(offset, &[value])
    }

    /// Writes a little-endian 16-bit value.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::OutOfBounds`] when the value straddles the end.
    fn set_word(&mut self, offset: usize, value: u16) -> Result<(), BlockError> {
        self.copy_in(offset, &value.to_le_bytes())
    }

    /// Writes a little-endian 32-bit value.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::OutOfBounds`] when the value straddles the end.
    fn set_doubleword(&mut self, offset: usize, value: u32) -> Result<(), BlockError> {
        self.copy_in(offset, &value.to_le_bytes())
    }

    /// Writes a little-endian 64-bit value.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::OutOfBounds`] when the value straddles the end.
    fn set_quadword(&mut self, offset: usize, value: u64) -> Result<(), BlockError> {
        self.copy_in(offset, &value.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::{check_bounds, BlockError};

    #[test]
    fn bounds_accept_exact_fit() {
        assert_eq!(check_bounds(4092, 4, 4096), Ok(()));
        assert_eq!(check_bounds(0, 4096, 4096), Ok(()));
        assert_eq!(check_bounds(4096, 0, 4096), Ok(()));
    }

    #[test]
    fn bounds_reject_straddling_and_overflowing_ranges() {
        assert_eq!(
            check_bounds(4093, 4, 4096),
            Err(BlockError::OutOfBounds {
                offset: 4093,
                width: 4,
                size: 4096
            })
        );
        assert!(check_bounds(usize::MAX, 2, 4096).is_err());
    }
}
