//! Block that caches compiled code per entry offset alongside its bytes.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use tracing::trace;

use super::block::{check_bounds, BlockError, MemoryBlock};
use super::BLOCK_SIZE;
use crate::codeblock::CodeBlock;

#[derive(Clone)]
struct CachedCode {
    block: Rc<dyn CodeBlock>,
    end: usize,
}

/// Memory block that also holds compiled code keyed by entry offset.
///
/// Any write overlapping a cached block's byte range evicts that block. A
/// cache built over ROM contents is read-only and drops guest writes.
#[derive(Clone)]
pub struct CodeCacheBlock {
    data: Box<[u8]>,
    writable: bool,
    entries: BTreeMap<usize, CachedCode>,
}

impl fmt::Debug for CodeCacheBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeCacheBlock")
            .field("size", &self.data.len())
            .field("writable", &self.writable)
            .field("cached", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for CodeCacheBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeCacheBlock {
    /// Creates a zeroed, writable, empty cache block.
    #[must_use]
    pub fn new() -> Self {
        Self::from_contents(vec![0u8; BLOCK_SIZE].into_boxed_slice(), true)
    }

    /// Wraps existing block contents.
    #[must_use]
    pub fn from_contents(data: Box<[u8]>, writable: bool) -> Self {
        Self {
            data,
            writable,
            entries: BTreeMap::new(),
        }
    }

    /// Returns `false` when the contents came from ROM.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.writable
    }

    /// Raw block contents.
    #[must_use]
    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    /// Number of cached entry points.
    #[must_use]
    pub fn cached_count(&self) -> usize {
        self.entries.len()
    }

    /// Returns the block cached for `offset`, if any.
    #[must_use]
    pub fn code_block_at(&self, offset: usize) -> Option<Rc<dyn CodeBlock>> {
        self.entries.get(&offset).map(|entry| Rc::clone(&entry.block))
    }

    /// Caches `block` for `offset`, replacing any previous entry.
    ///
    /// Spanning blocks are not cached: their tail lives in another block whose
    /// writes this cache never sees. Returns whether the block was cached.
    pub fn insert_code_block(&mut self, offset: usize, block: Rc<dyn CodeBlock>) -> bool {
        if block.is_spanning() {
            return false;
        }
        let end = offset.saturating_add(block.byte_length() as usize);
        self.entries.insert(offset, CachedCode { block, end });
        true
    }

    /// Evicts every cached block overlapping `[offset, offset + len)`.
    ///
    /// Returns the number of evicted blocks.
    pub fn invalidate(&mut self, offset: usize, len: usize) -> usize {
        if len == 0 || self.entries.is_empty() {
            return 0;
        }
        let write_end = offset.saturating_add(len);
        let before = self.entries.len();
        self.entries
            .retain(|&start, entry| start >= write_end || entry.end <= offset);
        let evicted = before - self.entries.len();
        if evicted > 0 {
            trace!(offset, len, evicted, "invalidated cached code");
        }
        evicted
    }
}

impl MemoryBlock for CodeCacheBlock {
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
        if !self.writable {
            trace!(offset, len = src.len(), "dropping write to rom code cache");
            return Ok(());
        }
        self.data[offset..offset + src.len()].copy_from_slice(src);
        self.invalidate(offset, src.len());
        Ok(())
    }

    fn clear(&mut self) {
        if self.writable {
            self.data.fill(0);
        }
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::CodeCacheBlock;
    use crate::codeblock::{CodeBlock, ExecuteOutcome, ExecutionContext};
    use crate::memory::MemoryBlock;

    #[derive(Debug)]
    struct Fixed {
        len: u32,
        spanning: bool,
    }

    impl CodeBlock for Fixed {
        fn byte_length(&self) -> u32 {
            self.len
        }

        fn instruction_count(&self) -> u32 {
            1
        }

        fn execute(&self, _cpu: &mut dyn ExecutionContext) -> ExecuteOutcome {
            ExecuteOutcome::Retired {
                instructions: 1,
                branch_taken: false,
            }
        }

        fn is_spanning(&self) -> bool {
            self.spanning
        }
    }

    fn fixed(len: u32) -> Rc<dyn CodeBlock> {
        Rc::new(Fixed {
            len,
            spanning: false,
        })
    }

    #[test]
    fn writes_evict_only_overlapping_blocks() {
        let mut cache = CodeCacheBlock::new();
        assert!(cache.insert_code_block(0x10, fixed(4)));
        assert!(cache.insert_code_block(0x20, fixed(8)));

        cache.set_byte(0x14, 0x90).expect("in bounds");
        assert_eq!(cache.cached_count(), 2);

        cache.set_word(0x13, 0x9090).expect("in bounds");
        assert!(cache.code_block_at(0x10).is_none());
        assert!(cache.code_block_at(0x20).is_some());

        cache.copy_in(0x27, &[0xCC]).expect("in bounds");
        assert_eq!(cache.cached_count(), 0);
    }

    #[test]
    fn spanning_blocks_are_never_cached() {
        let mut cache = CodeCacheBlock::new();
        let spanning: Rc<dyn CodeBlock> = Rc::new(Fixed {
            len: 6,
            spanning: true,
        });
        assert!(!cache.insert_code_block(0xFFC, spanning));
        assert_eq!(cache.cached_count(), 0);
    }

    #[test]
    fn read_only_cache_drops_writes_and_keeps_code() {
        let mut cache = CodeCacheBlock::from_contents(vec![0xF4; 16].into_boxed_slice(), false);
        cache.insert_code_block(0, fixed(1));
        cache.set_byte(0, 0x90).expect("in bounds");
        assert_eq!(cache.get_byte(0), Ok(0xF4));
        assert_eq!(cache.cached_count(), 1);

        cache.clear();
        assert_eq!(cache.get_byte(0), Ok(0xF4));
        assert_eq!(cache.cached_count(), 0);
    }

    #[test]
    fn clear_zeroes_writable_contents() {
        let mut cache = CodeCacheBlock::new();
        cache.set_doubleword(0, 0x1234_5678).expect("in bounds");
        cache.insert_code_block(0, fixed(4));
        cache.clear();
        assert_eq!(cache.get_doubleword(0), Ok(0));
        assert_eq!(cache.cached_count(), 0);
    }
}
