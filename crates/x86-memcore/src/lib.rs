//! Paged guest memory and basic-block combining core for an x86 PC emulator.

/// Paged memory blocks, the block arena and address-space views.
pub mod memory;
pub use memory::{
    block_base, block_index, block_offset, bytes_to_block_end, AddressSpace, Block, BlockArena,
    BlockError, BlockHandle, CodeCacheBlock, LazyBlock, MemoryBlock, MemorySystem, RamBlock,
    RomBlock, SpaceAccess, SpaceKind, ADDRESS_SPACE_BYTES, BLOCK_COUNT, BLOCK_MASK, BLOCK_SHIFT,
    BLOCK_SIZE, OPEN_BUS_BYTE,
};

/// Address-space level error taxonomy.
pub mod error;
pub use error::MemoryError;

/// Processor mode tags and mode-switch signals.
pub mod mode;
pub use mode::{CpuMode, ModeSwitch};

/// Executable code-block capability set and compound blocks.
pub mod codeblock;
pub use codeblock::{nesting_depth, CodeBlock, CompoundCodeBlock, ExecuteOutcome, ExecutionContext};

/// Decoder and compiler collaborator boundary.
pub mod decode;
pub use decode::{
    ByteCursor, CompileError, Compiler, DecodeError, DecodedBlock, Decoder, MicroOp, MicroOpKind,
};

/// Combiner tunables.
pub mod config;
pub use config::CombinerConfig;

/// Branch-chain fusion into compound blocks.
pub mod combiner;
pub use combiner::{
    trailing_branch, Bailout, CodeBlockCombiner, CombineError, CombinerStats, TrailingBranch,
    COMBINABLE_BRANCHES,
};

#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
