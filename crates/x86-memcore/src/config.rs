//! Tunables for block combination.

/// Depth at which the combiner stops fusing and compiles leaves only.
pub const DEFAULT_MAX_DEPTH: u8 = 6;

/// Largest branch displacement magnitude eligible for fusion.
pub const DEFAULT_MAX_DISPLACEMENT: u32 = 255;

/// Highest segment offset a compound block may reach.
pub const DEFAULT_SEGMENT_LIMIT: u32 = 4095;

/// Fewest micro-ops a block needs before its trailing branch is inspected.
pub const DEFAULT_MIN_MICRO_OPS: usize = 5;

/// Configuration for a [`CodeBlockCombiner`](crate::CodeBlockCombiner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct CombinerConfig {
    /// When `false`, every request compiles a single leaf block.
    pub enabled: bool,
    /// Recursion depth at which continuations are compiled as leaves.
    pub max_depth: u8,
    /// Largest accepted branch displacement magnitude.
    pub max_displacement: u32,
    /// Highest segment offset a compound may cover.
    pub segment_limit: u32,
    /// Minimum micro-op count for an entry block to be considered.
    pub min_micro_ops: usize,
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: DEFAULT_MAX_DEPTH,
            max_displacement: DEFAULT_MAX_DISPLACEMENT,
            segment_limit: DEFAULT_SEGMENT_LIMIT,
            min_micro_ops: DEFAULT_MIN_MICRO_OPS,
        }
    }
}

impl CombinerConfig {
    /// Configuration that never fuses blocks.
    #[must_use]
    pub fn leaf_only() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}
