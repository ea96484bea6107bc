//! Fusion of short branch chains into compound code blocks.
//!
//! Only one control-flow shape is fused: a block ending in a short jump or
//! near call whose displacement is a decoded immediate and whose target stays
//! inside the same 4 KiB segment. Everything else is left to the ordinary
//! one-block-at-a-time dispatch path.

use std::rc::Rc;

use thiserror::Error;
use tracing::trace;

use crate::codeblock::{CodeBlock, CompoundCodeBlock};
use crate::config::CombinerConfig;
use crate::decode::{
    ByteCursor, CompileError, Compiler, DecodeError, DecodedBlock, Decoder, MicroOp, MicroOpKind,
};

/// Trailing micro-ops eligible to link an entry block to its continuations.
///
/// This is a closed list, not a general "any jump or call" rule.
pub const COMBINABLE_BRANCHES: [MicroOpKind; 4] = [
    MicroOpKind::JzO8,
    MicroOpKind::JnzO8,
    MicroOpKind::JumpO8,
    MicroOpKind::CallO16A16,
];

/// Failure to produce any block at all.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CombineError {
    /// The instruction stream could not be decoded.
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    /// The decoded stream could not be compiled.
    #[error("compile failed: {0}")]
    Compile(#[from] CompileError),
}

/// Reason a fusion attempt fell back to the entry leaf.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Bailout {
    /// The entry block crosses its segment boundary.
    #[error("entry block spans its segment")]
    SpanningEntry,
    /// Too few micro-ops to hold an operand load and a branch.
    #[error("only {count} micro-ops decoded")]
    TooFewMicroOps {
        /// Micro-ops in the entry block.
        count: usize,
    },
    /// The branch operand is not an 8/16-bit immediate load.
    #[error("branch operand is {kind:?}, not a short immediate load")]
    MissingImmediate {
        /// Kind found where the operand load was expected.
        kind: MicroOpKind,
    },
    /// The trailing micro-op is not in [`COMBINABLE_BRANCHES`].
    #[error("trailing {kind:?} is not a combinable branch")]
    UnsupportedBranch {
        /// Trailing micro-op kind.
        kind: MicroOpKind,
    },
    /// The branch lands before the start of the trailing jump.
    #[error("displacement {displacement} lands before the branch instruction")]
    BackwardTarget {
        /// Offending displacement.
        displacement: i32,
    },
    /// The branch displacement exceeds the configured magnitude.
    #[error("displacement {displacement} exceeds limit {limit}")]
    DisplacementTooLarge {
        /// Offending displacement.
        displacement: i32,
        /// Configured limit.
        limit: u32,
    },
    /// A continuation could not be decoded or compiled.
    #[error("continuation at offset {offset:#x} failed: {source}")]
    ContinuationFailed {
        /// Segment offset of the continuation.
        offset: usize,
        /// Underlying failure.
        #[source]
        source: CombineError,
    },
    /// A continuation crosses its segment boundary.
    #[error("continuation at offset {offset:#x} spans its segment")]
    SpanningContinuation {
        /// Segment offset of the continuation.
        offset: usize,
    },
    /// The compound would reach past the segment limit.
    #[error("compound reaches offset {end}, past segment limit {limit}")]
    SegmentOverflow {
        /// Segment offset reached by the offending continuation.
        end: i64,
        /// Configured limit.
        limit: u32,
    },
}

/// Branch that links an entry block to its continuations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailingBranch {
    /// Branch micro-op kind.
    pub kind: MicroOpKind,
    /// Signed displacement from the end of the branch instruction.
    pub displacement: i32,
    /// Byte length of the branch instruction.
    pub instruction_length: u8,
}

/// Checks the last micro-ops of a block for a fusable branch.
///
/// # Errors
///
/// Returns the first [`Bailout`] condition the stream violates.
pub fn trailing_branch(ops: &[MicroOp], config: &CombinerConfig) -> Result<TrailingBranch, Bailout> {
    if ops.len() < config.min_micro_ops.max(3) {
        return Err(Bailout::TooFewMicroOps { count: ops.len() });
    }
    let operand = ops[ops.len() - 3];
    let branch = ops[ops.len() - 1];

    if !operand.kind.is_short_immediate_load() {
        return Err(Bailout::MissingImmediate { kind: operand.kind });
    }
    if !COMBINABLE_BRANCHES.contains(&branch.kind) {
        return Err(Bailout::UnsupportedBranch { kind: branch.kind });
    }

    let displacement = operand.signed_immediate();
    if displacement + i32::from(branch.instruction_length) < 0 {
        return Err(Bailout::BackwardTarget { displacement });
    }
    if displacement.unsigned_abs() > config.max_displacement {
        return Err(Bailout::DisplacementTooLarge {
            displacement,
            limit: config.max_displacement,
        });
    }

    Ok(TrailingBranch {
        kind: branch.kind,
        displacement,
        instruction_length: branch.instruction_length,
    })
}

/// Saturating counters describing combiner activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CombinerStats {
    /// Top-level combination requests.
    pub attempts: u64,
    /// Requests answered with a compound block.
    pub compounds: u64,
    /// Requests answered with a single leaf.
    pub leaves: u64,
    /// Requests that produced no block.
    pub failures: u64,
    /// Fusion attempts abandoned at any depth.
    pub bailouts: u64,
}

impl CombinerStats {
    fn record(&mut self, result: &Result<Rc<dyn CodeBlock>, CombineError>) {
        self.attempts = self.attempts.saturating_add(1);
        match result {
            Ok(block) if block.as_compound().is_some() => {
                self.compounds = self.compounds.saturating_add(1);
            }
            Ok(_) => self.leaves = self.leaves.saturating_add(1),
            Err(_) => self.failures = self.failures.saturating_add(1),
        }
    }
}

/// Builds leaf or compound blocks for entry points inside one segment.
#[derive(Debug)]
pub struct CodeBlockCombiner<D, C> {
    decoder: D,
    compiler: C,
    config: CombinerConfig,
    depth: u8,
    stats: CombinerStats,
}

impl<D: Decoder, C: Compiler> CodeBlockCombiner<D, C> {
    /// Creates a combiner with the default configuration.
    pub fn new(decoder: D, compiler: C) -> Self {
        Self::with_config(decoder, compiler, CombinerConfig::default())
    }

    /// Creates a combiner with an explicit configuration.
    pub const fn with_config(decoder: D, compiler: C, config: CombinerConfig) -> Self {
        Self {
            decoder,
            compiler,
            config,
            depth: 0,
            stats: CombinerStats {
                attempts: 0,
                compounds: 0,
                leaves: 0,
                failures: 0,
                bailouts: 0,
            },
        }
    }

    /// Active configuration.
    pub const fn config(&self) -> &CombinerConfig {
        &self.config
    }

    /// Activity counters since construction.
    pub const fn stats(&self) -> CombinerStats {
        self.stats
    }

    /// Decoder collaborator.
    pub const fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Compiler collaborator.
    pub const fn compiler(&self) -> &C {
        &self.compiler
    }

    /// Builds the best block for the entry point at the cursor position.
    ///
    /// Every fusion problem degrades to returning the entry leaf; only a
    /// failure to produce the entry leaf itself is reported.
    ///
    /// # Errors
    ///
    /// Returns [`CombineError`] when the entry block cannot be decoded or
    /// compiled.
    pub fn combine(
        &mut self,
        cursor: &mut ByteCursor<'_>,
    ) -> Result<Rc<dyn CodeBlock>, CombineError> {
        self.depth = 0;
        let start = cursor.position();
        let result = if self.config.enabled {
            self.resolve(cursor, start)
        } else {
            self.compile_leaf(cursor, start)
        };
        self.stats.record(&result);
        result
    }

    /// Decodes and compiles a single leaf at `start`, without fusion.
    ///
    /// # Errors
    ///
    /// Returns [`CombineError`] when decoding or compiling fails.
    pub fn compile_leaf(
        &mut self,
        cursor: &mut ByteCursor<'_>,
        start: usize,
    ) -> Result<Rc<dyn CodeBlock>, CombineError> {
        let (_, block) = self.decode_and_compile(cursor, start)?;
        Ok(block)
    }

    fn decode_and_compile(
        &mut self,
        cursor: &mut ByteCursor<'_>,
        start: usize,
    ) -> Result<(DecodedBlock, Rc<dyn CodeBlock>), CombineError> {
        cursor.seek(start)?;
        let decoded = self.decoder.decode(cursor)?;
        let block = self.compiler.compile(&decoded)?;
        Ok((decoded, block))
    }

    fn resolve(
        &mut self,
        cursor: &mut ByteCursor<'_>,
        start: usize,
    ) -> Result<Rc<dyn CodeBlock>, CombineError> {
        let (decoded, entry) = self.decode_and_compile(cursor, start)?;
        match self.fuse(cursor, start, &decoded, &entry) {
            Ok(compound) => Ok(Rc::new(compound)),
            Err(reason) => {
                trace!(start, depth = self.depth, %reason, "combination fell back to leaf");
                self.stats.bailouts = self.stats.bailouts.saturating_add(1);
                Ok(entry)
            }
        }
    }

    fn fuse(
        &mut self,
        cursor: &mut ByteCursor<'_>,
        start: usize,
        decoded: &DecodedBlock,
        entry: &Rc<dyn CodeBlock>,
    ) -> Result<CompoundCodeBlock, Bailout> {
        if entry.is_spanning() {
            return Err(Bailout::SpanningEntry);
        }
        let branch = trailing_branch(&decoded.ops, &self.config)?;

        let fallthrough_start = start + entry.byte_length() as usize;
        let target_start = usize::try_from(
            i64::try_from(fallthrough_start).unwrap_or(i64::MAX) + i64::from(branch.displacement),
        )
        .map_err(|_| Bailout::BackwardTarget {
            displacement: branch.displacement,
        })?;

        self.depth += 1;
        let continuations = self
            .continuation(cursor, fallthrough_start)
            .and_then(|fallthrough| Ok((fallthrough, self.continuation(cursor, target_start)?)));
        self.depth -= 1;
        let (fallthrough, target) = continuations?;

        if fallthrough.is_spanning() {
            return Err(Bailout::SpanningContinuation {
                offset: fallthrough_start,
            });
        }
        if target.is_spanning() {
            return Err(Bailout::SpanningContinuation {
                offset: target_start,
            });
        }

        let entry_end = i64::try_from(fallthrough_start).unwrap_or(i64::MAX);
        let fallthrough_end = entry_end + i64::from(fallthrough.byte_length());
        let target_end =
            entry_end + i64::from(branch.displacement) + i64::from(target.byte_length());
        let limit = self.config.segment_limit;
        for end in [fallthrough_end, target_end] {
            if end > i64::from(limit) {
                return Err(Bailout::SegmentOverflow { end, limit });
            }
        }

        Ok(CompoundCodeBlock::new(
            Rc::clone(entry),
            fallthrough,
            target,
            u32::try_from(start).unwrap_or(u32::MAX),
            branch.displacement,
        ))
    }

    fn continuation(
        &mut self,
        cursor: &mut ByteCursor<'_>,
        offset: usize,
    ) -> Result<Rc<dyn CodeBlock>, Bailout> {
        let result = if self.depth < self.config.max_depth {
            self.resolve(cursor, offset)
        } else {
            self.compile_leaf(cursor, offset)
        };
        result.map_err(|source| Bailout::ContinuationFailed { offset, source })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{trailing_branch, Bailout, TrailingBranch};
    use crate::config::CombinerConfig;
    use crate::decode::{MicroOp, MicroOpKind};

    fn stream(operand: MicroOp, branch: MicroOpKind, branch_len: u8) -> Vec<MicroOp> {
        vec![
            MicroOp::new(MicroOpKind::LoadRegister, 2),
            MicroOp::new(MicroOpKind::Alu, 2),
            operand,
            MicroOp::new(MicroOpKind::UpdateInstructionPointer, branch_len),
            MicroOp::new(branch, branch_len),
        ]
    }

    fn imm8(value: u8) -> MicroOp {
        MicroOp::with_immediate(MicroOpKind::LoadImmediate8, u32::from(value), 2)
    }

    #[rstest]
    #[case::jz(MicroOpKind::JzO8)]
    #[case::jnz(MicroOpKind::JnzO8)]
    #[case::jump(MicroOpKind::JumpO8)]
    #[case::call(MicroOpKind::CallO16A16)]
    fn whitelisted_branches_are_accepted(#[case] kind: MicroOpKind) {
        let ops = stream(imm8(0x10), kind, 2);
        assert_eq!(
            trailing_branch(&ops, &CombinerConfig::default()),
            Ok(TrailingBranch {
                kind,
                displacement: 0x10,
                instruction_length: 2
            })
        );
    }

    #[rstest]
    #[case::near_jump(MicroOpKind::JumpO16)]
    #[case::other_condition(MicroOpKind::JccO8)]
    #[case::indirect(MicroOpKind::JumpIndirect)]
    #[case::ret(MicroOpKind::Return)]
    #[case::halt(MicroOpKind::Halt)]
    fn branches_outside_the_closed_list_are_rejected(#[case] kind: MicroOpKind) {
        let ops = stream(imm8(0x10), kind, 2);
        assert_eq!(
            trailing_branch(&ops, &CombinerConfig::default()),
            Err(Bailout::UnsupportedBranch { kind })
        );
    }

    #[test]
    fn short_streams_are_rejected() {
        let ops = stream(imm8(0), MicroOpKind::JzO8, 2);
        assert_eq!(
            trailing_branch(&ops[1..], &CombinerConfig::default()),
            Err(Bailout::TooFewMicroOps { count: 4 })
        );
    }

    #[test]
    fn operand_must_be_short_immediate_load() {
        let operand = MicroOp::with_immediate(MicroOpKind::LoadImmediate32, 4, 5);
        let ops = stream(operand, MicroOpKind::JumpO8, 2);
        assert_eq!(
            trailing_branch(&ops, &CombinerConfig::default()),
            Err(Bailout::MissingImmediate {
                kind: MicroOpKind::LoadImmediate32
            })
        );
    }

    #[test]
    fn displacement_may_reach_back_to_the_branch_itself() {
        let ops = stream(imm8(0xFE), MicroOpKind::JumpO8, 2);
        assert_eq!(
            trailing_branch(&ops, &CombinerConfig::default()).map(|b| b.displacement),
            Ok(-2)
        );

        let ops = stream(imm8(0xFD), MicroOpKind::JumpO8, 2);
        assert_eq!(
            trailing_branch(&ops, &CombinerConfig::default()),
            Err(Bailout::BackwardTarget { displacement: -3 })
        );
    }

    #[test]
    fn displacement_magnitude_is_bounded() {
        let operand = MicroOp::with_immediate(MicroOpKind::LoadImmediate16, 300, 3);
        let ops = stream(operand, MicroOpKind::CallO16A16, 3);
        assert_eq!(
            trailing_branch(&ops, &CombinerConfig::default()),
            Err(Bailout::DisplacementTooLarge {
                displacement: 300,
                limit: 255
            })
        );

        let operand = MicroOp::with_immediate(MicroOpKind::LoadImmediate16, 255, 3);
        let ops = stream(operand, MicroOpKind::CallO16A16, 3);
        assert!(trailing_branch(&ops, &CombinerConfig::default()).is_ok());
    }
}
