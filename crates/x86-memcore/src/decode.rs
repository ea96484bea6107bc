//! Boundary types shared with the external decoder and compiler.
//!
//! The decoder turns guest bytes into a micro-operation stream; the compiler
//! turns that stream into an executable [`CodeBlock`]. This crate only relies
//! on the kind tag, immediate and instruction length of each micro-op.

use std::rc::Rc;

use thiserror::Error;

use crate::codeblock::CodeBlock;
use crate::memory::BLOCK_SIZE;

/// Errors raised while decoding a guest instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DecodeError {
    /// The decoder read past the bytes available to the cursor.
    #[error("decode ran past the end of the window at offset {offset:#x}")]
    OutOfBounds {
        /// Offset of the first unavailable byte.
        offset: usize,
    },
    /// The byte sequence is not a valid instruction.
    #[error("invalid opcode {opcode:#04x} at offset {offset:#x}")]
    InvalidOpcode {
        /// Offending opcode byte.
        opcode: u8,
        /// Offset of the opcode.
        offset: usize,
    },
    /// The instruction stream produced no instructions.
    #[error("empty instruction stream at offset {offset:#x}")]
    Empty {
        /// Offset where decoding started.
        offset: usize,
    },
}

/// Errors raised while compiling a decoded stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum CompileError {
    /// The compiler does not support a micro-op it was handed.
    #[error("unsupported micro-op {kind:?}")]
    Unsupported {
        /// Rejected micro-op kind.
        kind: MicroOpKind,
    },
    /// Backend-specific failure.
    #[error("code generation failed: {0}")]
    Backend(String),
}

/// Rewindable, skippable reader over a window of guest bytes.
///
/// Offsets are relative to the window start, which is the first byte of the
/// segment being decoded. The window may extend past the segment so that a
/// decoder can follow an instruction stream into the next page.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteCursor<'a> {
    /// Creates a cursor at offset 0 of `bytes`.
    #[must_use]
    pub const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    /// Current read offset.
    #[must_use]
    pub const fn position(&self) -> usize {
        self.position
    }

    /// Total bytes in the window.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` when the window holds no bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Bytes left between the current offset and the end of the window.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.position)
    }

    /// Moves back to offset 0.
    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// Moves to `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::OutOfBounds`] when `offset` is past the window.
    pub fn seek(&mut self, offset: usize) -> Result<(), DecodeError> {
        if offset > self.bytes.len() {
            return Err(DecodeError::OutOfBounds { offset });
        }
        self.position = offset;
        Ok(())
    }

    /// Advances by `count` bytes without reading them.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::OutOfBounds`] when the skip leaves the window.
    pub fn skip(&mut self, count: usize) -> Result<(), DecodeError> {
        let offset = self
            .position
            .checked_add(count)
            .ok_or(DecodeError::OutOfBounds {
                offset: self.position,
            })?;
        self.seek(offset)
    }

    /// Returns the next byte without consuming it.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::OutOfBounds`] at the end of the window.
    pub fn peek(&self) -> Result<u8, DecodeError> {
        self.bytes
            .get(self.position)
            .copied()
            .ok_or(DecodeError::OutOfBounds {
                offset: self.position,
            })
    }

    /// Reads one byte.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::OutOfBounds`] at the end of the window.
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let byte = self.peek()?;
        self.position += 1;
        Ok(byte)
    }

    /// Reads a little-endian 16-bit value.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::OutOfBounds`] when fewer than two bytes remain.
    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Reads a little-endian 32-bit value.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::OutOfBounds`] when fewer than four bytes remain.
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DecodeError> {
        let end = self.position + buf.len();
        let src = self
            .bytes
            .get(self.position..end)
            .ok_or(DecodeError::OutOfBounds {
                offset: self.bytes.len().min(end),
            })?;
        buf.copy_from_slice(src);
        self.position = end;
        Ok(())
    }
}

/// Micro-operation kind tags the combiner distinguishes.
///
/// The jump kinds carry the historical names of the decoder's table: an 8-bit
/// displacement conditional/unconditional jump and a 16-bit near call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MicroOpKind {
    /// Loads an 8-bit immediate (sign-extended when used as a displacement).
    LoadImmediate8,
    /// Loads a 16-bit immediate (sign-extended when used as a displacement).
    LoadImmediate16,
    /// Loads a 32-bit immediate.
    LoadImmediate32,
    /// Reads a register into the operand latch.
    LoadRegister,
    /// Writes the operand latch to a register.
    StoreRegister,
    /// Memory read through a segment.
    LoadMemory,
    /// Memory write through a segment.
    StoreMemory,
    /// Arithmetic or logic operation.
    Alu,
    /// Advances the instruction pointer past the current instruction.
    UpdateInstructionPointer,
    /// Short jump if zero flag set.
    JzO8,
    /// Short jump if zero flag clear.
    JnzO8,
    /// Short unconditional jump.
    JumpO8,
    /// Near call with 16-bit operand and address size.
    CallO16A16,
    /// Near unconditional jump with a 16-bit displacement.
    JumpO16,
    /// Short conditional jump on any other condition.
    JccO8,
    /// Indirect jump through a register or memory operand.
    JumpIndirect,
    /// Near return.
    Return,
    /// Halt until the next interrupt.
    Halt,
    /// Any micro-op the combiner never inspects.
    Other(u16),
}

impl MicroOpKind {
    /// Returns `true` for 8- and 16-bit immediate loads.
    #[must_use]
    pub const fn is_short_immediate_load(self) -> bool {
        matches!(self, Self::LoadImmediate8 | Self::LoadImmediate16)
    }
}

/// One decoded micro-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MicroOp {
    /// Kind tag.
    pub kind: MicroOpKind,
    /// Raw immediate carried by immediate loads; zero otherwise.
    pub immediate: u32,
    /// Byte length of the guest instruction this micro-op belongs to.
    pub instruction_length: u8,
}

impl MicroOp {
    /// Creates a micro-op without an immediate.
    #[must_use]
    pub const fn new(kind: MicroOpKind, instruction_length: u8) -> Self {
        Self {
            kind,
            immediate: 0,
            instruction_length,
        }
    }

    /// Creates a micro-op carrying `immediate`.
    #[must_use]
    pub const fn with_immediate(kind: MicroOpKind, immediate: u32, instruction_length: u8) -> Self {
        Self {
            kind,
            immediate,
            instruction_length,
        }
    }

    /// Immediate sign-extended according to the load width.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub const fn signed_immediate(self) -> i32 {
        match self.kind {
            MicroOpKind::LoadImmediate8 => self.immediate as u8 as i8 as i32,
            MicroOpKind::LoadImmediate16 => self.immediate as u16 as i16 as i32,
            _ => self.immediate as i32,
        }
    }
}

/// Micro-op stream covering one straight-line run of guest instructions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedBlock {
    /// Offset of the first instruction inside the segment.
    pub start: usize,
    /// Guest bytes consumed.
    pub byte_length: usize,
    /// Guest instructions decoded.
    pub instruction_count: u32,
    /// Micro-ops in program order.
    pub ops: Vec<MicroOp>,
}

impl DecodedBlock {
    /// Returns `true` when the decoded bytes run past the end of the segment.
    #[must_use]
    pub const fn crosses_segment(&self) -> bool {
        self.start + self.byte_length > BLOCK_SIZE
    }
}

/// Instruction decoder collaborator.
pub trait Decoder {
    /// Decodes one block starting at the cursor position, leaving the cursor
    /// just past the last decoded byte.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] on malformed bytes or when the window ends
    /// mid-instruction.
    fn decode(&mut self, cursor: &mut ByteCursor<'_>) -> Result<DecodedBlock, DecodeError>;
}

/// Code generator collaborator.
pub trait Compiler {
    /// Compiles `block` into an executable leaf.
    ///
    /// # Errors
    ///
    /// Returns a [`CompileError`] when code generation fails.
    fn compile(&mut self, block: &DecodedBlock) -> Result<Rc<dyn CodeBlock>, CompileError>;
}
