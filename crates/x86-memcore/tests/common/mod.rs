//! Scripted decoder, compiler and processor over a tiny x86 subset.
//!
//! | bytes          | instruction      | micro-ops                               |
//! |----------------|------------------|-----------------------------------------|
//! | `90`           | `nop`            | `Other(0x90)`                           |
//! | `74 ib`        | `jz rel8`        | `LoadImmediate8, UpdateIp, JzO8`        |
//! | `75 ib`        | `jnz rel8`       | `LoadImmediate8, UpdateIp, JnzO8`       |
//! | `EB ib`        | `jmp rel8`       | `LoadImmediate8, UpdateIp, JumpO8`      |
//! | `E8 iw`        | `call rel16`     | `LoadImmediate16, UpdateIp, CallO16A16` |
//! | `E9 iw`        | `jmp rel16`      | `LoadImmediate16, UpdateIp, JumpO16`    |
//! | `C3`           | `ret`            | `Return`                                |
//! | `F4`           | `hlt`            | `Halt`                                  |
//! | `CC`           | `int3`           | `Other(0xCC)`, rejected by the compiler |
//! | `0F 22`        | `mov cr0, eax`   | `Other(0x0F22)`, switches to protected  |
//!
//! Every branch, `ret`, `hlt` and `mov cr0` ends the block.

#![allow(dead_code)]

use std::any::Any;
use std::rc::Rc;

use x86_memcore::{
    ByteCursor, CodeBlock, CompileError, Compiler, CpuMode, DecodeError, DecodedBlock, Decoder,
    ExecuteOutcome, ExecutionContext, MicroOp, MicroOpKind, ModeSwitch, BLOCK_SIZE,
};

const MOV_CR0: u16 = 0x0F22;
const INT3: u16 = 0xCC;
const NOP: u16 = 0x90;

#[derive(Debug, Default)]
pub struct ToyDecoder {
    pub decoded: usize,
    /// Start offset reported in every decoded block instead of the real one.
    pub reported_start: Option<usize>,
}

impl ToyDecoder {
    fn branch(
        ops: &mut Vec<MicroOp>,
        load: MicroOpKind,
        immediate: u32,
        kind: MicroOpKind,
        len: u8,
    ) {
        ops.push(MicroOp::with_immediate(load, immediate, len));
        ops.push(MicroOp::new(MicroOpKind::UpdateInstructionPointer, len));
        ops.push(MicroOp::new(kind, len));
    }
}

impl Decoder for ToyDecoder {
    fn decode(&mut self, cursor: &mut ByteCursor<'_>) -> Result<DecodedBlock, DecodeError> {
        let start = cursor.position();
        let mut ops = Vec::new();
        let mut instruction_count = 0u32;

        loop {
            let offset = cursor.position();
            let Ok(opcode) = cursor.read_u8() else {
                break;
            };
            instruction_count += 1;
            let ends_block = match opcode {
                0x90 => {
                    ops.push(MicroOp::new(MicroOpKind::Other(NOP), 1));
                    false
                }
                0x74 | 0x75 | 0xEB => {
                    let kind = match opcode {
                        0x74 => MicroOpKind::JzO8,
                        0x75 => MicroOpKind::JnzO8,
                        _ => MicroOpKind::JumpO8,
                    };
                    let rel = cursor.read_u8()?;
                    Self::branch(&mut ops, MicroOpKind::LoadImmediate8, rel.into(), kind, 2);
                    true
                }
                0xE8 | 0xE9 => {
                    let kind = if opcode == 0xE8 {
                        MicroOpKind::CallO16A16
                    } else {
                        MicroOpKind::JumpO16
                    };
                    let rel = cursor.read_u16()?;
                    Self::branch(&mut ops, MicroOpKind::LoadImmediate16, rel.into(), kind, 3);
                    true
                }
                0xC3 => {
                    ops.push(MicroOp::new(MicroOpKind::Return, 1));
                    true
                }
                0xF4 => {
                    ops.push(MicroOp::new(MicroOpKind::Halt, 1));
                    true
                }
                0xCC => {
                    ops.push(MicroOp::new(MicroOpKind::Other(INT3), 1));
                    false
                }
                0x0F if cursor.peek() == Ok(0x22) => {
                    cursor.skip(1)?;
                    ops.push(MicroOp::new(MicroOpKind::Other(MOV_CR0), 2));
                    true
                }
                _ => return Err(DecodeError::InvalidOpcode { opcode, offset }),
            };
            if ends_block {
                break;
            }
        }

        if ops.is_empty() {
            return Err(DecodeError::Empty { offset: start });
        }
        self.decoded += 1;
        Ok(DecodedBlock {
            start: self.reported_start.unwrap_or(start),
            byte_length: cursor.position() - start,
            instruction_count,
            ops,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Fallthrough,
    Always,
    IfZero,
    IfNotZero,
    Switch(ModeSwitch),
}

#[derive(Debug)]
pub struct ToyBlock {
    pub start: usize,
    pub len: u32,
    pub count: u32,
    pub spanning: bool,
    pub exit: Exit,
}

impl CodeBlock for ToyBlock {
    fn byte_length(&self) -> u32 {
        self.len
    }

    fn instruction_count(&self) -> u32 {
        self.count
    }

    fn execute(&self, cpu: &mut dyn ExecutionContext) -> ExecuteOutcome {
        let Some(cpu) = cpu.as_any_mut().downcast_mut::<ToyCpu>() else {
            panic!("toy blocks run on the toy processor");
        };
        cpu.trail.push(self.start);
        let branch_taken = match self.exit {
            Exit::Fallthrough => false,
            Exit::Always => true,
            Exit::IfZero => cpu.zero_flag,
            Exit::IfNotZero => !cpu.zero_flag,
            Exit::Switch(signal) => {
                cpu.mode = signal.target();
                return ExecuteOutcome::ModeSwitch {
                    signal,
                    instructions: self.count,
                };
            }
        };
        ExecuteOutcome::Retired {
            instructions: self.count,
            branch_taken,
        }
    }

    fn is_spanning(&self) -> bool {
        self.spanning
    }
}

#[derive(Debug, Default)]
pub struct ToyCompiler {
    pub compiled: usize,
}

impl Compiler for ToyCompiler {
    fn compile(&mut self, block: &DecodedBlock) -> Result<Rc<dyn CodeBlock>, CompileError> {
        let Some(last) = block.ops.last() else {
            return Err(CompileError::Backend("empty block".to_owned()));
        };
        if let Some(op) = block
            .ops
            .iter()
            .find(|op| op.kind == MicroOpKind::Other(INT3))
        {
            return Err(CompileError::Unsupported { kind: op.kind });
        }
        let exit = match last.kind {
            MicroOpKind::JzO8 => Exit::IfZero,
            MicroOpKind::JnzO8 => Exit::IfNotZero,
            MicroOpKind::JumpO8
            | MicroOpKind::JumpO16
            | MicroOpKind::CallO16A16
            | MicroOpKind::Return => Exit::Always,
            MicroOpKind::Other(MOV_CR0) => Exit::Switch(ModeSwitch::TO_PROTECTED),
            _ => Exit::Fallthrough,
        };
        self.compiled += 1;
        Ok(Rc::new(ToyBlock {
            start: block.start,
            len: u32::try_from(block.byte_length).expect("toy blocks are short"),
            count: block.instruction_count,
            spanning: block.crosses_segment(),
            exit,
        }))
    }
}

#[derive(Debug, Default)]
pub struct ToyCpu {
    pub zero_flag: bool,
    pub mode: CpuMode,
    pub trail: Vec<usize>,
}

impl ExecutionContext for ToyCpu {
    fn mode(&self) -> CpuMode {
        self.mode
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Segment-sized window of `ret` bytes with `code` placed at `offset`.
pub fn window_with(offset: usize, code: &[u8]) -> Vec<u8> {
    let mut window = vec![0xC3; BLOCK_SIZE];
    window[offset..offset + code.len()].copy_from_slice(code);
    window
}

/// `nop; nop; jz +0` repeated `count` times, then `ret`.
pub fn jz_chain(count: usize) -> Vec<u8> {
    let mut code = [0x90, 0x90, 0x74, 0x00].repeat(count);
    code.push(0xC3);
    code
}
