//! Executable code-block capability set and the compound block built by the combiner.

use std::any::Any;
use std::fmt;
use std::rc::Rc;

use crate::mode::{CpuMode, ModeSwitch};

/// Processor state handed to executing blocks.
///
/// The concrete register model lives outside this crate; blocks produced by
/// an external compiler recover it through [`ExecutionContext::as_any_mut`].
pub trait ExecutionContext {
    /// Mode the processor is currently executing in.
    fn mode(&self) -> CpuMode;

    /// Gives blocks access to the concrete processor type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Result of executing one code block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// The block ran to completion.
    Retired {
        /// Instructions retired by the block.
        instructions: u32,
        /// Whether the block's trailing branch was taken.
        branch_taken: bool,
    },
    /// The block requested a mode switch; dispatch must resume in the new mode.
    ModeSwitch {
        /// Pre-built signal naming the target mode.
        signal: ModeSwitch,
        /// Instructions retired before the switch.
        instructions: u32,
    },
}

impl ExecuteOutcome {
    /// Instructions retired by the step that produced this outcome.
    #[must_use]
    pub const fn instructions(self) -> u32 {
        match self {
            Self::Retired { instructions, .. } | Self::ModeSwitch { instructions, .. } => {
                instructions
            }
        }
    }

    /// Returns the mode-switch signal, if any.
    #[must_use]
    pub const fn mode_switch(self) -> Option<ModeSwitch> {
        match self {
            Self::ModeSwitch { signal, .. } => Some(signal),
            Self::Retired { .. } => None,
        }
    }

    const fn after(self, prior: u32) -> Self {
        match self {
            Self::Retired {
                instructions,
                branch_taken,
            } => Self::Retired {
                instructions: instructions.saturating_add(prior),
                branch_taken,
            },
            Self::ModeSwitch {
                signal,
                instructions,
            } => Self::ModeSwitch {
                signal,
                instructions: instructions.saturating_add(prior),
            },
        }
    }
}

/// Executable unit produced by compiling one decoded instruction stream.
pub trait CodeBlock: fmt::Debug {
    /// Guest bytes covered by the block, measured from its entry offset.
    fn byte_length(&self) -> u32;

    /// Number of guest instructions in the block.
    fn instruction_count(&self) -> u32;

    /// Runs the block against `cpu`.
    fn execute(&self, cpu: &mut dyn ExecutionContext) -> ExecuteOutcome;

    /// Returns `true` when the block's bytes cross its 4 KiB segment boundary.
    fn is_spanning(&self) -> bool;

    /// Downcast hook for blocks built by the combiner.
    fn as_compound(&self) -> Option<&CompoundCodeBlock> {
        None
    }
}

/// Entry block fused with both of its continuations.
///
/// Runs `entry`, then `target` when the entry's trailing branch was taken and
/// `fallthrough` otherwise.
#[derive(Debug, Clone)]
pub struct CompoundCodeBlock {
    entry: Rc<dyn CodeBlock>,
    fallthrough: Rc<dyn CodeBlock>,
    target: Rc<dyn CodeBlock>,
    start: u32,
    displacement: i32,
    byte_length: u32,
}

impl CompoundCodeBlock {
    /// Fuses `entry` with its continuations.
    ///
    /// `start` is the entry's offset inside its segment and `displacement` the
    /// branch displacement measured from the end of `entry`.
    #[must_use]
    pub fn new(
        entry: Rc<dyn CodeBlock>,
        fallthrough: Rc<dyn CodeBlock>,
        target: Rc<dyn CodeBlock>,
        start: u32,
        displacement: i32,
    ) -> Self {
        let entry_len = i64::from(entry.byte_length());
        let fallthrough_end = entry_len + i64::from(fallthrough.byte_length());
        let target_end = entry_len + i64::from(displacement) + i64::from(target.byte_length());
        let extent = fallthrough_end.max(target_end).max(entry_len);
        let byte_length = u32::try_from(extent).unwrap_or(u32::MAX);

        Self {
            entry,
            fallthrough,
            target,
            start,
            displacement,
            byte_length,
        }
    }

    /// Block executed first.
    #[must_use]
    pub fn entry(&self) -> &Rc<dyn CodeBlock> {
        &self.entry
    }

    /// Block executed when the entry's branch is not taken.
    #[must_use]
    pub fn fallthrough(&self) -> &Rc<dyn CodeBlock> {
        &self.fallthrough
    }

    /// Block executed when the entry's branch is taken.
    #[must_use]
    pub fn target(&self) -> &Rc<dyn CodeBlock> {
        &self.target
    }

    /// Offset of the entry block inside its segment.
    #[must_use]
    pub const fn start(&self) -> u32 {
        self.start
    }

    /// Branch displacement from the end of the entry block to the target.
    #[must_use]
    pub const fn displacement(&self) -> i32 {
        self.displacement
    }
}

impl CodeBlock for CompoundCodeBlock {
    fn byte_length(&self) -> u32 {
        self.byte_length
    }

    fn instruction_count(&self) -> u32 {
        let tail = self
            .fallthrough
            .instruction_count()
            .max(self.target.instruction_count());
        self.entry.instruction_count().saturating_add(tail)
    }

    fn execute(&self, cpu: &mut dyn ExecutionContext) -> ExecuteOutcome {
        let (retired, taken) = match self.entry.execute(cpu) {
            ExecuteOutcome::Retired {
                instructions,
                branch_taken,
            } => (instructions, branch_taken),
            switch @ ExecuteOutcome::ModeSwitch { .. } => return switch,
        };
        let next = if taken { &self.target } else { &self.fallthrough };
        next.execute(cpu).after(retired)
    }

    fn is_spanning(&self) -> bool {
        false
    }

    fn as_compound(&self) -> Option<&CompoundCodeBlock> {
        Some(self)
    }
}

/// Number of compound levels stacked on top of the leaves of `block`.
#[must_use]
pub fn nesting_depth(block: &dyn CodeBlock) -> u32 {
    block.as_compound().map_or(0, |compound| {
        let children = nesting_depth(compound.fallthrough().as_ref())
            .max(nesting_depth(compound.target().as_ref()));
        children + 1
    })
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::{nesting_depth, CodeBlock, CompoundCodeBlock, ExecuteOutcome, ExecutionContext};
    use crate::mode::{CpuMode, ModeSwitch};

    #[derive(Default)]
    struct TraceCpu {
        trail: RefCell<Vec<&'static str>>,
    }

    impl ExecutionContext for TraceCpu {
        fn mode(&self) -> CpuMode {
            CpuMode::Real
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[derive(Debug)]
    struct Step {
        name: &'static str,
        len: u32,
        count: u32,
        outcome: ExecuteOutcome,
    }

    impl Step {
        fn new(name: &'static str, len: u32, count: u32, taken: bool) -> Rc<dyn CodeBlock> {
            Rc::new(Self {
                name,
                len,
                count,
                outcome: ExecuteOutcome::Retired {
                    instructions: count,
                    branch_taken: taken,
                },
            })
        }
    }

    impl CodeBlock for Step {
        fn byte_length(&self) -> u32 {
            self.len
        }

        fn instruction_count(&self) -> u32 {
            self.count
        }

        fn execute(&self, cpu: &mut dyn ExecutionContext) -> ExecuteOutcome {
            let cpu = cpu
                .as_any_mut()
                .downcast_mut::<TraceCpu>()
                .expect("trace cpu");
            cpu.trail.borrow_mut().push(self.name);
            self.outcome
        }

        fn is_spanning(&self) -> bool {
            false
        }
    }

    #[test]
    fn taken_branch_runs_target() {
        let compound = CompoundCodeBlock::new(
            Step::new("entry", 4, 2, true),
            Step::new("fall", 3, 1, false),
            Step::new("target", 5, 3, false),
            0x100,
            6,
        );
        let mut cpu = TraceCpu::default();
        let outcome = compound.execute(&mut cpu);
        assert_eq!(*cpu.trail.borrow(), vec!["entry", "target"]);
        assert_eq!(outcome.instructions(), 5);
    }

    #[test]
    fn untaken_branch_runs_fallthrough() {
        let compound = CompoundCodeBlock::new(
            Step::new("entry", 4, 2, false),
            Step::new("fall", 3, 1, false),
            Step::new("target", 5, 3, false),
            0,
            6,
        );
        let mut cpu = TraceCpu::default();
        assert_eq!(compound.execute(&mut cpu).instructions(), 3);
        assert_eq!(*cpu.trail.borrow(), vec!["entry", "fall"]);
    }

    #[test]
    fn mode_switch_in_entry_stops_the_compound() {
        let entry: Rc<dyn CodeBlock> = Rc::new(Step {
            name: "entry",
            len: 3,
            count: 1,
            outcome: ExecuteOutcome::ModeSwitch {
                signal: ModeSwitch::TO_PROTECTED,
                instructions: 1,
            },
        });
        let compound = CompoundCodeBlock::new(
            entry,
            Step::new("fall", 1, 1, false),
            Step::new("target", 1, 1, false),
            0,
            0,
        );
        let mut cpu = TraceCpu::default();
        let outcome = compound.execute(&mut cpu);
        assert_eq!(outcome.mode_switch(), Some(ModeSwitch::TO_PROTECTED));
        assert_eq!(*cpu.trail.borrow(), vec!["entry"]);
    }

    #[test]
    fn extent_and_counts_cover_both_continuations() {
        let compound = CompoundCodeBlock::new(
            Step::new("entry", 4, 2, false),
            Step::new("fall", 3, 1, false),
            Step::new("target", 5, 3, false),
            0,
            10,
        );
        assert_eq!(compound.byte_length(), 19);
        assert_eq!(compound.instruction_count(), 5);
        assert!(!compound.is_spanning());

        let backwards = CompoundCodeBlock::new(
            Step::new("entry", 4, 2, false),
            Step::new("fall", 3, 1, false),
            Step::new("target", 1, 1, false),
            0,
            -2,
        );
        assert_eq!(backwards.byte_length(), 7);
    }

    #[test]
    fn nesting_depth_counts_compound_levels() {
        let leaf = Step::new("leaf", 1, 1, false);
        assert_eq!(nesting_depth(leaf.as_ref()), 0);

        let inner: Rc<dyn CodeBlock> = Rc::new(CompoundCodeBlock::new(
            leaf.clone(),
            leaf.clone(),
            leaf.clone(),
            0,
            0,
        ));
        let outer = CompoundCodeBlock::new(leaf.clone(), inner, leaf, 0, 0);
        assert_eq!(nesting_depth(&outer), 2);
    }
}
