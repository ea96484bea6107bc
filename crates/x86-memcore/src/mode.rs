//! Processor mode tags and the mode-switch signal.

/// x86 execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum CpuMode {
    /// Real-address mode (reset state).
    #[default]
    Real,
    /// Protected mode.
    Protected,
    /// Virtual-8086 mode.
    Virtual8086,
}

/// Request to leave the running block and re-enter dispatch in another mode.
///
/// Returned from an execute step and consumed by the dispatch loop; it is a
/// control transfer, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct ModeSwitch {
    target: CpuMode,
}

impl ModeSwitch {
    /// Switch into real-address mode.
    pub const TO_REAL: Self = Self {
        target: CpuMode::Real,
    };
    /// Switch into protected mode.
    pub const TO_PROTECTED: Self = Self {
        target: CpuMode::Protected,
    };
    /// Switch into virtual-8086 mode.
    pub const TO_VIRTUAL8086: Self = Self {
        target: CpuMode::Virtual8086,
    };

    /// Returns the pre-built signal for `target`.
    #[must_use]
    pub const fn to(target: CpuMode) -> Self {
        match target {
            CpuMode::Real => Self::TO_REAL,
            CpuMode::Protected => Self::TO_PROTECTED,
            CpuMode::Virtual8086 => Self::TO_VIRTUAL8086,
        }
    }

    /// Mode the dispatch loop must resume in.
    #[must_use]
    pub const fn target(self) -> CpuMode {
        self.target
    }
}

#[cfg(test)]
mod tests {
    use super::{CpuMode, ModeSwitch};

    #[test]
    fn reset_mode_is_real() {
        assert_eq!(CpuMode::default(), CpuMode::Real);
    }

    #[test]
    fn signals_carry_their_target_mode() {
        for mode in [CpuMode::Real, CpuMode::Protected, CpuMode::Virtual8086] {
            assert_eq!(ModeSwitch::to(mode).target(), mode);
        }
        assert_eq!(ModeSwitch::to(CpuMode::Protected), ModeSwitch::TO_PROTECTED);
    }
}
