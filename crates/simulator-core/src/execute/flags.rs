//! FLAGS update behaviors for different instruction classes.

use crate::state::{RegisterFile, FLAGS_C, FLAGS_N, FLAGS_V, FLAGS_Z};

/// Describes how FLAGS should be updated after an instruction executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlagsUpdate {
    /// No change to FLAGS.
    #[default]
    None,
    /// Replace all four condition flags.
    Nzcv {
        /// Zero flag.
        zero: bool,
        /// Negative flag.
        negative: bool,
        /// Carry/borrow flag.
        carry: bool,
        /// Overflow flag.
        overflow: bool,
    },
}

impl FlagsUpdate {
    /// Flags for results without carry or overflow semantics.
    #[must_use]
    pub const fn logical(result: u32) -> Self {
        Self::Nzcv {
            zero: result == 0,
            negative: result & 0x8000_0000 != 0,
            carry: false,
            overflow: false,
        }
    }

    /// Flags for `a + b`.
    #[must_use]
    pub const fn add(a: u32, b: u32) -> (u32, Self) {
        let (result, carry) = a.overflowing_add(b);
        let overflow = ((a ^ result) & (b ^ result)) & 0x8000_0000 != 0;
        (
            result,
            Self::Nzcv {
                zero: result == 0,
                negative: result & 0x8000_0000 != 0,
                carry,
                overflow,
            },
        )
    }

    /// Flags for `a - b`; carry means unsigned borrow.
    #[must_use]
    pub const fn sub(a: u32, b: u32) -> (u32, Self) {
        let result = a.wrapping_sub(b);
        let overflow = ((a ^ b) & (a ^ result)) & 0x8000_0000 != 0;
        (
            result,
            Self::Nzcv {
                zero: result == 0,
                negative: result & 0x8000_0000 != 0,
                carry: a < b,
                overflow,
            },
        )
    }

    /// Writes the update into the register file.
    pub const fn apply(self, regs: &mut RegisterFile) {
        if let Self::Nzcv {
            zero,
            negative,
            carry,
            overflow,
        } = self
        {
            regs.set_flag(FLAGS_Z, zero);
            regs.set_flag(FLAGS_N, negative);
            regs.set_flag(FLAGS_C, carry);
            regs.set_flag(FLAGS_V, overflow);
        }
    }
}
