/// Number of general-purpose registers (`r0..r7`).
pub const GENERAL_REGISTER_COUNT: usize = 8;
/// `FLAGS` bit for zero result.
pub const FLAGS_Z: u32 = 1 << 0;
/// `FLAGS` bit for negative result.
pub const FLAGS_N: u32 = 1 << 1;
/// `FLAGS` bit for carry/borrow.
pub const FLAGS_C: u32 = 1 << 2;
/// `FLAGS` bit for signed overflow.
pub const FLAGS_V: u32 = 1 << 3;
/// Mask of architecturally active `FLAGS` bits.
pub const FLAGS_ACTIVE_MASK: u32 = FLAGS_Z | FLAGS_N | FLAGS_C | FLAGS_V;

/// Register operand as encoded in a 4-bit instruction field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Register {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R7 = 7,
    Sp = 8,
}

impl Register {
    /// General-purpose registers in index order.
    pub const GENERAL: [Self; GENERAL_REGISTER_COUNT] = [
        Self::R0,
        Self::R1,
        Self::R2,
        Self::R3,
        Self::R4,
        Self::R5,
        Self::R6,
        Self::R7,
    ];

    /// Decodes a 4-bit register field.
    #[must_use]
    pub const fn from_u4(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::R0),
            1 => Some(Self::R1),
            2 => Some(Self::R2),
            3 => Some(Self::R3),
            4 => Some(Self::R4),
            5 => Some(Self::R5),
            6 => Some(Self::R6),
            7 => Some(Self::R7),
            8 => Some(Self::Sp),
            _ => None,
        }
    }

    /// Field value used when encoding.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// Assembly name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::R0 => "r0",
            Self::R1 => "r1",
            Self::R2 => "r2",
            Self::R3 => "r3",
            Self::R4 => "r4",
            Self::R5 => "r5",
            Self::R6 => "r6",
            Self::R7 => "r7",
            Self::Sp => "sp",
        }
    }
}

/// Per-thread processor state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct RegisterFile {
    gpr: [u32; GENERAL_REGISTER_COUNT],
    sp: u32,
    ip: u32,
    flags: u32,
}

impl RegisterFile {
    /// Register file with everything zeroed except the entry point and stack.
    #[must_use]
    pub const fn at_entry(ip: u32, sp: u32) -> Self {
        Self {
            gpr: [0; GENERAL_REGISTER_COUNT],
            sp,
            ip,
            flags: 0,
        }
    }

    /// Reads any register operand.
    #[must_use]
    pub const fn get(&self, reg: Register) -> u32 {
        match reg {
            Register::Sp => self.sp,
            other => self.gpr[other as usize],
        }
    }

    /// Writes any register operand.
    pub const fn set(&mut self, reg: Register, value: u32) {
        match reg {
            Register::Sp => self.sp = value,
            other => self.gpr[other as usize] = value,
        }
    }

    /// Reads the stack pointer.
    #[must_use]
    pub const fn sp(&self) -> u32 {
        self.sp
    }

    /// Writes the stack pointer.
    pub const fn set_sp(&mut self, value: u32) {
        self.sp = value;
    }

    /// Reads the instruction pointer.
    #[must_use]
    pub const fn ip(&self) -> u32 {
        self.ip
    }

    /// Writes the instruction pointer.
    pub const fn set_ip(&mut self, value: u32) {
        self.ip = value;
    }

    /// Reads `FLAGS`.
    #[must_use]
    pub const fn flags(&self) -> u32 {
        self.flags
    }

    /// Writes `FLAGS`; inactive bits are dropped.
    pub const fn set_flags(&mut self, value: u32) {
        self.flags = value & FLAGS_ACTIVE_MASK;
    }

    /// Returns `true` when a specific `FLAGS` bit is set.
    #[must_use]
    pub const fn flag_is_set(&self, flag: u32) -> bool {
        (self.flags & flag) != 0
    }

    /// Sets or clears a specific `FLAGS` bit.
    pub const fn set_flag(&mut self, flag: u32, enabled: bool) {
        if enabled {
            self.flags |= flag & FLAGS_ACTIVE_MASK;
        } else {
            self.flags &= !(flag & FLAGS_ACTIVE_MASK);
        }
    }
}
