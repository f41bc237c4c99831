use thiserror::Error;

use crate::signal::Signal;

/// Fault classes used to pick the signal a guest fault is converted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum FaultClass {
    /// Decoder rejected an instruction encoding.
    Decode,
    /// Data access or fetch hit an unmapped or protected address.
    Memory,
    /// Arithmetic exception such as division by zero.
    Arithmetic,
}

/// Stable taxonomy of guest-visible faults raised while stepping a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum FaultCode {
    /// Register field or fixed field outside its legal range.
    #[error("illegal instruction encoding")]
    IllegalEncoding = 0x01,
    /// Instruction that is defined to always trap (`ud`).
    #[error("undefined instruction")]
    UndefinedInstruction = 0x02,
    /// Fetch from an address that is unmapped or lacks execute permission.
    #[error("instruction fetch from non-executable memory")]
    NonExecutableFetch = 0x03,
    /// Data access to an address outside every mapped segment.
    #[error("access to unmapped memory")]
    UnmappedAccess = 0x04,
    /// Data access that lacks the required read or write permission.
    #[error("memory protection violation")]
    ProtectionViolation = 0x05,
    /// `divu`/`remu` with a zero divisor.
    #[error("integer divide by zero")]
    DivideByZero = 0x06,
}

impl FaultCode {
    /// Converts a fault code to its stable byte value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Converts a stable byte value back into a fault code.
    #[must_use]
    pub const fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::IllegalEncoding),
            0x02 => Some(Self::UndefinedInstruction),
            0x03 => Some(Self::NonExecutableFetch),
            0x04 => Some(Self::UnmappedAccess),
            0x05 => Some(Self::ProtectionViolation),
            0x06 => Some(Self::DivideByZero),
            _ => None,
        }
    }

    /// Returns the fault class for this fault code.
    #[must_use]
    pub const fn class(self) -> FaultClass {
        match self {
            Self::IllegalEncoding | Self::UndefinedInstruction => FaultClass::Decode,
            Self::NonExecutableFetch | Self::UnmappedAccess | Self::ProtectionViolation => {
                FaultClass::Memory
            }
            Self::DivideByZero => FaultClass::Arithmetic,
        }
    }

    /// Signal delivered to the faulting thread.
    #[must_use]
    pub const fn signal(self) -> Signal {
        match self.class() {
            FaultClass::Decode => Signal::SIGILL,
            FaultClass::Memory => Signal::SIGSEGV,
            FaultClass::Arithmetic => Signal::SIGFPE,
        }
    }
}

/// A fault together with the guest address that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{code} at 0x{addr:08x}")]
pub struct GuestFault {
    /// What went wrong.
    pub code: FaultCode,
    /// Faulting data address, or the instruction address for decode and arithmetic faults.
    pub addr: u32,
}

impl GuestFault {
    /// Creates a fault record.
    #[must_use]
    pub const fn new(code: FaultCode, addr: u32) -> Self {
        Self { code, addr }
    }
}

#[cfg(test)]
mod tests {
    use super::{FaultClass, FaultCode, GuestFault};
    use crate::signal::Signal;

    #[test]
    fn stable_code_roundtrip_is_bijective_for_defined_values() {
        for code in 0x01u8..=0x06 {
            let fault = FaultCode::from_u8(code).expect("defined taxonomy code");
            assert_eq!(fault.as_u8(), code);
        }
    }

    #[test]
    fn unknown_code_is_rejected() {
        assert!(FaultCode::from_u8(0x00).is_none());
        assert!(FaultCode::from_u8(0xFF).is_none());
    }

    #[test]
    fn class_mapping_selects_posix_signal() {
        assert_eq!(FaultCode::IllegalEncoding.class(), FaultClass::Decode);
        assert_eq!(FaultCode::UnmappedAccess.signal(), Signal::SIGSEGV);
        assert_eq!(FaultCode::ProtectionViolation.signal(), Signal::SIGSEGV);
        assert_eq!(FaultCode::NonExecutableFetch.signal(), Signal::SIGSEGV);
        assert_eq!(FaultCode::UndefinedInstruction.signal(), Signal::SIGILL);
        assert_eq!(FaultCode::DivideByZero.signal(), Signal::SIGFPE);
    }

    #[test]
    fn fault_display_includes_address() {
        let fault = GuestFault::new(FaultCode::UnmappedAccess, 0x10);
        assert_eq!(fault.to_string(), "access to unmapped memory at 0x00000010");
    }
}
