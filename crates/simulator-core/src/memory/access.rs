use std::fmt;

use bitflags::bitflags;
use thiserror::Error;

use crate::fault::FaultCode;

/// Guest page size in bytes.
pub const PAGE_SIZE: u32 = 4096;

bitflags! {
    /// Segment access permissions, numerically equal to the guest `PROT_*` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    #[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
    pub struct Permissions: u8 {
        /// Data reads allowed.
        const READ = 0b001;
        /// Data writes allowed.
        const WRITE = 0b010;
        /// Instruction fetch allowed.
        const EXEC = 0b100;
    }
}

impl Permissions {
    /// Read and write.
    pub const RW: Self = Self::READ.union(Self::WRITE);
    /// Read and execute.
    pub const RX: Self = Self::READ.union(Self::EXEC);

    /// Decodes guest `PROT_*` bits, ignoring unknown ones.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from_prot(prot: u32) -> Self {
        Self::from_bits_truncate((prot & 0b111) as u8)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |bit: Self, ch: char| if self.contains(bit) { ch } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(Self::READ, 'r'),
            flag(Self::WRITE, 'w'),
            flag(Self::EXEC, 'x')
        )
    }
}

/// Kind of access that was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    /// Data read.
    Read,
    /// Data write.
    Write,
    /// Instruction fetch.
    Fetch,
    /// Permission-less inspection by tools.
    Peek,
}

impl AccessKind {
    /// Permission a segment must grant for this access.
    #[must_use]
    pub const fn required(self) -> Permissions {
        match self {
            Self::Read => Permissions::READ,
            Self::Write => Permissions::WRITE,
            Self::Fetch => Permissions::EXEC,
            Self::Peek => Permissions::empty(),
        }
    }
}

/// Why an access failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFaultKind {
    /// No segment covers the address.
    Unmapped,
    /// A segment covers the address but forbids the access.
    Protection,
}

/// A failed guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[error("{kind:?} fault on {access:?} at 0x{addr:08x}")]
pub struct MemoryFault {
    /// First byte that could not be accessed.
    pub addr: u32,
    /// Attempted access.
    pub access: AccessKind,
    /// Failure reason.
    pub kind: MemoryFaultKind,
}

impl MemoryFault {
    /// Fault code reported to the execution engine.
    #[must_use]
    pub const fn code(&self) -> FaultCode {
        match (self.access, self.kind) {
            (AccessKind::Fetch, _) => FaultCode::NonExecutableFetch,
            (_, MemoryFaultKind::Unmapped) => FaultCode::UnmappedAccess,
            (_, MemoryFaultKind::Protection) => FaultCode::ProtectionViolation,
        }
    }
}

impl From<MemoryFault> for nix::errno::Errno {
    fn from(_: MemoryFault) -> Self {
        Self::EFAULT
    }
}

/// Rounds `value` down to a page boundary.
#[must_use]
pub const fn page_floor(value: u32) -> u32 {
    value & !(PAGE_SIZE - 1)
}

/// Rounds `value` up to a page boundary, `None` on overflow.
#[must_use]
pub const fn page_ceil(value: u32) -> Option<u32> {
    match value.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(page_floor(v)),
        None => None,
    }
}

/// Whether `value` sits on a page boundary.
#[must_use]
pub const fn is_page_aligned(value: u32) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::{
        is_page_aligned, page_ceil, page_floor, AccessKind, MemoryFault, MemoryFaultKind,
        Permissions,
    };
    use crate::fault::FaultCode;

    #[test]
    fn permissions_render_like_proc_maps() {
        assert_eq!(Permissions::RX.to_string(), "r-x");
        assert_eq!(Permissions::RW.to_string(), "rw-");
        assert_eq!(Permissions::empty().to_string(), "---");
        assert_eq!(Permissions::from_prot(7), Permissions::all());
    }

    #[test]
    fn page_rounding() {
        assert_eq!(page_floor(0x1234), 0x1000);
        assert_eq!(page_ceil(0x1001), Some(0x2000));
        assert_eq!(page_ceil(0x1000), Some(0x1000));
        assert_eq!(page_ceil(u32::MAX), None);
        assert!(is_page_aligned(0x8000));
        assert!(!is_page_aligned(0x8001));
    }

    #[test]
    fn fault_codes_distinguish_fetch_and_data() {
        let fetch = MemoryFault {
            addr: 0,
            access: AccessKind::Fetch,
            kind: MemoryFaultKind::Protection,
        };
        let write = MemoryFault {
            access: AccessKind::Write,
            ..fetch
        };
        let read = MemoryFault {
            access: AccessKind::Read,
            kind: MemoryFaultKind::Unmapped,
            ..fetch
        };
        assert_eq!(fetch.code(), FaultCode::NonExecutableFetch);
        assert_eq!(write.code(), FaultCode::ProtectionViolation);
        assert_eq!(read.code(), FaultCode::UnmappedAccess);
        assert_eq!(nix::errno::Errno::from(read), nix::errno::Errno::EFAULT);
    }
}
