//! Instruction decoder for the GX32 guest ISA.
//!
//! Decoding validates register fields and reserved bits and produces an
//! [`Instruction`] whose [`Operation`] carries typed operands. Opcode bytes
//! missing from the opcode table decode successfully as
//! [`Operation::Unsupported`] so the engine can offer them to tools first.

use std::fmt;

use thiserror::Error;

use crate::encoding::{
    classify_opcode, extension_mnemonic, opcode_info, pack_word, split_word, Format, Opcode,
};
use crate::fault::{FaultCode, GuestFault};
use crate::memory::{AccessKind, MemoryMap};
use crate::state::Register;

/// Two-operand arithmetic and logic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Sar,
    Mul,
    Divu,
    Remu,
}

/// Branch conditions evaluated against `FLAGS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Condition {
    Eq,
    Ne,
    Lt,
    Ge,
    Ltu,
    Geu,
}

/// Memory access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Width {
    /// Four bytes, little-endian.
    Word,
    /// One byte, zero-extended on load.
    Byte,
}

/// Decoded operation with typed operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Operation {
    Nop,
    Mov { rd: Register, ra: Register },
    MovImm { rd: Register, imm: i16 },
    LoadImm { rd: Register, imm: u32 },
    Alu { op: AluOp, rd: Register, ra: Register, rb: Register },
    AddImm { rd: Register, ra: Register, imm: i16 },
    Cmp { rd: Register, ra: Register },
    Load { width: Width, rd: Register, base: Register, disp: i16 },
    Store { width: Width, rs: Register, base: Register, disp: i16 },
    Jump { disp: i16 },
    Branch { cond: Condition, disp: i16 },
    JumpReg { rd: Register },
    Call { disp: i16 },
    CallReg { rd: Register },
    Ret,
    Push { rd: Register },
    Pop { rd: Register },
    Syscall,
    Undefined,
    /// Opcode byte the core does not implement.
    Unsupported { opcode: u8 },
}

impl Operation {
    /// Encodes the operation into instruction bytes (4, or 8 for `li`).
    #[must_use]
    #[allow(clippy::cast_sign_loss, clippy::too_many_lines)]
    pub fn encode(&self) -> Vec<u8> {
        let op = |opcode| opcode_info(opcode).0;
        let imm = |value: i16| value as u16;
        let (word, ext) = match *self {
            Self::Nop => (pack_word(op(Opcode::Nop), 0, 0, 0), None),
            Self::Mov { rd, ra } => (pack_word(op(Opcode::Mov), rd.bits(), ra.bits(), 0), None),
            Self::MovImm { rd, imm: value } => {
                (pack_word(op(Opcode::Movi), rd.bits(), 0, imm(value)), None)
            }
            Self::LoadImm { rd, imm: value } => {
                (pack_word(op(Opcode::Li), rd.bits(), 0, 0), Some(value))
            }
            Self::Alu {
                op: alu,
                rd,
                ra,
                rb,
            } => {
                let opcode = match alu {
                    AluOp::Add => Opcode::Add,
                    AluOp::Sub => Opcode::Sub,
                    AluOp::And => Opcode::And,
                    AluOp::Or => Opcode::Or,
                    AluOp::Xor => Opcode::Xor,
                    AluOp::Shl => Opcode::Shl,
                    AluOp::Shr => Opcode::Shr,
                    AluOp::Sar => Opcode::Sar,
                    AluOp::Mul => Opcode::Mul,
                    AluOp::Divu => Opcode::Divu,
                    AluOp::Remu => Opcode::Remu,
                };
                let low = u16::from(rb.bits()) << 12;
                (pack_word(op(opcode), rd.bits(), ra.bits(), low), None)
            }
            Self::AddImm { rd, ra, imm: value } => (
                pack_word(op(Opcode::Addi), rd.bits(), ra.bits(), imm(value)),
                None,
            ),
            Self::Cmp { rd, ra } => (pack_word(op(Opcode::Cmp), rd.bits(), ra.bits(), 0), None),
            Self::Load {
                width,
                rd,
                base,
                disp,
            } => {
                let opcode = match width {
                    Width::Word => Opcode::Ldw,
                    Width::Byte => Opcode::Ldb,
                };
                (
                    pack_word(op(opcode), rd.bits(), base.bits(), imm(disp)),
                    None,
                )
            }
            Self::Store {
                width,
                rs,
                base,
                disp,
            } => {
                let opcode = match width {
                    Width::Word => Opcode::Stw,
                    Width::Byte => Opcode::Stb,
                };
                (
                    pack_word(op(opcode), rs.bits(), base.bits(), imm(disp)),
                    None,
                )
            }
            Self::Jump { disp } => (pack_word(op(Opcode::Jmp), 0, 0, imm(disp)), None),
            Self::Branch { cond, disp } => {
                let opcode = match cond {
                    Condition::Eq => Opcode::Beq,
                    Condition::Ne => Opcode::Bne,
                    Condition::Lt => Opcode::Blt,
                    Condition::Ge => Opcode::Bge,
                    Condition::Ltu => Opcode::Bltu,
                    Condition::Geu => Opcode::Bgeu,
                };
                (pack_word(op(opcode), 0, 0, imm(disp)), None)
            }
            Self::JumpReg { rd } => (pack_word(op(Opcode::Jr), rd.bits(), 0, 0), None),
            Self::Call { disp } => (pack_word(op(Opcode::Call), 0, 0, imm(disp)), None),
            Self::CallReg { rd } => (pack_word(op(Opcode::Callr), rd.bits(), 0, 0), None),
            Self::Ret => (pack_word(op(Opcode::Ret), 0, 0, 0), None),
            Self::Push { rd } => (pack_word(op(Opcode::Push), rd.bits(), 0, 0), None),
            Self::Pop { rd } => (pack_word(op(Opcode::Pop), rd.bits(), 0, 0), None),
            Self::Syscall => (pack_word(op(Opcode::Syscall), 0, 0, 0), None),
            Self::Undefined => (pack_word(op(Opcode::Ud), 0, 0, 0), None),
            Self::Unsupported { opcode } => (pack_word(opcode, 0, 0, 0), None),
        };
        let mut bytes = word.to_le_bytes().to_vec();
        if let Some(ext) = ext {
            bytes.extend_from_slice(&ext.to_le_bytes());
        }
        bytes
    }
}

/// Encodes a straight-line program.
#[must_use]
pub fn assemble(program: &[Operation]) -> Vec<u8> {
    program.iter().flat_map(Operation::encode).collect()
}

/// Instruction decoded at a specific guest address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    /// Address of the first byte.
    pub address: u32,
    /// Primary instruction word.
    pub raw: u32,
    /// Extension word for `li`.
    pub ext: Option<u32>,
    /// Decoded operation.
    pub operation: Operation,
}

impl Instruction {
    /// Encoded length in bytes.
    #[must_use]
    pub const fn len(&self) -> u32 {
        if self.ext.is_some() {
            8
        } else {
            4
        }
    }

    /// Always false; instructions occupy at least one word.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Address of the following instruction.
    #[must_use]
    pub const fn next_address(&self) -> u32 {
        self.address.wrapping_add(self.len())
    }

    /// Opcode byte.
    #[must_use]
    pub const fn opcode_byte(&self) -> u8 {
        split_word(self.raw).op
    }

    /// Absolute target of relative jumps, branches and calls.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn branch_target(&self) -> Option<u32> {
        match self.operation {
            Operation::Jump { disp } | Operation::Branch { disp, .. } | Operation::Call { disp } => {
                Some(self.next_address().wrapping_add(disp as i32 as u32))
            }
            _ => None,
        }
    }

    /// Instruction bytes as stored in memory.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        let mut bytes = self.raw.to_le_bytes().to_vec();
        if let Some(ext) = self.ext {
            bytes.extend_from_slice(&ext.to_le_bytes());
        }
        bytes
    }
}

impl fmt::Display for Instruction {
    #[allow(clippy::too_many_lines)]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = |opcode| opcode_info(opcode).1;
        let target = self.branch_target().unwrap_or_default();
        let mem = |base: Register, disp: i16| {
            if disp < 0 {
                format!("[{}-{}]", base.name(), disp.unsigned_abs())
            } else {
                format!("[{}+{disp}]", base.name())
            }
        };
        match self.operation {
            Operation::Nop => f.write_str(name(Opcode::Nop)),
            Operation::Mov { rd, ra } => write!(f, "mov {}, {}", rd.name(), ra.name()),
            Operation::MovImm { rd, imm } => write!(f, "movi {}, {imm}", rd.name()),
            Operation::LoadImm { rd, imm } => write!(f, "li {}, 0x{imm:08x}", rd.name()),
            Operation::Alu { rd, ra, rb, .. } => write!(
                f,
                "{} {}, {}, {}",
                classify_opcode(self.opcode_byte()).map_or("?", |(opcode, _)| name(opcode)),
                rd.name(),
                ra.name(),
                rb.name()
            ),
            Operation::AddImm { rd, ra, imm } => {
                write!(f, "addi {}, {}, {imm}", rd.name(), ra.name())
            }
            Operation::Cmp { rd, ra } => write!(f, "cmp {}, {}", rd.name(), ra.name()),
            Operation::Load {
                width,
                rd,
                base,
                disp,
            } => {
                let mnemonic = if width == Width::Word { "ldw" } else { "ldb" };
                write!(f, "{mnemonic} {}, {}", rd.name(), mem(base, disp))
            }
            Operation::Store {
                width,
                rs,
                base,
                disp,
            } => {
                let mnemonic = if width == Width::Word { "stw" } else { "stb" };
                write!(f, "{mnemonic} {}, {}", rs.name(), mem(base, disp))
            }
            Operation::Jump { .. } | Operation::Branch { .. } | Operation::Call { .. } => write!(
                f,
                "{} 0x{target:08x}",
                classify_opcode(self.opcode_byte()).map_or("?", |(opcode, _)| name(opcode))
            ),
            Operation::JumpReg { rd } => write!(f, "jr {}", rd.name()),
            Operation::CallReg { rd } => write!(f, "callr {}", rd.name()),
            Operation::Ret => f.write_str(name(Opcode::Ret)),
            Operation::Push { rd } => write!(f, "push {}", rd.name()),
            Operation::Pop { rd } => write!(f, "pop {}", rd.name()),
            Operation::Syscall => f.write_str(name(Opcode::Syscall)),
            Operation::Undefined => f.write_str(name(Opcode::Ud)),
            Operation::Unsupported { opcode } => match extension_mnemonic(opcode) {
                Some(mnemonic) => f.write_str(mnemonic),
                None => write!(f, ".word 0x{:08x}", self.raw),
            },
        }
    }
}

/// Reasons an instruction word cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum DecodeError {
    /// Register field out of range or reserved bits set.
    #[error("illegal encoding 0x{word:08x}")]
    IllegalEncoding {
        /// Offending word.
        word: u32,
    },
    /// `li` decoded without its extension word.
    #[error("missing extension word for 0x{word:08x}")]
    MissingExtension {
        /// Offending word.
        word: u32,
    },
}

/// Stateless GX32 decoder.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decoder;

impl Decoder {
    /// Whether the word is followed by an extension word.
    #[must_use]
    pub fn needs_extension(word: u32) -> bool {
        matches!(
            classify_opcode(split_word(word).op),
            Some((_, Format::Wide))
        )
    }

    /// Decodes one instruction.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] for malformed encodings of assigned opcodes.
    #[allow(clippy::too_many_lines, clippy::cast_possible_wrap)]
    pub fn decode(address: u32, word: u32, ext: Option<u32>) -> Result<Instruction, DecodeError> {
        let fields = split_word(word);
        let illegal = DecodeError::IllegalEncoding { word };
        let reg = |bits| Register::from_u4(bits).ok_or(illegal);
        let simm = fields.imm16 as i16;

        let Some((opcode, format)) = classify_opcode(fields.op) else {
            return Ok(Instruction {
                address,
                raw: word,
                ext: None,
                operation: Operation::Unsupported { opcode: fields.op },
            });
        };

        let reserved_clear = match format {
            Format::Bare => word & 0x00FF_FFFF == 0,
            Format::Reg1 => word & 0x000F_FFFF == 0,
            Format::Reg2 => word & 0x0000_FFFF == 0,
            Format::Reg3 => fields.low12 == 0,
            Format::RegImm => true,
            Format::Imm => fields.ra == 0,
            Format::Wide => word & 0x000F_FFFF == 0,
            Format::Rel => fields.rd == 0 && fields.ra == 0,
        };
        if !reserved_clear {
            return Err(illegal);
        }

        let alu = |op| -> Result<Operation, DecodeError> {
            Ok(Operation::Alu {
                op,
                rd: reg(fields.rd)?,
                ra: reg(fields.ra)?,
                rb: reg(fields.rb)?,
            })
        };
        let load = |width| -> Result<Operation, DecodeError> {
            Ok(Operation::Load {
                width,
                rd: reg(fields.rd)?,
                base: reg(fields.ra)?,
                disp: simm,
            })
        };
        let store = |width| -> Result<Operation, DecodeError> {
            Ok(Operation::Store {
                width,
                rs: reg(fields.rd)?,
                base: reg(fields.ra)?,
                disp: simm,
            })
        };
        let branch = |cond| Operation::Branch { cond, disp: simm };

        let operation = match opcode {
            Opcode::Nop => Operation::Nop,
            Opcode::Mov => Operation::Mov {
                rd: reg(fields.rd)?,
                ra: reg(fields.ra)?,
            },
            Opcode::Movi => Operation::MovImm {
                rd: reg(fields.rd)?,
                imm: simm,
            },
            Opcode::Li => Operation::LoadImm {
                rd: reg(fields.rd)?,
                imm: ext.ok_or(DecodeError::MissingExtension { word })?,
            },
            Opcode::Add => alu(AluOp::Add)?,
            Opcode::Sub => alu(AluOp::Sub)?,
            Opcode::And => alu(AluOp::And)?,
            Opcode::Or => alu(AluOp::Or)?,
            Opcode::Xor => alu(AluOp::Xor)?,
            Opcode::Shl => alu(AluOp::Shl)?,
            Opcode::Shr => alu(AluOp::Shr)?,
            Opcode::Sar => alu(AluOp::Sar)?,
            Opcode::Mul => alu(AluOp::Mul)?,
            Opcode::Divu => alu(AluOp::Divu)?,
            Opcode::Remu => alu(AluOp::Remu)?,
            Opcode::Cmp => Operation::Cmp {
                rd: reg(fields.rd)?,
                ra: reg(fields.ra)?,
            },
            Opcode::Addi => Operation::AddImm {
                rd: reg(fields.rd)?,
                ra: reg(fields.ra)?,
                imm: simm,
            },
            Opcode::Ldw => load(Width::Word)?,
            Opcode::Ldb => load(Width::Byte)?,
            Opcode::Stw => store(Width::Word)?,
            Opcode::Stb => store(Width::Byte)?,
            Opcode::Jmp => Operation::Jump { disp: simm },
            Opcode::Beq => branch(Condition::Eq),
            Opcode::Bne => branch(Condition::Ne),
            Opcode::Blt => branch(Condition::Lt),
            Opcode::Bge => branch(Condition::Ge),
            Opcode::Bltu => branch(Condition::Ltu),
            Opcode::Bgeu => branch(Condition::Geu),
            Opcode::Jr => Operation::JumpReg {
                rd: reg(fields.rd)?,
            },
            Opcode::Call => Operation::Call { disp: simm },
            Opcode::Callr => Operation::CallReg {
                rd: reg(fields.rd)?,
            },
            Opcode::Ret => Operation::Ret,
            Opcode::Push => Operation::Push {
                rd: reg(fields.rd)?,
            },
            Opcode::Pop => Operation::Pop {
                rd: reg(fields.rd)?,
            },
            Opcode::Syscall => Operation::Syscall,
            Opcode::Ud => Operation::Undefined,
        };

        Ok(Instruction {
            address,
            raw: word,
            ext: if format == Format::Wide { ext } else { None },
            operation,
        })
    }

    /// Fetches (execute permission required) and decodes the instruction at `address`.
    ///
    /// # Errors
    ///
    /// Fetch failures map to [`FaultCode::NonExecutableFetch`], malformed
    /// encodings to [`FaultCode::IllegalEncoding`].
    pub fn fetch(memory: &MemoryMap, address: u32) -> Result<Instruction, GuestFault> {
        Self::read_and_decode(memory, address, AccessKind::Fetch)
    }

    /// Like [`Decoder::fetch`] but ignores permissions, for listings.
    ///
    /// # Errors
    ///
    /// See [`Decoder::fetch`].
    pub fn peek(memory: &MemoryMap, address: u32) -> Result<Instruction, GuestFault> {
        Self::read_and_decode(memory, address, AccessKind::Peek)
    }

    fn read_and_decode(
        memory: &MemoryMap,
        address: u32,
        access: AccessKind,
    ) -> Result<Instruction, GuestFault> {
        let read_word = |addr: u32| -> Result<u32, GuestFault> {
            let mut word = [0u8; 4];
            let result = if access == AccessKind::Fetch {
                memory.fetch(addr, &mut word)
            } else {
                memory.peek(addr, &mut word)
            };
            result.map_err(|fault| GuestFault::new(FaultCode::NonExecutableFetch, fault.addr))?;
            Ok(u32::from_le_bytes(word))
        };
        let word = read_word(address)?;
        let ext = if Self::needs_extension(word) {
            Some(read_word(address.wrapping_add(4))?)
        } else {
            None
        };
        Self::decode(address, word, ext)
            .map_err(|_| GuestFault::new(FaultCode::IllegalEncoding, address))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::{assemble, AluOp, Condition, DecodeError, Decoder, Operation, Width};
    use crate::fault::FaultCode;
    use crate::memory::{MemoryMap, Permissions, Segment};
    use crate::state::Register;

    fn sample_operations() -> Vec<Operation> {
        vec![
            Operation::Nop,
            Operation::Mov {
                rd: Register::R1,
                ra: Register::Sp,
            },
            Operation::MovImm {
                rd: Register::R2,
                imm: -7,
            },
            Operation::LoadImm {
                rd: Register::R3,
                imm: 0xDEAD_BEEF,
            },
            Operation::Alu {
                op: AluOp::Remu,
                rd: Register::R4,
                ra: Register::R5,
                rb: Register::R6,
            },
            Operation::Load {
                width: Width::Byte,
                rd: Register::R0,
                base: Register::Sp,
                disp: -4,
            },
            Operation::Store {
                width: Width::Word,
                rs: Register::R7,
                base: Register::R1,
                disp: 12,
            },
            Operation::Branch {
                cond: Condition::Ltu,
                disp: -8,
            },
            Operation::Push { rd: Register::R2 },
            Operation::Syscall,
            Operation::Undefined,
        ]
    }

    #[test]
    fn encode_then_decode_preserves_operations() {
        let mut address = 0x1000;
        for operation in sample_operations() {
            let bytes = operation.encode();
            let word = u32::from_le_bytes(bytes[0..4].try_into().expect("word"));
            let ext = bytes
                .get(4..8)
                .map(|b| u32::from_le_bytes(b.try_into().expect("ext")));
            let insn = Decoder::decode(address, word, ext).expect("decodes");
            assert_eq!(insn.operation, operation);
            assert_eq!(insn.len() as usize, bytes.len());
            address += insn.len();
        }
    }

    #[test]
    fn reserved_bits_and_bad_registers_are_illegal() {
        assert_eq!(
            Decoder::decode(0, 0x0000_0001, None),
            Err(DecodeError::IllegalEncoding { word: 0x0000_0001 })
        );
        let bad_register = 0x0190_0000;
        assert!(Decoder::decode(0, bad_register, None).is_err());
        let li = Operation::LoadImm {
            rd: Register::R0,
            imm: 1,
        }
        .encode();
        let word = u32::from_le_bytes(li[0..4].try_into().expect("word"));
        assert_eq!(
            Decoder::decode(0, word, None),
            Err(DecodeError::MissingExtension { word })
        );
    }

    #[test]
    fn unassigned_opcodes_decode_as_unsupported() {
        let insn = Decoder::decode(0x40, 0xE012_3456, None).expect("unsupported is not an error");
        assert_eq!(insn.operation, Operation::Unsupported { opcode: 0xE0 });
        assert_eq!(insn.to_string(), "cpuid");
        let other = Decoder::decode(0x40, 0xF000_0000, None).expect("unsupported");
        assert_eq!(other.to_string(), ".word 0xf0000000");
    }

    #[test]
    fn branch_targets_are_relative_to_next_instruction() {
        let insn = Decoder::decode(
            0x0804_8010,
            u32::from_le_bytes(
                Operation::Jump { disp: -16 }.encode()[0..4]
                    .try_into()
                    .expect("word"),
            ),
            None,
        )
        .expect("jmp");
        assert_eq!(insn.branch_target(), Some(0x0804_8004));
        assert_eq!(insn.to_string(), "jmp 0x08048004");
    }

    #[test]
    fn display_formats_memory_operands() {
        let program = assemble(&[Operation::Load {
            width: Width::Word,
            rd: Register::R1,
            base: Register::Sp,
            disp: -8,
        }]);
        let mut map = MemoryMap::new();
        map.map(Segment::new(0x2000, program, Permissions::READ, "data"))
            .expect("map");
        let insn = Decoder::peek(&map, 0x2000).expect("peek ignores permissions");
        assert_eq!(insn.to_string(), "ldw r1, [sp-8]");
        let fault = Decoder::fetch(&map, 0x2000).expect_err("not executable");
        assert_eq!(fault.code, FaultCode::NonExecutableFetch);
    }

    proptest! {
        #[test]
        fn decode_never_panics(word in any::<u32>(), ext in any::<u32>()) {
            let _ = Decoder::decode(0x1000, word, Some(ext));
        }
    }
}
