//! GX32 opcode assignment and instruction-word field layout.
//!
//! Every instruction starts with one little-endian 32-bit word:
//! `op[31:24] rd[23:20] ra[19:16] rb[15:12]`, with `imm16[15:0]` overlapping
//! `rb` for formats that carry an immediate. `li` appends one extension word.

/// Assigned opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Opcode {
    Nop,
    Mov,
    Movi,
    Li,
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
    Cmp,
    Addi,
    Ldw,
    Ldb,
    Stw,
    Stb,
    Jmp,
    Beq,
    Bne,
    Blt,
    Bge,
    Bltu,
    Bgeu,
    Jr,
    Call,
    Callr,
    Ret,
    Push,
    Pop,
    Syscall,
    Ud,
}

/// Operand layout of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// No operands; all other bits zero.
    Bare,
    /// `rd` only.
    Reg1,
    /// `rd, ra`.
    Reg2,
    /// `rd, ra, rb`.
    Reg3,
    /// `rd, ra, simm16`.
    RegImm,
    /// `rd, simm16`.
    Imm,
    /// `rd` plus a 32-bit extension word.
    Wide,
    /// `simm16` displacement from the next instruction.
    Rel,
}

/// Single source-of-truth opcode table.
///
/// Any opcode byte not present here is unsupported by the core.
pub const OPCODE_TABLE: &[(u8, Opcode, Format, &str)] = &[
    (0x00, Opcode::Nop, Format::Bare, "nop"),
    (0x01, Opcode::Mov, Format::Reg2, "mov"),
    (0x02, Opcode::Movi, Format::Imm, "movi"),
    (0x03, Opcode::Li, Format::Wide, "li"),
    (0x10, Opcode::Add, Format::Reg3, "add"),
    (0x11, Opcode::Sub, Format::Reg3, "sub"),
    (0x12, Opcode::And, Format::Reg3, "and"),
    (0x13, Opcode::Or, Format::Reg3, "or"),
    (0x14, Opcode::Xor, Format::Reg3, "xor"),
    (0x15, Opcode::Shl, Format::Reg3, "shl"),
    (0x16, Opcode::Shr, Format::Reg3, "shr"),
    (0x17, Opcode::Sar, Format::Reg3, "sar"),
    (0x18, Opcode::Mul, Format::Reg3, "mul"),
    (0x19, Opcode::Divu, Format::Reg3, "divu"),
    (0x1A, Opcode::Remu, Format::Reg3, "remu"),
    (0x1B, Opcode::Cmp, Format::Reg2, "cmp"),
    (0x1C, Opcode::Addi, Format::RegImm, "addi"),
    (0x20, Opcode::Ldw, Format::RegImm, "ldw"),
    (0x21, Opcode::Ldb, Format::RegImm, "ldb"),
    (0x22, Opcode::Stw, Format::RegImm, "stw"),
    (0x23, Opcode::Stb, Format::RegImm, "stb"),
    (0x30, Opcode::Jmp, Format::Rel, "jmp"),
    (0x31, Opcode::Beq, Format::Rel, "beq"),
    (0x32, Opcode::Bne, Format::Rel, "bne"),
    (0x33, Opcode::Blt, Format::Rel, "blt"),
    (0x34, Opcode::Bge, Format::Rel, "bge"),
    (0x35, Opcode::Bltu, Format::Rel, "bltu"),
    (0x36, Opcode::Bgeu, Format::Rel, "bgeu"),
    (0x37, Opcode::Jr, Format::Reg1, "jr"),
    (0x38, Opcode::Call, Format::Rel, "call"),
    (0x39, Opcode::Callr, Format::Reg1, "callr"),
    (0x3A, Opcode::Ret, Format::Bare, "ret"),
    (0x40, Opcode::Push, Format::Reg1, "push"),
    (0x41, Opcode::Pop, Format::Reg1, "pop"),
    (0x50, Opcode::Syscall, Format::Bare, "syscall"),
    (0x51, Opcode::Ud, Format::Bare, "ud"),
];

/// Opcode bytes reserved for instructions the core leaves to tools.
pub const EXTENSION_OPCODES: &[(u8, &str)] = &[(0xE0, "cpuid"), (0xE1, "rdtsc")];

/// `cpuid` opcode byte.
pub const OP_CPUID: u8 = 0xE0;
/// `rdtsc` opcode byte.
pub const OP_RDTSC: u8 = 0xE1;

/// Looks up an opcode byte.
///
/// `None` means the instruction is unsupported by the core.
#[must_use]
pub fn classify_opcode(op: u8) -> Option<(Opcode, Format)> {
    OPCODE_TABLE
        .iter()
        .find_map(|(entry, opcode, format, _)| (*entry == op).then_some((*opcode, *format)))
}

/// Opcode byte and mnemonic for an assigned opcode.
#[must_use]
pub fn opcode_info(opcode: Opcode) -> (u8, &'static str) {
    OPCODE_TABLE
        .iter()
        .find_map(|(op, entry, _, name)| (*entry == opcode).then_some((*op, *name)))
        .unwrap_or((0xFF, "?"))
}

/// Mnemonic of an extension opcode, if it has one.
#[must_use]
pub fn extension_mnemonic(op: u8) -> Option<&'static str> {
    EXTENSION_OPCODES
        .iter()
        .find_map(|(entry, name)| (*entry == op).then_some(*name))
}

/// Instruction word fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WordFields {
    /// Opcode byte.
    pub op: u8,
    /// Destination/first register field.
    pub rd: u8,
    /// Second register field.
    pub ra: u8,
    /// Third register field.
    pub rb: u8,
    /// Low twelve bits below `rb`.
    pub low12: u16,
    /// Low sixteen bits.
    pub imm16: u16,
}

/// Splits an instruction word into its fields.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn split_word(word: u32) -> WordFields {
    WordFields {
        op: (word >> 24) as u8,
        rd: ((word >> 20) & 0xF) as u8,
        ra: ((word >> 16) & 0xF) as u8,
        rb: ((word >> 12) & 0xF) as u8,
        low12: (word & 0x0FFF) as u16,
        imm16: (word & 0xFFFF) as u16,
    }
}

/// Packs fields into an instruction word.
#[must_use]
pub const fn pack_word(op: u8, rd: u8, ra: u8, low16: u16) -> u32 {
    ((op as u32) << 24) | (((rd & 0xF) as u32) << 20) | (((ra & 0xF) as u32) << 16) | low16 as u32
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::{
        classify_opcode, extension_mnemonic, opcode_info, pack_word, split_word, Format, Opcode,
        EXTENSION_OPCODES, OPCODE_TABLE,
    };

    #[test]
    fn table_contains_unique_opcode_bytes() {
        let bytes: HashSet<_> = OPCODE_TABLE.iter().map(|(op, ..)| *op).collect();
        assert_eq!(bytes.len(), OPCODE_TABLE.len());
        let opcodes: HashSet<_> = OPCODE_TABLE.iter().map(|(_, opcode, ..)| *opcode).collect();
        assert_eq!(opcodes.len(), OPCODE_TABLE.len());
    }

    #[test]
    fn every_table_entry_resolves_via_lookup() {
        for (op, opcode, format, name) in OPCODE_TABLE {
            assert_eq!(classify_opcode(*op), Some((*opcode, *format)));
            assert_eq!(opcode_info(*opcode), (*op, *name));
        }
    }

    #[test]
    fn extension_opcodes_are_not_core_opcodes() {
        for (op, _) in EXTENSION_OPCODES {
            assert_eq!(classify_opcode(*op), None);
        }
        assert_eq!(extension_mnemonic(0xE0), Some("cpuid"));
        assert_eq!(extension_mnemonic(0xFF), None);
        assert_eq!(classify_opcode(0x03), Some((Opcode::Li, Format::Wide)));
    }

    #[test]
    fn word_fields_roundtrip() {
        let word = pack_word(0x10, 1, 2, 0x3000);
        let fields = split_word(word);
        assert_eq!(
            (fields.op, fields.rd, fields.ra, fields.rb, fields.low12),
            (0x10, 1, 2, 3, 0)
        );
        assert_eq!(split_word(pack_word(0x1C, 4, 8, 0xFFFC)).imm16, 0xFFFC);
    }
}
