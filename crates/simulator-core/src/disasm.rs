//! Disassembly service used for on-demand listings.
//!
//! The simulator only depends on the [`Disassembler`] trait. [`LinearSweep`]
//! is a minimal implementation over the GX32 decoder.

use std::fmt::Write as _;

use crate::decoder::Decoder;
use crate::memory::MemoryMap;

/// A single disassembled instruction row.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct DisassemblyRow {
    /// The starting address of this instruction.
    pub addr_start: u32,
    /// Length in bytes.
    pub len_bytes: u8,
    /// Raw instruction bytes.
    pub raw: Vec<u8>,
    /// Assembly text (e.g. `"add r0, r1, r2"`).
    pub text: String,
    /// Whether the bytes could not be decoded.
    pub is_illegal: bool,
}

/// Produces instruction listings for a guest address range.
pub trait Disassembler: Send + Sync {
    /// Disassembles `[start, end)`; unreadable bytes end the listing.
    fn disassemble(&self, memory: &MemoryMap, start: u32, end: u32) -> Vec<DisassemblyRow>;
}

/// Decodes instructions back to back from the start address.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearSweep;

impl Disassembler for LinearSweep {
    fn disassemble(&self, memory: &MemoryMap, start: u32, end: u32) -> Vec<DisassemblyRow> {
        let mut rows = Vec::new();
        let mut addr = start;
        while u64::from(addr) < u64::from(end) {
            let row = match Decoder::peek(memory, addr) {
                Ok(insn) => DisassemblyRow {
                    addr_start: addr,
                    len_bytes: if insn.len() == 8 { 8 } else { 4 },
                    raw: insn.bytes(),
                    text: insn.to_string(),
                    is_illegal: false,
                },
                Err(_) => {
                    let mut word = [0u8; 4];
                    if memory.peek(addr, &mut word).is_err() {
                        break;
                    }
                    DisassemblyRow {
                        addr_start: addr,
                        len_bytes: 4,
                        raw: word.to_vec(),
                        text: format!(".word 0x{:08x} ; illegal", u32::from_le_bytes(word)),
                        is_illegal: true,
                    }
                }
            };
            let Some(next) = addr.checked_add(u32::from(row.len_bytes)) else {
                rows.push(row);
                break;
            };
            addr = next;
            rows.push(row);
        }
        rows
    }
}

/// Renders rows as an address/bytes/text listing.
#[must_use]
pub fn render_listing(rows: &[DisassemblyRow], prefix: &str) -> String {
    let mut out = String::new();
    for row in rows {
        let bytes: Vec<String> = row.raw.iter().map(|b| format!("{b:02x}")).collect();
        let _ = writeln!(
            out,
            "{prefix}0x{:08x}: {:<24} {}",
            row.addr_start,
            bytes.join(" "),
            row.text
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{render_listing, Disassembler, LinearSweep};
    use crate::decoder::{assemble, Operation};
    use crate::memory::{MemoryMap, Permissions, Segment};
    use crate::state::Register;

    #[test]
    fn sweep_decodes_until_range_end() {
        let code = assemble(&[
            Operation::LoadImm {
                rd: Register::R0,
                imm: 4,
            },
            Operation::Syscall,
            Operation::Unsupported { opcode: 0xE1 },
        ]);
        let mut memory = MemoryMap::new();
        memory
            .map(Segment::new(0x1000, code, Permissions::RX, "text"))
            .expect("map");
        let rows = LinearSweep.disassemble(&memory, 0x1000, 0x1010);
        let texts: Vec<&str> = rows.iter().map(|row| row.text.as_str()).collect();
        assert_eq!(texts, vec!["li r0, 0x00000004", "syscall", "rdtsc"]);
        assert_eq!(rows[0].len_bytes, 8);
        let listing = render_listing(&rows, "  ");
        assert!(listing.starts_with("  0x00001000: 00 00 00 03"));
    }

    #[test]
    fn illegal_words_are_flagged_and_gaps_stop_the_sweep() {
        let mut memory = MemoryMap::new();
        memory
            .map(Segment::new(
                0x1000,
                vec![0x01, 0x00, 0x00, 0x00],
                Permissions::RX,
                "text",
            ))
            .expect("map");
        let rows = LinearSweep.disassemble(&memory, 0x1000, 0x2000);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_illegal);
    }
}
