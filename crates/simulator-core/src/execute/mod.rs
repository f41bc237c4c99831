//! Instruction semantics for the GX32 guest ISA.
//!
//! Execution is split into two phases. [`compute_effects`] reads operands
//! and memory and produces an [`ExecuteState`] without touching the thread or
//! the address space; [`commit_execution`] then performs the single pending
//! store and applies register, `FLAGS` and `ip` updates. A store that faults
//! aborts the commit before any register changes, so every fault is precise.

mod flags;

pub use flags::FlagsUpdate;

use crate::decoder::{AluOp, Condition, Instruction, Operation, Width};
use crate::fault::{FaultCode, GuestFault};
use crate::memory::{MemoryFault, MemoryMap};
use crate::state::{Register, RegisterFile, FLAGS_C, FLAGS_N, FLAGS_V, FLAGS_Z};

/// Outcome of executing a single instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// Instruction retired; `ip` points at the next instruction.
    Retired,
    /// `syscall` retired; `ip` already points past it and dispatch is due.
    Syscall,
    /// Fault raised; nothing was committed.
    Fault(GuestFault),
    /// Opcode the core does not implement; nothing was committed.
    Unsupported {
        /// Opcode byte.
        opcode: u8,
    },
}

/// Pending memory store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingStore {
    /// Destination address.
    pub addr: u32,
    /// Little-endian bytes; only the first `len` are stored.
    pub bytes: [u8; 4],
    /// Number of bytes to store.
    pub len: usize,
}

/// Side effects accumulated before commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecuteState {
    /// New `ip`.
    pub next_ip: u32,
    /// New stack pointer, applied before `dest`.
    pub sp: Option<u32>,
    /// Destination register write.
    pub dest: Option<(Register, u32)>,
    /// `FLAGS` update.
    pub flags: FlagsUpdate,
    /// Memory store.
    pub store: Option<PendingStore>,
}

impl ExecuteState {
    const fn advance(next_ip: u32) -> Self {
        Self {
            next_ip,
            sp: None,
            dest: None,
            flags: FlagsUpdate::None,
            store: None,
        }
    }
}

/// What [`compute_effects`] decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Computed {
    /// Ordinary instruction with effects to commit.
    Effects(ExecuteState),
    /// System call trap.
    Syscall,
    /// Unsupported opcode.
    Unsupported(u8),
}

fn data_fault(fault: MemoryFault) -> GuestFault {
    GuestFault::new(fault.code(), fault.addr)
}

fn load(memory: &MemoryMap, width: Width, addr: u32) -> Result<u32, GuestFault> {
    match width {
        Width::Word => memory.read_u32(addr).map_err(data_fault),
        Width::Byte => {
            let mut byte = [0u8; 1];
            memory.read(addr, &mut byte).map_err(data_fault)?;
            Ok(u32::from(byte[0]))
        }
    }
}

fn condition_holds(cond: Condition, regs: &RegisterFile) -> bool {
    let z = regs.flag_is_set(FLAGS_Z);
    let n = regs.flag_is_set(FLAGS_N);
    let c = regs.flag_is_set(FLAGS_C);
    let v = regs.flag_is_set(FLAGS_V);
    match cond {
        Condition::Eq => z,
        Condition::Ne => !z,
        Condition::Lt => n != v,
        Condition::Ge => n == v,
        Condition::Ltu => c,
        Condition::Geu => !c,
    }
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn alu(op: AluOp, a: u32, b: u32, at: u32) -> Result<(u32, FlagsUpdate), GuestFault> {
    let logical = |result| (result, FlagsUpdate::logical(result));
    Ok(match op {
        AluOp::Add => FlagsUpdate::add(a, b),
        AluOp::Sub => FlagsUpdate::sub(a, b),
        AluOp::And => logical(a & b),
        AluOp::Or => logical(a | b),
        AluOp::Xor => logical(a ^ b),
        AluOp::Shl => logical(a << (b & 31)),
        AluOp::Shr => logical(a >> (b & 31)),
        AluOp::Sar => logical(((a as i32) >> (b & 31)) as u32),
        AluOp::Mul => logical(a.wrapping_mul(b)),
        AluOp::Divu | AluOp::Remu if b == 0 => {
            return Err(GuestFault::new(FaultCode::DivideByZero, at));
        }
        AluOp::Divu => logical(a / b),
        AluOp::Remu => logical(a % b),
    })
}

/// Reads operands and computes side effects without committing them.
///
/// # Errors
///
/// Returns the fault raised by a load or an arithmetic exception.
#[allow(clippy::cast_sign_loss, clippy::too_many_lines)]
pub fn compute_effects(
    insn: &Instruction,
    regs: &RegisterFile,
    memory: &MemoryMap,
) -> Result<Computed, GuestFault> {
    let next_ip = insn.next_address();
    let mut exec = ExecuteState::advance(next_ip);
    let offset = |base: Register, disp: i16| regs.get(base).wrapping_add(disp as i32 as u32);

    match insn.operation {
        Operation::Nop => {}
        Operation::Mov { rd, ra } => exec.dest = Some((rd, regs.get(ra))),
        Operation::MovImm { rd, imm } => exec.dest = Some((rd, i32::from(imm) as u32)),
        Operation::LoadImm { rd, imm } => exec.dest = Some((rd, imm)),
        Operation::Alu { op, rd, ra, rb } => {
            let (result, flags) = alu(op, regs.get(ra), regs.get(rb), insn.address)?;
            exec.dest = Some((rd, result));
            exec.flags = flags;
        }
        Operation::AddImm { rd, ra, imm } => {
            let (result, flags) = FlagsUpdate::add(regs.get(ra), i32::from(imm) as u32);
            exec.dest = Some((rd, result));
            exec.flags = flags;
        }
        Operation::Cmp { rd, ra } => {
            exec.flags = FlagsUpdate::sub(regs.get(rd), regs.get(ra)).1;
        }
        Operation::Load {
            width,
            rd,
            base,
            disp,
        } => {
            exec.dest = Some((rd, load(memory, width, offset(base, disp))?));
        }
        Operation::Store {
            width,
            rs,
            base,
            disp,
        } => {
            exec.store = Some(PendingStore {
                addr: offset(base, disp),
                bytes: regs.get(rs).to_le_bytes(),
                len: if width == Width::Word { 4 } else { 1 },
            });
        }
        Operation::Jump { .. } => exec.next_ip = insn.branch_target().unwrap_or(next_ip),
        Operation::Branch { cond, .. } => {
            if condition_holds(cond, regs) {
                exec.next_ip = insn.branch_target().unwrap_or(next_ip);
            }
        }
        Operation::JumpReg { rd } => exec.next_ip = regs.get(rd),
        Operation::Call { .. } | Operation::CallReg { .. } => {
            let target = match insn.operation {
                Operation::CallReg { rd } => regs.get(rd),
                _ => insn.branch_target().unwrap_or(next_ip),
            };
            let sp = regs.sp().wrapping_sub(4);
            exec.store = Some(PendingStore {
                addr: sp,
                bytes: next_ip.to_le_bytes(),
                len: 4,
            });
            exec.sp = Some(sp);
            exec.next_ip = target;
        }
        Operation::Ret => {
            exec.next_ip = load(memory, Width::Word, regs.sp())?;
            exec.sp = Some(regs.sp().wrapping_add(4));
        }
        Operation::Push { rd } => {
            let sp = regs.sp().wrapping_sub(4);
            exec.store = Some(PendingStore {
                addr: sp,
                bytes: regs.get(rd).to_le_bytes(),
                len: 4,
            });
            exec.sp = Some(sp);
        }
        Operation::Pop { rd } => {
            let value = load(memory, Width::Word, regs.sp())?;
            exec.sp = Some(regs.sp().wrapping_add(4));
            exec.dest = Some((rd, value));
        }
        Operation::Syscall => return Ok(Computed::Syscall),
        Operation::Undefined => {
            return Err(GuestFault::new(
                FaultCode::UndefinedInstruction,
                insn.address,
            ))
        }
        Operation::Unsupported { opcode } => return Ok(Computed::Unsupported(opcode)),
    }

    Ok(Computed::Effects(exec))
}

/// Applies accumulated side effects: store first, then `sp`, destination, `FLAGS`, `ip`.
///
/// # Errors
///
/// A faulting store leaves registers untouched.
pub fn commit_execution(
    exec: ExecuteState,
    regs: &mut RegisterFile,
    memory: &mut MemoryMap,
) -> Result<(), GuestFault> {
    if let Some(store) = exec.store {
        memory
            .write(store.addr, &store.bytes[..store.len])
            .map_err(data_fault)?;
    }
    if let Some(sp) = exec.sp {
        regs.set_sp(sp);
    }
    if let Some((rd, value)) = exec.dest {
        regs.set(rd, value);
    }
    exec.flags.apply(regs);
    regs.set_ip(exec.next_ip);
    Ok(())
}

/// Executes one decoded instruction against a thread's registers and its process memory.
pub fn execute_instruction(
    insn: &Instruction,
    regs: &mut RegisterFile,
    memory: &mut MemoryMap,
) -> ExecuteOutcome {
    match compute_effects(insn, regs, memory) {
        Ok(Computed::Effects(exec)) => match commit_execution(exec, regs, memory) {
            Ok(()) => ExecuteOutcome::Retired,
            Err(fault) => ExecuteOutcome::Fault(fault),
        },
        Ok(Computed::Syscall) => {
            regs.set_ip(insn.next_address());
            ExecuteOutcome::Syscall
        }
        Ok(Computed::Unsupported(opcode)) => ExecuteOutcome::Unsupported { opcode },
        Err(fault) => ExecuteOutcome::Fault(fault),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{execute_instruction, ExecuteOutcome};
    use crate::decoder::{assemble, AluOp, Condition, Decoder, Instruction, Operation, Width};
    use crate::fault::FaultCode;
    use crate::memory::{MemoryMap, Permissions, Segment};
    use crate::state::{Register, RegisterFile, FLAGS_C, FLAGS_Z};

    const CODE: u32 = 0x1000;
    const STACK_TOP: u32 = 0x9000;

    fn machine(program: &[Operation]) -> (RegisterFile, MemoryMap) {
        let mut memory = MemoryMap::new();
        memory
            .map(Segment::new(CODE, assemble(program), Permissions::RX, "text"))
            .expect("text");
        memory
            .map(Segment::zeroed(0x8000, 0x1000, Permissions::RW, "stack"))
            .expect("stack");
        (RegisterFile::at_entry(CODE, STACK_TOP), memory)
    }

    fn step(regs: &mut RegisterFile, memory: &mut MemoryMap) -> ExecuteOutcome {
        let insn: Instruction = Decoder::fetch(memory, regs.ip()).expect("fetch");
        execute_instruction(&insn, regs, memory)
    }

    #[rstest]
    #[case(AluOp::Add, 7, 5, 12)]
    #[case(AluOp::Sub, 7, 5, 2)]
    #[case(AluOp::And, 0b1100, 0b1010, 0b1000)]
    #[case(AluOp::Or, 0b1100, 0b1010, 0b1110)]
    #[case(AluOp::Xor, 0b1100, 0b1010, 0b0110)]
    #[case(AluOp::Shl, 1, 33, 2)]
    #[case(AluOp::Shr, 0x8000_0000, 31, 1)]
    #[case(AluOp::Sar, 0x8000_0000, 31, 0xFFFF_FFFF)]
    #[case(AluOp::Mul, 6, 7, 42)]
    #[case(AluOp::Divu, 42, 5, 8)]
    #[case(AluOp::Remu, 42, 5, 2)]
    fn alu_results(#[case] op: AluOp, #[case] a: u32, #[case] b: u32, #[case] expected: u32) {
        let (mut regs, mut memory) = machine(&[Operation::Alu {
            op,
            rd: Register::R0,
            ra: Register::R1,
            rb: Register::R2,
        }]);
        regs.set(Register::R1, a);
        regs.set(Register::R2, b);
        assert_eq!(step(&mut regs, &mut memory), ExecuteOutcome::Retired);
        assert_eq!(regs.get(Register::R0), expected);
        assert_eq!(regs.ip(), CODE + 4);
    }

    #[test]
    fn divide_by_zero_faults_precisely() {
        let (mut regs, mut memory) = machine(&[Operation::Alu {
            op: AluOp::Divu,
            rd: Register::R0,
            ra: Register::R1,
            rb: Register::R2,
        }]);
        regs.set(Register::R0, 99);
        match step(&mut regs, &mut memory) {
            ExecuteOutcome::Fault(fault) => {
                assert_eq!(fault.code, FaultCode::DivideByZero);
                assert_eq!(fault.addr, CODE);
            }
            other => panic!("expected fault, got {other:?}"),
        }
        assert_eq!(regs.get(Register::R0), 99);
        assert_eq!(regs.ip(), CODE);
    }

    #[test]
    fn store_fault_commits_nothing() {
        let (mut regs, mut memory) = machine(&[Operation::Store {
            width: Width::Word,
            rs: Register::R1,
            base: Register::R2,
            disp: 0,
        }]);
        regs.set(Register::R2, 0x10);
        let outcome = step(&mut regs, &mut memory);
        assert!(matches!(
            outcome,
            ExecuteOutcome::Fault(fault) if fault.code == FaultCode::UnmappedAccess && fault.addr == 0x10
        ));
        assert_eq!(regs.ip(), CODE);
    }

    #[test]
    fn call_and_ret_use_the_stack() {
        let (mut regs, mut memory) = machine(&[
            Operation::Call { disp: 4 },
            Operation::Nop,
            Operation::Ret,
        ]);
        step(&mut regs, &mut memory);
        assert_eq!(regs.ip(), CODE + 8);
        assert_eq!(regs.sp(), STACK_TOP - 4);
        assert_eq!(memory.read_u32(STACK_TOP - 4).expect("ret addr"), CODE + 4);
        step(&mut regs, &mut memory);
        assert_eq!(regs.ip(), CODE + 4);
        assert_eq!(regs.sp(), STACK_TOP);
    }

    #[test]
    fn push_pop_roundtrip() {
        let (mut regs, mut memory) = machine(&[
            Operation::Push { rd: Register::R3 },
            Operation::Pop { rd: Register::R4 },
        ]);
        regs.set(Register::R3, 0xABCD);
        step(&mut regs, &mut memory);
        step(&mut regs, &mut memory);
        assert_eq!(regs.get(Register::R4), 0xABCD);
        assert_eq!(regs.sp(), STACK_TOP);
    }

    #[test]
    fn compare_and_branch() {
        let (mut regs, mut memory) = machine(&[
            Operation::Cmp {
                rd: Register::R1,
                ra: Register::R2,
            },
            Operation::Branch {
                cond: Condition::Ltu,
                disp: 8,
            },
        ]);
        regs.set(Register::R1, 1);
        regs.set(Register::R2, 2);
        step(&mut regs, &mut memory);
        assert!(regs.flag_is_set(FLAGS_C));
        assert!(!regs.flag_is_set(FLAGS_Z));
        step(&mut regs, &mut memory);
        assert_eq!(regs.ip(), CODE + 16);
    }

    #[test]
    fn syscall_advances_ip_before_dispatch() {
        let (mut regs, mut memory) = machine(&[Operation::Syscall]);
        assert_eq!(step(&mut regs, &mut memory), ExecuteOutcome::Syscall);
        assert_eq!(regs.ip(), CODE + 4);
    }

    #[test]
    fn unsupported_and_undefined_leave_ip() {
        let (mut regs, mut memory) = machine(&[
            Operation::Unsupported { opcode: 0xE1 },
            Operation::Undefined,
        ]);
        assert_eq!(
            step(&mut regs, &mut memory),
            ExecuteOutcome::Unsupported { opcode: 0xE1 }
        );
        assert_eq!(regs.ip(), CODE);
        regs.set_ip(CODE + 4);
        assert!(matches!(
            step(&mut regs, &mut memory),
            ExecuteOutcome::Fault(fault) if fault.code == FaultCode::UndefinedInstruction
        ));
    }

    #[test]
    fn load_byte_zero_extends() {
        let (mut regs, mut memory) = machine(&[Operation::Load {
            width: Width::Byte,
            rd: Register::R0,
            base: Register::Sp,
            disp: -1,
        }]);
        memory.write(STACK_TOP - 1, &[0xFF]).expect("poke");
        step(&mut regs, &mut memory);
        assert_eq!(regs.get(Register::R0), 0xFF);
    }
}
