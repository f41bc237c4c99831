//! Analysis tools, trigger registry and host signal forwarding.

use std::env;
use std::os::unix::process::ExitStatusExt;
use std::process::Command;
use std::sync::Arc;

use nix::sys::signal::{raise, Signal as HostSignal};
use simulator_core::syscall::nr;
use simulator_core::tools::{CPUID_FEATURES, CPUID_VENDOR};
use simulator_core::{
    assemble, from_fn, ActivationGuard, Context, DisassembleAtAddress, DisassembleAtCoreDump,
    InsnArgs, Operation, ProcessStatus, Register, ShowMapAtCoreDump, Signal, Simulator,
    SimulatorConfig, StaticImageLoader, TraceOutput, TriggerRegistry, UnhandledInstruction, When,
};

use bitflags as _;
use log as _;
use parking_lot as _;
use proptest as _;
use rstest as _;
#[cfg(feature = "serde")]
use serde as _;
use signal_hook as _;
use thiserror as _;

const BASE: u32 = 0x0001_0000;

fn sys(callno: u32, args: &[u32]) -> Vec<Operation> {
    let mut ops = vec![Operation::LoadImm {
        rd: Register::R0,
        imm: callno,
    }];
    for (rd, &imm) in Register::GENERAL[1..].iter().zip(args) {
        ops.push(Operation::LoadImm { rd: *rd, imm });
    }
    ops.push(Operation::Syscall);
    ops
}

fn simulator_with(ops: &[Operation], host_signals: Vec<Signal>) -> Simulator {
    let config = SimulatorConfig {
        trace_output: TraceOutput::Memory,
        host_signals,
        ..SimulatorConfig::default()
    };
    let loader = StaticImageLoader::code(BASE, assemble(ops));
    Simulator::with_loader(config, Box::new(loader)).expect("valid configuration")
}

fn simulator(ops: &[Operation]) -> Simulator {
    simulator_with(ops, Vec::new())
}

fn run(sim: &mut Simulator) -> ProcessStatus {
    sim.exec(&["guest".to_string()]).expect("exec");
    sim.main_loop().expect("main loop")
}

fn register_after_exit(sim: &Simulator, reg: Register) -> u32 {
    let process = sim.process().expect("process");
    process
        .thread(process.pid())
        .expect("main thread")
        .regs()
        .get(reg)
}

#[test]
fn trigger_registry_reports_hit_and_exhaustion_together() {
    let triggers = TriggerRegistry::new();
    assert!(triggers.arm(0x10));
    assert!(!triggers.arm(0x10));
    assert!(triggers.arm(0x20));

    let miss = triggers.take_hit(0x30);
    assert!(!miss.hit);
    assert!(!miss.exhausted);

    let first = triggers.take_hit(0x10);
    assert!(first.hit);
    assert!(!first.exhausted);

    let last = triggers.take_hit(0x20);
    assert!(last.hit);
    assert!(last.exhausted);
    assert!(triggers.armed().is_empty());
}

#[test]
fn disassemble_at_address_lists_code_then_removes_itself() {
    let code = [vec![Operation::Nop, Operation::Nop], sys(nr::EXIT_GROUP, &[0])].concat();
    let mut sim = simulator(&code);
    let triggers = Arc::new(TriggerRegistry::new());
    triggers.arm(BASE + 4);
    let tool = DisassembleAtAddress::new(Arc::clone(&triggers), sim.transcript().clone());
    sim.callbacks_mut().add_insn_callback(When::Before, tool);
    // Arms the next instruction right after the tool has removed itself.
    let rearm = Arc::clone(&triggers);
    sim.callbacks_mut().add_insn_callback(
        When::Before,
        from_fn(move |enabled: bool, args: &InsnArgs, _: &mut Context<'_>| {
            if args.insn.address == BASE + 4 {
                rearm.arm(BASE + 8);
            }
            enabled
        }),
    );

    assert_eq!(run(&mut sim), ProcessStatus::Exited(0));
    let lines = sim.transcript().lines();
    assert_eq!(
        lines[0],
        format!(
            "DisassembleAtAddress triggered at 0x{:08x} for process {}",
            BASE + 4,
            sim.process().expect("process").pid()
        )
    );
    assert!(lines[1].starts_with("  0x00010004:"));
    assert!(lines[1].ends_with("nop"));
    assert_eq!(
        lines.iter().filter(|line| line.contains("triggered")).count(),
        1
    );
    assert!(triggers.is_armed(BASE + 8));

    let process = sim.process().expect("process");
    assert_eq!(process.callbacks().chain::<InsnArgs>(When::Before).len(), 1);
    assert!(process
        .threads()
        .all(|thread| thread.callbacks().chain::<InsnArgs>(When::Before).len() == 1));
}

#[test]
fn coredump_tools_report_map_and_code() {
    let mut sim = simulator(&[Operation::Nop, Operation::Undefined]);
    let transcript = sim.transcript().clone();
    sim.callbacks_mut()
        .add_process_callback(When::Before, ShowMapAtCoreDump::new(transcript.clone()));
    sim.callbacks_mut()
        .add_process_callback(When::Before, DisassembleAtCoreDump::new(transcript));

    let status = run(&mut sim);
    assert_eq!(
        status,
        ProcessStatus::Killed {
            signal: Signal::SIGILL,
            core_dumped: true
        }
    );
    let pid = sim.process().expect("process").pid();
    let lines = sim.transcript().lines();
    assert_eq!(
        lines[0],
        format!("  ShowMapAtCoreDump triggered for process {pid}")
    );
    assert!(lines.iter().any(|line| line.ends_with("[text]")));
    assert!(lines.iter().any(|line| line.ends_with("[stack]")));
    assert!(lines
        .iter()
        .any(|line| *line == format!("DisassembleAtCoreDump triggered for process {pid}")));
    assert!(lines.iter().any(|line| line.ends_with(" ud")));
}

#[test]
fn unhandled_instruction_tool_implements_cpuid() {
    let code = [
        vec![
            Operation::Unsupported { opcode: 0xE0 },
            Operation::Mov {
                rd: Register::R3,
                ra: Register::R1,
            },
        ],
        sys(nr::EXIT_GROUP, &[0]),
    ]
    .concat();
    let mut sim = simulator(&code);
    sim.callbacks_mut()
        .unhandled_insn_mut()
        .append(UnhandledInstruction::new());
    assert_eq!(run(&mut sim), ProcessStatus::Exited(0));
    assert_eq!(register_after_exit(&sim, Register::R3), CPUID_VENDOR);
    assert_eq!(register_after_exit(&sim, Register::R2), CPUID_FEATURES);
}

#[test]
fn unhandled_instruction_tool_implements_rdtsc() {
    let code = [
        vec![
            Operation::Nop,
            Operation::Nop,
            Operation::Unsupported { opcode: 0xE1 },
            Operation::Mov {
                rd: Register::R3,
                ra: Register::R0,
            },
        ],
        sys(nr::EXIT_GROUP, &[0]),
    ]
    .concat();
    let mut sim = simulator(&code);
    sim.callbacks_mut()
        .unhandled_insn_mut()
        .append(UnhandledInstruction::new());
    assert_eq!(run(&mut sim), ProcessStatus::Exited(0));
    assert_eq!(register_after_exit(&sim, Register::R3), 3);
}

#[test]
fn activation_guard_collects_raised_signals() {
    let guard = ActivationGuard::install(&[Signal::SIGUSR2]).expect("install handler");
    assert_eq!(guard.signals(), vec![Signal::SIGUSR2]);
    assert!(guard.take_pending().is_empty());
    raise(HostSignal::SIGUSR2).expect("raise");
    assert_eq!(guard.take_pending(), vec![Signal::SIGUSR2]);
    assert!(guard.take_pending().is_empty());
    drop(guard);
}

/// Set in the re-executed test binary that runs the child half of
/// `deactivation_restores_the_host_default_action`.
const DEACTIVATED_CHILD: &str = "USERSIM_DEACTIVATED_CHILD";

#[test]
fn deactivation_restores_the_host_default_action() {
    if env::var_os(DEACTIVATED_CHILD).is_some() {
        let mut sim = simulator_with(&sys(nr::EXIT_GROUP, &[0]), vec![Signal::SIGTERM]);
        sim.activate().expect("activate");
        raise(HostSignal::SIGTERM).expect("raise while active");
        sim.deactivate();
        raise(HostSignal::SIGTERM).expect("raise after deactivate");
        std::thread::sleep(std::time::Duration::from_secs(2));
        std::process::exit(0);
    }

    let exe = env::current_exe().expect("test binary path");
    let status = Command::new(exe)
        .args([
            "--exact",
            "deactivation_restores_the_host_default_action",
            "--nocapture",
            "--test-threads=1",
        ])
        .env(DEACTIVATED_CHILD, "1")
        .status()
        .expect("spawn child");
    assert_eq!(status.signal(), Some(HostSignal::SIGTERM as i32));
}

#[test]
fn host_signal_is_forwarded_to_the_guest() {
    let spin = [Operation::Jump { disp: -4 }];
    let mut sim = simulator_with(&spin, vec![Signal::SIGUSR1]);
    sim.exec(&["guest".to_string()]).expect("exec");
    sim.activate().expect("activate");
    assert!(sim.is_active());
    raise(HostSignal::SIGUSR1).expect("raise");

    let status = sim.main_loop().expect("main loop");
    assert_eq!(
        status,
        ProcessStatus::Killed {
            signal: Signal::SIGUSR1,
            core_dumped: false
        }
    );
    sim.deactivate();
    assert!(!sim.is_active());
}

#[test]
fn main_loop_without_a_process_is_an_error() {
    let mut sim = simulator(&[Operation::Nop]);
    assert!(sim.main_loop().is_err());
    let mut out = Vec::new();
    sim.describe_termination(&mut out).expect("write");
    assert_eq!(out, b"no process was executed\n");
    assert_eq!(sim.exit_status(), 0);
}
