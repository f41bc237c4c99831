//! Integration tests for the usersim CLI.

use env_logger as _;
use log as _;
use simulator_core::syscall::nr;
use simulator_core::{assemble, Operation, Register};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

const BASE: u32 = 0x0001_0000;

fn binary_path() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    path.pop();
    path.join("usersim")
}

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

/// Image that writes `message` to stdout and exits with `code`. The text
/// follows the code in the same segment.
fn hello_image(message: &str, code: u32) -> Vec<u8> {
    let len = u32::try_from(message.len()).unwrap();
    let program = |text_addr: u32| {
        [
            sys(nr::WRITE, &[1, text_addr, len]),
            sys(nr::EXIT_GROUP, &[code]),
        ]
        .concat()
    };
    let code_len = u32::try_from(assemble(&program(0)).len()).unwrap();
    let mut image = assemble(&program(BASE + code_len));
    image.extend_from_slice(message.as_bytes());
    image
}

fn write_image(dir: &Path, name: &str, image: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, image).unwrap();
    path
}

fn run(args: &[&str]) -> Output {
    Command::new(binary_path())
        .args(args)
        .output()
        .expect("failed to run usersim")
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).to_string()
}

#[test]
fn runs_a_guest_and_exits_with_its_status() {
    let temp_dir = tempfile::tempdir().unwrap();
    let image = write_image(temp_dir.path(), "hello.bin", &hello_image("hello\n", 7));

    let output = run(&["--base=0x10000", image.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(7));
    assert_eq!(output.stdout, b"hello\n");
    assert!(stderr_of(&output).contains("exited with status 7"));
}

#[test]
fn disabled_syscall_is_reported_and_blocked() {
    let temp_dir = tempfile::tempdir().unwrap();
    let image = write_image(temp_dir.path(), "hello.bin", &hello_image("hello\n", 3));

    let output = run(&[
        "--base=0x10000",
        "--disable-syscall=4",
        image.to_str().unwrap(),
    ]);

    assert_eq!(output.status.code(), Some(3));
    assert!(output.stdout.is_empty());
    let stderr = stderr_of(&output);
    assert_eq!(
        stderr
            .matches("usersim: syscall 4 (write) is disabled; blocked")
            .count(),
        1
    );
}

#[test]
fn permissive_disabler_lets_the_call_through() {
    let temp_dir = tempfile::tempdir().unwrap();
    let image = write_image(temp_dir.path(), "hello.bin", &hello_image("hi\n", 0));

    let output = run(&[
        "--base=0x10000",
        "--disable-syscall=4",
        "--permissive",
        image.to_str().unwrap(),
    ]);

    assert!(output.status.success());
    assert_eq!(output.stdout, b"hi\n");
    assert!(stderr_of(&output).contains("syscall 4 (write) is disabled; allowed"));
}

#[test]
fn traced_descriptor_logs_writes() {
    let temp_dir = tempfile::tempdir().unwrap();
    let image = write_image(temp_dir.path(), "hello.bin", &hello_image("hello\n", 0));

    let output = run(&["--base=0x10000", "--trace-fd=1", image.to_str().unwrap()]);

    assert!(output.status.success());
    assert!(stderr_of(&output).contains("write(1) = 6"));
}

#[test]
fn syscall_trace_goes_to_the_trace_file() {
    let temp_dir = tempfile::tempdir().unwrap();
    let image = write_image(temp_dir.path(), "hello.bin", &hello_image("x", 0));
    let trace = temp_dir.path().join("trace.log");

    let output = run(&[
        "--base=0x10000",
        "--trace=syscall",
        &format!("--trace-file={}", trace.display()),
        image.to_str().unwrap(),
    ]);

    assert!(output.status.success());
    let log = fs::read_to_string(&trace).unwrap();
    assert!(log.contains("] write(0x1, "));
}

#[test]
fn illegal_instruction_dumps_core_with_tools() {
    let temp_dir = tempfile::tempdir().unwrap();
    let image = write_image(
        temp_dir.path(),
        "bad.bin",
        &assemble(&[Operation::Nop, Operation::Undefined]),
    );

    let output = run(&[
        "--base=0x10000",
        "--no-activate",
        "--disassemble=core",
        "--show-map-at-coredump",
        image.to_str().unwrap(),
    ]);

    assert_eq!(output.status.code(), Some(128 + 4));
    let stderr = stderr_of(&output);
    assert!(stderr.contains("ShowMapAtCoreDump triggered for process"));
    assert!(stderr.contains("DisassembleAtCoreDump triggered for process"));
    assert!(stderr.contains("killed by SIGILL (core dumped)"));
}

#[test]
fn disassembles_at_the_entry_point() {
    let temp_dir = tempfile::tempdir().unwrap();
    let image = write_image(temp_dir.path(), "hello.bin", &hello_image("", 0));

    let output = run(&[
        "--base=0x10000",
        "--disassemble=oep,show",
        image.to_str().unwrap(),
    ]);

    assert!(output.status.success());
    let stderr = stderr_of(&output);
    assert_eq!(
        stderr
            .matches("DisassembleAtAddress triggered at 0x00010000")
            .count(),
        1
    );
    assert!(stderr.contains("syscall"));
}

#[test]
fn guest_arguments_follow_the_program() {
    let temp_dir = tempfile::tempdir().unwrap();
    let image = write_image(temp_dir.path(), "hello.bin", &hello_image("ok\n", 0));

    let output = run(&[
        "--base=0x10000",
        image.to_str().unwrap(),
        "--not-a-simulator-switch",
    ]);

    assert!(output.status.success());
    assert_eq!(output.stdout, b"ok\n");
}

#[test]
fn unknown_switch_fails_before_running() {
    let output = run(&["--frobnicate", "prog.bin"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("unknown option: --frobnicate"));
}

#[test]
fn bad_disassemble_argument_fails() {
    let output = run(&["--disassemble=oep,nowhere", "prog.bin"]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).contains("invalid argument for --disassemble switch: nowhere"));
}

#[test]
fn missing_program_file_fails() {
    let temp_dir = tempfile::tempdir().unwrap();
    let missing = temp_dir.path().join("absent.bin");

    let output = run(&[missing.to_str().unwrap()]);

    assert_eq!(output.status.code(), Some(1));
    assert!(stderr_of(&output).starts_with("error:"));
}

#[test]
fn help_prints_usage() {
    let output = run(&["--help"]);

    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("Usage: usersim"));
}
