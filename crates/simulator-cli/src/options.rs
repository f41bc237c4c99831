//! Command-line switch parsing for `usersim`.

use std::ffi::OsString;
use std::path::PathBuf;

use simulator_core::loader::DEFAULT_FLAT_BASE;
use simulator_core::TraceFacility;

pub const USAGE_TEXT: &str = "\
Usage: usersim [options] <program> [args...]

Options:
  --disassemble=<what>[,<what>...]  Disassemble at: oep (entry point), core
                                    (core dump), show (whole image after
                                    loading), or a numeric address
  --activate                        Forward host signals to the guest (default)
  --no-activate                     Leave host signal handling alone
  --trace=<facility>[,...]          Trace insn, syscall, signal, thread, mmap,
                                    misc or all
  --trace-file=<path>               Write the trace to a file instead of stderr
  --trace-fd=<fd>[,<fd>...]         Log reads and writes on these descriptors
  --disable-syscall=<nr>[,<nr>...]  Block these syscalls with ENOSYS
  --permissive                      Only report disabled syscalls
  --show-map-at-coredump            Print the memory map before a core dump
  --base=<addr>                     Load address of the flat image
  -v, --verbose                     Debug logging on stderr
  -h, --help                        Show this help message

Arguments after <program> are passed to the guest unchanged.
";

/// Where `--disassemble` listings are produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DisassembleAt {
    pub entry: bool,
    pub core_dump: bool,
    pub show: bool,
    pub addresses: Vec<u32>,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Options {
    pub disassemble: DisassembleAt,
    pub activate: bool,
    pub trace: TraceFacility,
    pub trace_file: Option<PathBuf>,
    pub traced_fds: Vec<u32>,
    pub disabled_syscalls: Vec<u32>,
    pub permissive: bool,
    pub show_map_at_core_dump: bool,
    pub base: u32,
    pub verbose: bool,
    pub argv: Vec<String>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            disassemble: DisassembleAt::default(),
            activate: true,
            trace: TraceFacility::empty(),
            trace_file: None,
            traced_fds: Vec::new(),
            disabled_syscalls: Vec::new(),
            permissive: false,
            show_map_at_core_dump: false,
            base: DEFAULT_FLAT_BASE,
            verbose: false,
            argv: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub enum ParseResult {
    Run(Options),
    Help,
}

/// Parses an unsigned number in decimal or `0x` hexadecimal.
pub fn parse_number(text: &str) -> Option<u32> {
    if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn parse_number_list(switch: &str, value: &str) -> Result<Vec<u32>, String> {
    value
        .split(',')
        .filter(|item| !item.is_empty())
        .map(|item| {
            parse_number(item).ok_or_else(|| format!("invalid argument for {switch} switch: {item}"))
        })
        .collect()
}

fn parse_disassemble(value: &str, target: &mut DisassembleAt) -> Result<(), String> {
    for item in value.split(',').filter(|item| !item.is_empty()) {
        match item {
            "oep" => target.entry = true,
            "core" => target.core_dump = true,
            "show" => target.show = true,
            other => {
                let addr = parse_number(other).ok_or_else(|| {
                    format!("invalid argument for --disassemble switch: {other}")
                })?;
                target.addresses.push(addr);
            }
        }
    }
    Ok(())
}

fn parse_trace(value: &str) -> Result<TraceFacility, String> {
    let mut facilities = TraceFacility::empty();
    for item in value.split(',').filter(|item| !item.is_empty()) {
        facilities |= TraceFacility::parse(item)
            .ok_or_else(|| format!("unknown trace facility: {item}"))?;
    }
    Ok(facilities)
}

fn required<'a>(switch: &str, value: Option<&'a str>) -> Result<&'a str, String> {
    value
        .filter(|value| !value.is_empty())
        .ok_or_else(|| format!("missing value for {switch}"))
}

/// Splits the command line into simulator switches and the guest argv.
/// The first argument that is not a switch names the program; everything
/// from there on belongs to the guest.
#[allow(clippy::while_let_on_iterator)]
pub fn parse_args(mut args: impl Iterator<Item = OsString>) -> Result<ParseResult, String> {
    let mut options = Options::default();

    while let Some(arg) = args.next() {
        let arg = arg.to_string_lossy().to_string();

        if arg == "--help" || arg == "-h" {
            return Ok(ParseResult::Help);
        }
        if arg == "--" {
            options.argv.extend(args.by_ref().map(|a| a.to_string_lossy().to_string()));
            break;
        }
        if !arg.starts_with('-') {
            options.argv.push(arg);
            options.argv.extend(args.by_ref().map(|a| a.to_string_lossy().to_string()));
            break;
        }

        let (switch, value) = match arg.split_once('=') {
            Some((switch, value)) => (switch, Some(value)),
            None => (arg.as_str(), None),
        };
        match switch {
            "--disassemble" => {
                parse_disassemble(required(switch, value)?, &mut options.disassemble)?;
            }
            "--activate" => options.activate = true,
            "--no-activate" => options.activate = false,
            "--trace" => options.trace |= parse_trace(required(switch, value)?)?,
            "--trace-file" => options.trace_file = Some(PathBuf::from(required(switch, value)?)),
            "--trace-fd" => options
                .traced_fds
                .extend(parse_number_list(switch, required(switch, value)?)?),
            "--disable-syscall" => options
                .disabled_syscalls
                .extend(parse_number_list(switch, required(switch, value)?)?),
            "--permissive" => options.permissive = true,
            "--show-map-at-coredump" => options.show_map_at_core_dump = true,
            "--base" => {
                let value = required(switch, value)?;
                options.base = parse_number(value)
                    .ok_or_else(|| format!("invalid argument for --base switch: {value}"))?;
            }
            "--verbose" | "-v" => options.verbose = true,
            _ => return Err(format!("unknown option: {arg}")),
        }
    }

    if options.argv.is_empty() {
        return Err("missing program path".to_string());
    }
    Ok(ParseResult::Run(options))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(items: &[&str]) -> impl Iterator<Item = OsString> {
        items
            .iter()
            .map(OsString::from)
            .collect::<Vec<_>>()
            .into_iter()
    }

    fn parse(items: &[&str]) -> Options {
        match parse_args(args(items)).expect("valid arguments should parse") {
            ParseResult::Run(options) => options,
            ParseResult::Help => panic!("unexpected help"),
        }
    }

    #[test]
    fn program_and_guest_arguments_end_switch_parsing() {
        let options = parse(&["--no-activate", "prog.bin", "--trace=all", "x"]);
        assert!(!options.activate);
        assert_eq!(options.trace, TraceFacility::empty());
        assert_eq!(options.argv, vec!["prog.bin", "--trace=all", "x"]);
    }

    #[test]
    fn double_dash_allows_a_dashed_program_name() {
        let options = parse(&["--", "-odd"]);
        assert_eq!(options.argv, vec!["-odd"]);
    }

    #[test]
    fn disassemble_accepts_keywords_and_addresses() {
        let options = parse(&["--disassemble=oep,core,0x1000,show,64", "p"]);
        assert_eq!(
            options.disassemble,
            DisassembleAt {
                entry: true,
                core_dump: true,
                show: true,
                addresses: vec![0x1000, 64],
            }
        );
    }

    #[test]
    fn disassemble_rejects_garbage() {
        let error = parse_args(args(&["--disassemble=oep,xyz", "p"]))
            .expect_err("bad address should fail");
        assert!(error.contains("invalid argument for --disassemble switch: xyz"));
    }

    #[test]
    fn trace_facilities_accumulate() {
        let options = parse(&["--trace=syscall", "--trace=signal,thread", "p"]);
        assert_eq!(
            options.trace,
            TraceFacility::SYSCALL | TraceFacility::SIGNAL | TraceFacility::THREAD
        );
    }

    #[test]
    fn unknown_trace_facility_fails() {
        let error = parse_args(args(&["--trace=bogus", "p"])).expect_err("should fail");
        assert!(error.contains("unknown trace facility"));
    }

    #[test]
    fn syscall_and_fd_lists_parse() {
        let options = parse(&[
            "--disable-syscall=4,0x66",
            "--permissive",
            "--trace-fd=1,2",
            "--show-map-at-coredump",
            "--base=0x10000",
            "p",
        ]);
        assert_eq!(options.disabled_syscalls, vec![4, 0x66]);
        assert!(options.permissive);
        assert_eq!(options.traced_fds, vec![1, 2]);
        assert!(options.show_map_at_core_dump);
        assert_eq!(options.base, 0x10000);
    }

    #[test]
    fn defaults_activate_and_use_the_flat_base() {
        let options = parse(&["p"]);
        assert!(options.activate);
        assert_eq!(options.base, DEFAULT_FLAT_BASE);
        assert!(options.trace_file.is_none());
    }

    #[test]
    fn missing_program_fails() {
        let error = parse_args(args(&["--activate"])).expect_err("should fail");
        assert!(error.contains("missing program"));
    }

    #[test]
    fn missing_switch_value_fails() {
        let error = parse_args(args(&["--trace-file", "p"])).expect_err("should fail");
        assert!(error.contains("missing value for --trace-file"));
    }

    #[test]
    fn unknown_option_fails() {
        let error = parse_args(args(&["--frobnicate", "p"])).expect_err("should fail");
        assert!(error.contains("unknown option"));
    }

    #[test]
    fn help_short_circuits() {
        assert!(matches!(
            parse_args(args(&["-h", "p"])),
            Ok(ParseResult::Help)
        ));
    }

    #[test]
    fn numbers_parse_in_decimal_and_hex() {
        assert_eq!(parse_number("17"), Some(17));
        assert_eq!(parse_number("0x1F"), Some(0x1f));
        assert_eq!(parse_number("0xZZ"), None);
        assert_eq!(parse_number(""), None);
    }
}
