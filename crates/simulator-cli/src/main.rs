//! CLI entry point for the `usersim` user-mode process simulator.

mod options;

use std::env;
use std::io;
use std::sync::Arc;

use simulator_core::{
    Adapter, DisassembleAtAddress, DisassembleAtCoreDump, DisablerMode, FlatImageLoader,
    Permissions, ShowMapAtCoreDump, Simulator, SimulatorConfig, SyscallDisabler, TraceFileIo,
    TraceOutput, TriggerRegistry, UnhandledInstruction, When,
};
#[cfg(test)]
use tempfile as _;

use crate::options::{parse_args, Options, ParseResult, USAGE_TEXT};

const DISABLER_PREFIX: &str = "usersim: ";

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn config_for(options: &Options) -> SimulatorConfig {
    SimulatorConfig {
        trace: options.trace,
        trace_output: options
            .trace_file
            .clone()
            .map_or(TraceOutput::Stderr, TraceOutput::File),
        envp: env::vars().map(|(key, value)| format!("{key}={value}")).collect(),
        ..SimulatorConfig::default()
    }
}

/// Installs the callbacks and adapters the switches ask for. Returns the
/// trigger registry when address-triggered disassembly is wanted.
fn install_tools(sim: &mut Simulator, options: &Options) -> Option<Arc<TriggerRegistry>> {
    let transcript = sim.transcript().clone();

    sim.callbacks_mut()
        .unhandled_insn_mut()
        .append(UnhandledInstruction::new());

    if options.show_map_at_core_dump {
        sim.callbacks_mut()
            .add_process_callback(When::Before, ShowMapAtCoreDump::new(transcript.clone()));
    }
    if options.disassemble.core_dump {
        sim.callbacks_mut()
            .add_process_callback(When::Before, DisassembleAtCoreDump::new(transcript.clone()));
    }

    if !options.disabled_syscalls.is_empty() {
        let disabler = SyscallDisabler::new(true);
        for &callno in &options.disabled_syscalls {
            disabler.disable_syscall(callno);
        }
        let mode = if options.permissive {
            DisablerMode::Permissive
        } else {
            DisablerMode::Strict
        };
        disabler
            .mode(mode)
            .prefix(DISABLER_PREFIX)
            .transcript(&transcript);
        disabler.attach(sim);
    }

    if !options.traced_fds.is_empty() {
        let tracer = TraceFileIo::new(transcript.clone());
        for &fd in &options.traced_fds {
            tracer.trace_fd(fd);
        }
        tracer.attach(sim);
    }

    if !options.disassemble.entry && options.disassemble.addresses.is_empty() {
        return None;
    }
    let triggers = Arc::new(TriggerRegistry::new());
    for &addr in &options.disassemble.addresses {
        triggers.arm(addr);
    }
    sim.callbacks_mut().add_insn_callback(
        When::Before,
        DisassembleAtAddress::new(Arc::clone(&triggers), transcript),
    );
    Some(triggers)
}

fn show_disassembly(sim: &Simulator) {
    let Some(process) = sim.process() else {
        return;
    };
    let transcript = sim.transcript();
    for entry in process.memory().entries() {
        if !entry.perms.contains(Permissions::EXEC) {
            continue;
        }
        transcript.line(&format!("{}:", entry.name));
        transcript.block(&process.render_disassembly(
            entry.start,
            entry.start.saturating_add(entry.len),
            "  ",
        ));
    }
}

/// Loads and runs the guest. The returned simulator holds the terminated
/// process.
fn simulate(options: &Options) -> Result<Simulator, String> {
    let loader = FlatImageLoader::new(options.base);
    let mut sim = Simulator::with_loader(config_for(options), Box::new(loader))
        .map_err(|e| e.to_string())?;
    let triggers = install_tools(&mut sim, options);

    log::info!("executing {}", options.argv[0]);
    let entry = sim.exec(&options.argv).map_err(|e| e.to_string())?.entry();
    if options.disassemble.show {
        show_disassembly(&sim);
    }
    if let Some(triggers) = triggers.filter(|_| options.disassemble.entry) {
        triggers.arm(entry);
    }

    if options.activate {
        sim.activate().map_err(|e| e.to_string())?;
    }
    let status = sim.main_loop().map_err(|e| e.to_string())?;
    log::debug!("guest finished: {status}");
    if options.activate {
        sim.deactivate();
    }
    Ok(sim)
}

fn main() {
    let options = match parse_args(env::args_os().skip(1)) {
        Ok(ParseResult::Help) => {
            println!("{USAGE_TEXT}");
            std::process::exit(0);
        }
        Ok(ParseResult::Run(options)) => options,
        Err(error) => {
            eprintln!("error: {error}");
            eprintln!("{USAGE_TEXT}");
            std::process::exit(1);
        }
    };
    init_logging(options.verbose);

    let mut sim = match simulate(&options) {
        Ok(sim) => sim,
        Err(error) => {
            eprintln!("error: {error}");
            std::process::exit(1);
        }
    };
    if let Err(error) = sim.describe_termination(&mut io::stderr()) {
        log::warn!("cannot describe termination: {error}");
    }
    sim.terminate_self();
}

#[cfg(test)]
mod tests {
    use super::*;
    use simulator_core::TraceFacility;
    use std::path::PathBuf;

    #[test]
    fn config_routes_trace_to_the_requested_file() {
        let options = Options {
            trace: TraceFacility::SYSCALL,
            trace_file: Some(PathBuf::from("trace.log")),
            ..Options::default()
        };
        let config = config_for(&options);
        assert_eq!(config.trace, TraceFacility::SYSCALL);
        assert_eq!(
            config.trace_output,
            TraceOutput::File(PathBuf::from("trace.log"))
        );
    }

    #[test]
    fn config_defaults_to_stderr() {
        let config = config_for(&Options::default());
        assert_eq!(config.trace_output, TraceOutput::Stderr);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn address_triggers_are_armed_before_exec() {
        let mut options = Options::default();
        options.disassemble.addresses = vec![0x1000, 0x2000];
        let mut sim = Simulator::new(SimulatorConfig {
            trace_output: TraceOutput::Memory,
            ..SimulatorConfig::default()
        })
        .expect("valid configuration");
        let triggers = install_tools(&mut sim, &options).expect("registry");
        assert_eq!(triggers.armed(), vec![0x1000, 0x2000]);
        assert!(!sim.callbacks().is_empty());
    }

    #[test]
    fn no_disassembly_request_means_no_registry() {
        let mut sim = Simulator::new(SimulatorConfig::default()).expect("valid configuration");
        assert!(install_tools(&mut sim, &Options::default()).is_none());
    }
}
