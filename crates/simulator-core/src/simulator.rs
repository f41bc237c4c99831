//! Simulator facade: configuration, template callbacks, process execution
//! and the scheduling loop.

use std::fs::File;
use std::io::{self, LineWriter, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::activation::ActivationGuard;
use crate::adapter::AdapterTarget;
use crate::api::{SimError, SimulatorConfig, TraceOutput};
use crate::callbacks::{Callbacks, ProcessReason};
use crate::disasm::{Disassembler, LinearSweep};
use crate::loader::{FlatImageLoader, Loader};
use crate::process::{Process, ProcessStatus, Services};
use crate::state::ThreadState;
use crate::syscall::SyscallTable;
use crate::thread::{Thread, Tid};
use crate::trace::{TraceFacility, Tracer, Transcript};

/// Sleep between host-signal polls while no guest thread can run.
const IDLE_POLL: Duration = Duration::from_millis(10);

fn open_transcript(output: &TraceOutput) -> Result<Transcript, SimError> {
    Ok(match output {
        TraceOutput::Stderr => Transcript::stderr(),
        TraceOutput::Stdout => Transcript::stdout(),
        TraceOutput::Memory => Transcript::memory(),
        TraceOutput::File(path) => {
            let file = File::create(path).map_err(|source| SimError::TraceOutput {
                path: path.clone(),
                source,
            })?;
            Transcript::writer(Box::new(LineWriter::new(file)))
        }
    })
}

/// Owns the configuration, the callbacks copied into each new process, the
/// shared syscall table and the process being simulated.
pub struct Simulator {
    config: SimulatorConfig,
    loader: Box<dyn Loader>,
    callbacks: Callbacks,
    syscalls: Arc<SyscallTable>,
    tracer: Tracer,
    disassembler: Arc<dyn Disassembler>,
    process: Option<Process>,
    activation: Option<ActivationGuard>,
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("config", &self.config)
            .field("process", &self.process)
            .field("active", &self.activation.is_some())
            .finish_non_exhaustive()
    }
}

impl Simulator {
    /// Simulator loading flat images from the path in `argv[0]`.
    ///
    /// # Errors
    ///
    /// Rejects an invalid configuration or an unopenable trace file.
    pub fn new(config: SimulatorConfig) -> Result<Self, SimError> {
        Self::with_loader(config, Box::new(FlatImageLoader::default()))
    }

    /// Simulator using a custom loader.
    ///
    /// # Errors
    ///
    /// Rejects an invalid configuration or an unopenable trace file.
    pub fn with_loader(config: SimulatorConfig, loader: Box<dyn Loader>) -> Result<Self, SimError> {
        config.validate()?;
        let transcript = open_transcript(&config.trace_output)?;
        Ok(Self {
            tracer: Tracer::new(config.trace, transcript),
            config,
            loader,
            callbacks: Callbacks::new(),
            syscalls: Arc::new(SyscallTable::linux()),
            disassembler: Arc::new(LinearSweep),
            process: None,
            activation: None,
        })
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Callbacks copied into the next executed process.
    #[must_use]
    pub const fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    /// Template callbacks, mutably. Changes affect only later `exec` calls.
    pub const fn callbacks_mut(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }

    /// Syscall table shared with every process.
    #[must_use]
    pub const fn syscall_table(&self) -> &Arc<SyscallTable> {
        &self.syscalls
    }

    /// Guest trace destination; tools usually write here too.
    #[must_use]
    pub const fn transcript(&self) -> &Transcript {
        self.tracer.transcript()
    }

    /// Replaces the disassembly service used by later processes.
    pub fn set_disassembler(&mut self, disassembler: Arc<dyn Disassembler>) {
        self.disassembler = disassembler;
    }

    /// The executed process, if any.
    #[must_use]
    pub const fn process(&self) -> Option<&Process> {
        self.process.as_ref()
    }

    /// The executed process, mutably.
    pub const fn process_mut(&mut self) -> Option<&mut Process> {
        self.process.as_mut()
    }

    /// Loads `argv[0]` and creates its process with a main thread that has
    /// not run yet. Fires `Exec`.
    ///
    /// # Errors
    ///
    /// Loader failures and images that cannot be mapped.
    pub fn exec(&mut self, argv: &[String]) -> Result<&mut Process, SimError> {
        let image = self.loader.load(argv)?;
        let services = Services {
            syscalls: Arc::clone(&self.syscalls),
            tracer: self.tracer.clone(),
            disassembler: Arc::clone(&self.disassembler),
        };
        let process = Process::exec(
            image,
            argv,
            &self.config,
            self.callbacks.duplicate(),
            services,
        )?;
        Ok(self.process.insert(process))
    }

    /// Starts intercepting the configured host signals and fires `Attach`.
    /// Calling it again while active does nothing.
    ///
    /// # Errors
    ///
    /// Fails when a host handler cannot be installed.
    pub fn activate(&mut self) -> Result<(), SimError> {
        if self.activation.is_some() {
            return Ok(());
        }
        let guard =
            ActivationGuard::install(&self.config.host_signals).map_err(SimError::Activation)?;
        self.activation = Some(guard);
        if let Some(process) = self.process.as_mut() {
            process.fire_process_event(ProcessReason::Attach, None);
        }
        Ok(())
    }

    /// Whether host signals are being intercepted.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.activation.is_some()
    }

    /// Stops intercepting host signals.
    pub fn deactivate(&mut self) {
        if self.activation.take().is_some() {
            log::debug!("host signal interception removed");
        }
    }

    fn forward_host_signals(&mut self) {
        let (Some(guard), Some(process)) = (self.activation.as_ref(), self.process.as_mut()) else {
            return;
        };
        for signal in guard.take_pending() {
            log::debug!("forwarding host {signal} to the guest");
            process.post_signal(signal);
        }
        process.settle();
    }

    /// Runs the process until it has terminated and every thread is gone.
    ///
    /// Live threads run round-robin in tid order, `quantum` instructions per
    /// turn; `sched_yield` ends a turn early. Host signals are forwarded
    /// between rounds. A process with no runnable thread idles while the
    /// simulator is active; inactive, the loop returns the stopped status.
    ///
    /// # Errors
    ///
    /// [`SimError::NoProcess`] when nothing was executed.
    pub fn main_loop(&mut self) -> Result<ProcessStatus, SimError> {
        loop {
            self.forward_host_signals();
            let process = self.process.as_mut().ok_or(SimError::NoProcess)?;
            if process.is_terminal() && process.live_tids().is_empty() {
                process.settle();
                return Ok(process.status());
            }

            let runnable: Vec<_> = process
                .threads()
                .filter(|thread| thread.state() == ThreadState::Runnable)
                .map(|thread| thread.tid())
                .collect();
            if runnable.is_empty() {
                if self.activation.is_none() {
                    log::warn!("no runnable thread and no host signal source");
                    return Ok(process.status());
                }
                thread::sleep(IDLE_POLL);
                continue;
            }

            for tid in runnable {
                Self::run_turn(process, tid, self.config.quantum);
                if process.is_terminal() {
                    break;
                }
            }
        }
    }

    fn run_turn(process: &mut Process, tid: Tid, quantum: u32) {
        for _ in 0..quantum {
            let runnable = process
                .thread(tid)
                .is_some_and(|thread| thread.state() == ThreadState::Runnable);
            if !runnable || process.is_terminal() {
                return;
            }
            process.step(tid);
            if process
                .thread_mut(tid)
                .is_some_and(Thread::take_yield)
            {
                return;
            }
        }
    }

    /// Writes how the process ended.
    ///
    /// # Errors
    ///
    /// Propagates write failures.
    pub fn describe_termination(&self, out: &mut dyn Write) -> io::Result<()> {
        match &self.process {
            None => writeln!(out, "no process was executed"),
            Some(process) => {
                let status = process.status();
                self.tracer.emit(TraceFacility::MISC, || {
                    format!("describe termination of {}", process.pid())
                });
                writeln!(out, "process {} {status}", process.pid())
            }
        }
    }

    /// Exit status the host should report: the guest's exit code, or 128
    /// plus the fatal signal.
    #[must_use]
    pub fn exit_status(&self) -> i32 {
        self.process
            .as_ref()
            .map_or(0, |process| process.status().exit_code())
    }

    /// Deactivates and exits the host process with [`Simulator::exit_status`].
    pub fn terminate_self(&mut self) -> ! {
        self.deactivate();
        let status = self.exit_status();
        if let Err(err) = io::stdout().flush() {
            log::warn!("cannot flush stdout: {err}");
        }
        if let Err(err) = io::stderr().flush() {
            log::warn!("cannot flush stderr: {err}");
        }
        std::process::exit(status)
    }
}

impl AdapterTarget for Simulator {
    fn callbacks_mut(&mut self) -> &mut Callbacks {
        Self::callbacks_mut(self)
    }
}
