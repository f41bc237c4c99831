//! Signal posting, forcing, delivery and handler return.

use super::{Process, ProcessStatus};
use crate::callbacks::{ProcessReason, SignalArgs, SignalReason, When};
use crate::signal::{
    DefaultAction, SigAction, SigHandler, Signal, SA_NODEFER, SA_RESETHAND, SA_RESTORER,
};
use crate::state::{Register, ThreadState};
use crate::thread::{SignalFrame, Tid};
use crate::trace::TraceFacility;

impl Process {
    /// Posts a process-directed signal. Fires the `Signal` lifecycle event;
    /// unless vetoed, the signal goes to the first live thread not blocking
    /// it, or to the lowest live thread when all block it.
    pub fn post_signal(&mut self, signal: Signal) -> bool {
        let live = self.live_tids();
        let Some(&fallback) = live.first() else {
            return false;
        };
        let target = live
            .iter()
            .copied()
            .find(|tid| {
                self.thread(*tid)
                    .is_some_and(|thread| !thread.sigmask().contains(signal))
            })
            .unwrap_or(fallback);
        let mut posted = false;
        self.process_event(ProcessReason::Signal, Some(signal), |process| {
            posted = process.post_thread_signal(target, signal);
        });
        posted
    }

    /// Posts `signal` to one thread. Runs the signal chains with reason
    /// `Arrival`; a vetoed signal is discarded. Returns whether it was
    /// accepted.
    pub fn post_thread_signal(&mut self, tid: Tid, signal: Signal) -> bool {
        if !self.thread(tid).is_some_and(|thread| thread.is_live()) {
            return false;
        }
        let args = SignalArgs {
            tid,
            signal,
            reason: SignalReason::Arrival,
        };
        let enabled = self.run_thread_chain(tid, When::Before, true, &args);
        if enabled {
            self.accept_signal(tid, signal);
        }
        self.run_thread_chain(tid, When::After, enabled, &args);
        enabled
    }

    fn accept_signal(&mut self, tid: Tid, signal: Signal) {
        self.tracer()
            .emit(TraceFacility::SIGNAL, || format!("[{tid}] {signal} posted"));
        if signal == Signal::SIGKILL {
            self.set_terminal(ProcessStatus::Killed {
                signal,
                core_dumped: false,
            });
            return;
        }
        if signal == Signal::SIGCONT {
            self.resume();
        }
        if self.sigactions.is_ignored(signal) {
            log::trace!("thread {tid}: {signal} ignored");
            return;
        }
        if let Some(thread) = self.thread_mut(tid) {
            thread.pending_mut().insert(signal);
        }
    }

    fn resume(&mut self) {
        if matches!(self.status, ProcessStatus::Stopped(_)) {
            self.status = ProcessStatus::Running;
        }
        for thread in self.threads_mut() {
            if thread.state() == ThreadState::Stopped {
                thread.set_state(ThreadState::Runnable);
            }
        }
    }

    /// Posts a synchronous fault signal. An ignored disposition is reset to
    /// default and the signal is unblocked first, so the fault cannot be
    /// silently skipped.
    pub fn force_signal(&mut self, tid: Tid, signal: Signal) {
        let action = self.sigactions.get(signal);
        if action.handler == SigHandler::Ignore {
            self.sigactions.set(signal, SigAction::default());
        }
        if let Some(thread) = self.thread_mut(tid) {
            let mut mask = thread.sigmask();
            mask.remove(signal);
            thread.set_sigmask(mask);
        }
        self.post_thread_signal(tid, signal);
    }

    /// Delivers the lowest pending unblocked signal of `tid`, if any.
    /// Returns whether a signal was taken off the pending set.
    pub fn deliver_pending(&mut self, tid: Tid) -> bool {
        let signal = match self.thread_mut(tid) {
            Some(thread) if thread.state() == ThreadState::Runnable => {
                let Some(signal) = thread.next_deliverable() else {
                    return false;
                };
                thread.pending_mut().remove(signal);
                signal
            }
            _ => return false,
        };
        if self.is_terminal() {
            return false;
        }

        let args = SignalArgs {
            tid,
            signal,
            reason: SignalReason::Delivery,
        };
        let enabled = self.run_thread_chain(tid, When::Before, true, &args);
        if enabled {
            self.act_on_signal(tid, signal);
        }
        self.run_thread_chain(tid, When::After, enabled, &args);
        true
    }

    fn act_on_signal(&mut self, tid: Tid, signal: Signal) {
        let action = self.sigactions.get(signal);
        match action.handler {
            SigHandler::Ignore => {}
            SigHandler::Handler(addr) => self.enter_handler(tid, signal, action, addr),
            SigHandler::Default => match signal.default_action() {
                DefaultAction::Ignore | DefaultAction::Continue => {}
                DefaultAction::Terminate | DefaultAction::CoreDump => self.kill(signal),
                DefaultAction::Stop => self.stop(signal),
            },
        }
    }

    fn stop(&mut self, signal: Signal) {
        self.tracer()
            .emit(TraceFacility::SIGNAL, || format!("process stopped by {signal}"));
        self.status = ProcessStatus::Stopped(signal);
        for thread in self.threads_mut() {
            if thread.is_live() {
                thread.set_state(ThreadState::Stopped);
            }
        }
    }

    /// Kills the process with `signal`, running the coredump event first when
    /// the signal's default action produces a core.
    pub fn kill(&mut self, signal: Signal) {
        if self.is_terminal() {
            return;
        }
        let core_dumped = if signal.default_action() == DefaultAction::CoreDump {
            self.coredump(signal)
        } else {
            false
        };
        self.set_terminal(ProcessStatus::Killed {
            signal,
            core_dumped,
        });
    }

    fn coredump(&mut self, signal: Signal) -> bool {
        self.process_event(ProcessReason::Coredump, Some(signal), |process| {
            process.core_dumped = true;
            let segments = process.memory.len();
            let threads = process.threads.len();
            process.tracer().emit(TraceFacility::MISC, || {
                format!("core: {signal}, {segments} segments, {threads} threads")
            });
        })
    }

    fn enter_handler(&mut self, tid: Tid, signal: Signal, action: SigAction, addr: u32) {
        let Some((thread, memory)) = self.thread_and_memory(tid) else {
            return;
        };
        let saved = SignalFrame {
            regs: *thread.regs(),
            mask: thread.sigmask(),
        };
        let return_address = if action.flags & SA_RESTORER == 0 {
            0
        } else {
            action.restorer
        };
        let sp = thread.regs().sp().wrapping_sub(4);
        if memory.write_u32(sp, return_address).is_err() {
            log::debug!("thread {tid}: no room for the {signal} frame");
            self.kill(Signal::SIGSEGV);
            return;
        }
        thread.push_frame(saved);
        let regs = thread.regs_mut();
        regs.set_sp(sp);
        regs.set(Register::R1, u32::from(signal.as_u8()));
        regs.set_ip(addr);
        let mut mask = saved.mask.union(action.mask);
        if action.flags & SA_NODEFER == 0 {
            mask.insert(signal);
        }
        thread.set_sigmask(mask);
        if action.flags & SA_RESETHAND != 0 {
            self.sigactions.set(signal, SigAction::default());
        }
        self.tracer().emit(TraceFacility::SIGNAL, || {
            format!("[{tid}] {signal} delivered to handler 0x{addr:08x}")
        });
    }

    /// Returns from the innermost signal handler of `tid`, restoring its
    /// registers and mask. False when no handler frame exists.
    pub fn sigreturn(&mut self, tid: Tid) -> bool {
        let Some(thread) = self.thread_mut(tid) else {
            return false;
        };
        let Some(frame) = thread.pop_frame() else {
            return false;
        };
        *thread.regs_mut() = frame.regs;
        thread.set_sigmask(frame.mask);
        true
    }
}
