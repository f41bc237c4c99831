use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use nix::errno::Errno;
use parking_lot::{Mutex, MutexGuard};

use super::{Adapter, AdapterTarget};
use crate::callbacks::{invoke, Callback, CallbackChain, CallbackId, Context, SyscallArgs, When};
use crate::syscall::errno_return;
use crate::trace::Transcript;

/// What happens to a disabled syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DisablerMode {
    /// Log the call and let it run.
    Permissive,
    /// Log the call and fail it with the configured errno.
    #[default]
    Strict,
}

#[derive(Debug)]
struct Policy {
    default_enabled: bool,
    overrides: BTreeMap<u32, bool>,
    decided: HashMap<u32, bool>,
    logged: BTreeSet<u32>,
    mode: DisablerMode,
    errno: Errno,
}

#[derive(Debug)]
struct Gate {
    policy: Mutex<Policy>,
    decisions: Mutex<CallbackChain<SyscallArgs>>,
    transcript: Mutex<Transcript>,
}

impl Gate {
    fn decide(&self, args: &SyscallArgs, cx: &mut Context<'_>) -> bool {
        let base = {
            let policy = self.policy.lock();
            if let Some(&decided) = policy.decided.get(&args.callno) {
                return decided;
            }
            policy
                .overrides
                .get(&args.callno)
                .copied()
                .unwrap_or(policy.default_enabled)
        };
        let enabled = if base {
            true
        } else {
            let chain = self.decisions.lock().snapshot();
            invoke(&chain, false, args, cx)
        };
        self.policy.lock().decided.insert(args.callno, enabled);
        enabled
    }

    fn report(&self, args: &SyscallArgs, cx: &Context<'_>, mode: DisablerMode) {
        if !self.policy.lock().logged.insert(args.callno) {
            return;
        }
        let name = cx
            .process()
            .syscall_table()
            .name(args.callno)
            .unwrap_or_else(|| "unknown".to_string());
        let verdict = match mode {
            DisablerMode::Permissive => "allowed",
            DisablerMode::Strict => "blocked",
        };
        let line = format!("syscall {} ({name}) is disabled; {verdict}", args.callno);
        log::warn!("{line}");
        self.transcript.lock().line(&line);
    }
}

impl Callback<SyscallArgs> for Gate {
    fn call(&self, enabled: bool, args: &SyscallArgs, cx: &mut Context<'_>) -> bool {
        if !enabled || self.decide(args, cx) {
            return enabled;
        }
        let (mode, errno) = {
            let policy = self.policy.lock();
            (policy.mode, policy.errno)
        };
        self.report(args, cx, mode);
        match mode {
            DisablerMode::Permissive => true,
            DisablerMode::Strict => {
                if let Some(thread) = cx.thread_mut() {
                    thread.set_syscall_return(errno_return(errno));
                }
                false
            }
        }
    }

    fn duplicate(self: Arc<Self>) -> Arc<dyn Callback<SyscallArgs>> {
        self
    }
}

/// Before-position syscall policy that blocks (or just reports) chosen
/// syscalls. Each number is decided once; later calls reuse the decision.
#[derive(Debug, Clone)]
pub struct SyscallDisabler {
    gate: Arc<Gate>,
}

impl SyscallDisabler {
    /// Disabler where every syscall starts enabled (`true`) or disabled.
    #[must_use]
    pub fn new(default_enabled: bool) -> Self {
        Self {
            gate: Arc::new(Gate {
                policy: Mutex::new(Policy {
                    default_enabled,
                    overrides: BTreeMap::new(),
                    decided: HashMap::new(),
                    logged: BTreeSet::new(),
                    mode: DisablerMode::Strict,
                    errno: Errno::ENOSYS,
                }),
                decisions: Mutex::new(CallbackChain::new()),
                transcript: Mutex::new(Transcript::stderr()),
            }),
        }
    }

    fn edit(&self, f: impl FnOnce(&mut Policy)) -> &Self {
        let mut policy = self.gate.policy.lock();
        f(&mut policy);
        policy.decided.clear();
        drop(policy);
        self
    }

    /// Disables `callno`.
    pub fn disable_syscall(&self, callno: u32) -> &Self {
        self.edit(|policy| {
            policy.overrides.insert(callno, false);
        })
    }

    /// Enables `callno`.
    pub fn enable_syscall(&self, callno: u32) -> &Self {
        self.edit(|policy| {
            policy.overrides.insert(callno, true);
        })
    }

    /// Selects what happens to disabled calls.
    pub fn mode(&self, mode: DisablerMode) -> &Self {
        self.edit(|policy| policy.mode = mode)
    }

    /// Errno returned by blocked calls.
    pub fn errno(&self, errno: Errno) -> &Self {
        self.edit(|policy| policy.errno = errno)
    }

    /// Prefix for report lines.
    pub fn prefix(&self, prefix: &str) -> &Self {
        let mut transcript = self.gate.transcript.lock();
        *transcript = transcript.with_prefix(prefix);
        drop(transcript);
        self
    }

    /// Sends report lines to `transcript`, keeping the current prefix.
    pub fn transcript(&self, transcript: &Transcript) -> &Self {
        let mut current = self.gate.transcript.lock();
        *current = transcript.with_prefix(current.prefix());
        drop(current);
        self
    }

    /// Chain consulted, seeded `false`, the first time a disabled number is
    /// called; a `true` result enables that number.
    pub fn decisions(&self) -> MutexGuard<'_, CallbackChain<SyscallArgs>> {
        self.gate.decisions.lock()
    }

    fn callback(&self) -> Arc<dyn Callback<SyscallArgs>> {
        Arc::clone(&self.gate) as Arc<dyn Callback<SyscallArgs>>
    }
}

impl Adapter for SyscallDisabler {
    fn attach(&self, target: &mut dyn AdapterTarget) {
        let callback = self.callback();
        target.each_callbacks(&mut |callbacks| {
            callbacks.add_syscall_callback(When::Before, Arc::clone(&callback));
        });
    }

    fn detach(&self, target: &mut dyn AdapterTarget) {
        let id = CallbackId::of_arc(&self.callback());
        target.each_callbacks(&mut |callbacks| {
            callbacks.remove::<SyscallArgs>(When::Before, id);
        });
    }
}
