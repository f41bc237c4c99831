//! Callback framework: ordered before/after chains around emulated events.
//!
//! A [`Callback`] receives the running "enabled" accumulator, the event
//! arguments and a [`Context`] over the owning process, and returns the next
//! accumulator. A chain's result is the left fold of its callbacks in
//! registration order over the seed. Before-chains gate the default action;
//! after-chains see whether the default action ran.
//!
//! Chains are snapshotted before invocation, so callbacks may freely add or
//! remove callbacks (themselves included) while the chain is running.

mod args;
mod registry;

use std::fmt;
use std::sync::Arc;

pub use args::{
    InsnArgs, ProcessArgs, ProcessReason, SignalArgs, SignalReason, SyscallArgs, ThreadArgs,
    ThreadReason,
};
pub use registry::{Callbacks, ChainPair, EventArgs};

use crate::process::Process;
use crate::thread::{Thread, Tid};

/// Observer or policy object invoked around one kind of event.
pub trait Callback<A>: Send + Sync {
    /// Consumes the prior accumulator and returns the next one.
    fn call(&self, enabled: bool, args: &A, cx: &mut Context<'_>) -> bool;

    /// Copy attached to another target. Stateless callbacks return
    /// themselves; stateful ones return a fresh object.
    fn duplicate(self: Arc<Self>) -> Arc<dyn Callback<A>>;
}

/// Position of a chain relative to the default action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum When {
    /// Runs first; a `false` result suppresses the default action.
    Before,
    /// Runs afterwards with the before-chain result as seed.
    After,
}

/// Identity of a registered callback object, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(usize);

impl CallbackId {
    /// Identity of the object behind a reference (typically `self` inside `call`).
    #[must_use]
    pub fn of<T: ?Sized>(object: &T) -> Self {
        Self(std::ptr::from_ref(object).cast::<()>() as usize)
    }

    /// Identity of a registered callback.
    #[must_use]
    pub fn of_arc<A>(callback: &Arc<dyn Callback<A>>) -> Self {
        Self::of(&**callback)
    }
}

/// Ordered callbacks for one event category and position.
pub struct CallbackChain<A> {
    entries: Vec<Arc<dyn Callback<A>>>,
}

impl<A> Default for CallbackChain<A> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<A> Clone for CallbackChain<A> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<A> fmt::Debug for CallbackChain<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackChain")
            .field("len", &self.entries.len())
            .finish()
    }
}

impl<A> CallbackChain<A> {
    /// Creates an empty chain.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Number of callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds a callback at the end.
    pub fn append(&mut self, callback: Arc<dyn Callback<A>>) -> &mut Self {
        self.entries.push(callback);
        self
    }

    /// Adds a callback at the front.
    pub fn prepend(&mut self, callback: Arc<dyn Callback<A>>) -> &mut Self {
        self.entries.insert(0, callback);
        self
    }

    /// Removes the last registration of the given object.
    pub fn remove(&mut self, id: CallbackId) -> bool {
        match self
            .entries
            .iter()
            .rposition(|entry| CallbackId::of(&**entry) == id)
        {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Whether the given object is registered.
    #[must_use]
    pub fn contains(&self, id: CallbackId) -> bool {
        self.entries
            .iter()
            .any(|entry| CallbackId::of(&**entry) == id)
    }

    /// Removes every callback.
    pub fn clear(&mut self) -> &mut Self {
        self.entries.clear();
        self
    }

    /// Callbacks in registration order, detached from the chain.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn Callback<A>>> {
        self.entries.clone()
    }

    /// Copy for another target, duplicating every callback.
    #[must_use]
    pub fn duplicate(&self) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|entry| Arc::clone(entry).duplicate())
                .collect(),
        }
    }
}

/// Folds `callbacks` left to right over `seed`.
pub fn invoke<A>(
    callbacks: &[Arc<dyn Callback<A>>],
    seed: bool,
    args: &A,
    cx: &mut Context<'_>,
) -> bool {
    callbacks
        .iter()
        .fold(seed, |enabled, callback| callback.call(enabled, args, cx))
}

/// Stateless callback wrapping a closure.
pub struct FnCallback<F>(F);

impl<A, F> Callback<A> for FnCallback<F>
where
    A: 'static,
    F: Fn(bool, &A, &mut Context<'_>) -> bool + Send + Sync + 'static,
{
    fn call(&self, enabled: bool, args: &A, cx: &mut Context<'_>) -> bool {
        (self.0)(enabled, args, cx)
    }

    fn duplicate(self: Arc<Self>) -> Arc<dyn Callback<A>> {
        self
    }
}

/// Wraps a closure as a stateless callback.
pub fn from_fn<A, F>(f: F) -> Arc<dyn Callback<A>>
where
    A: 'static,
    F: Fn(bool, &A, &mut Context<'_>) -> bool + Send + Sync + 'static,
{
    Arc::new(FnCallback(f))
}

/// What a callback can reach: the owning process and, for thread-scoped
/// events, the current thread.
pub struct Context<'a> {
    process: &'a mut Process,
    tid: Option<Tid>,
}

impl<'a> Context<'a> {
    /// Builds a context for `tid` (or for the process as a whole).
    pub fn new(process: &'a mut Process, tid: Option<Tid>) -> Self {
        Self { process, tid }
    }

    /// Current thread id, if the event is thread scoped.
    #[must_use]
    pub const fn tid(&self) -> Option<Tid> {
        self.tid
    }

    /// Owning process.
    #[must_use]
    pub fn process(&self) -> &Process {
        &*self.process
    }

    /// Owning process, mutably.
    pub fn process_mut(&mut self) -> &mut Process {
        &mut *self.process
    }

    /// Current thread.
    #[must_use]
    pub fn thread(&self) -> Option<&Thread> {
        self.tid.and_then(|tid| self.process.thread(tid))
    }

    /// Current thread, mutably.
    pub fn thread_mut(&mut self) -> Option<&mut Thread> {
        let tid = self.tid?;
        self.process.thread_mut(tid)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;
    use proptest::prelude::*;

    use super::{from_fn, invoke, Callback, CallbackChain, CallbackId, Context};
    use crate::api::{SimulatorConfig, TraceOutput};
    use crate::loader::StaticImageLoader;
    use crate::simulator::Simulator;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Pass,
        Veto,
        Force,
        Flip,
    }

    impl Step {
        const fn apply(self, enabled: bool) -> bool {
            match self {
                Self::Pass => enabled,
                Self::Veto => false,
                Self::Force => true,
                Self::Flip => !enabled,
            }
        }
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Pass),
            Just(Step::Veto),
            Just(Step::Force),
            Just(Step::Flip)
        ]
    }

    fn with_context<R>(f: impl FnOnce(&mut Context<'_>) -> R) -> R {
        let config = SimulatorConfig {
            stack_size: 0x1000,
            host_signals: Vec::new(),
            trace_output: TraceOutput::Memory,
            ..SimulatorConfig::default()
        };
        let loader = StaticImageLoader::code(0x0001_0000, vec![0; 8]);
        let mut sim = Simulator::with_loader(config, Box::new(loader)).expect("configuration");
        let process = sim.exec(&["guest".to_string()]).expect("exec");
        f(&mut Context::new(process, None))
    }

    struct Counter {
        calls: AtomicUsize,
    }

    impl Callback<u32> for Counter {
        fn call(&self, enabled: bool, _args: &u32, _cx: &mut Context<'_>) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            enabled
        }

        fn duplicate(self: Arc<Self>) -> Arc<dyn Callback<u32>> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[test]
    fn removal_is_by_identity() {
        let a = from_fn::<u32, _>(|enabled, _, _| enabled);
        let b = from_fn::<u32, _>(|_, _, _| false);
        let mut chain = CallbackChain::new();
        chain.append(Arc::clone(&a)).append(Arc::clone(&b));
        assert!(chain.remove(CallbackId::of_arc(&a)));
        assert!(!chain.remove(CallbackId::of_arc(&a)));
        assert!(chain.contains(CallbackId::of_arc(&b)));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn duplicate_shares_stateless_and_copies_stateful() {
        let stateless = from_fn::<u32, _>(|enabled, _, _| enabled);
        let stateful: Arc<dyn Callback<u32>> = Arc::new(Counter {
            calls: AtomicUsize::new(0),
        });
        let mut chain = CallbackChain::new();
        chain
            .append(Arc::clone(&stateless))
            .prepend(Arc::clone(&stateful));
        let copy = chain.duplicate();
        assert!(copy.contains(CallbackId::of_arc(&stateless)));
        assert!(!copy.contains(CallbackId::of_arc(&stateful)));
        assert_eq!(copy.len(), 2);
        assert!(chain.clear().is_empty());
    }

    proptest! {
        #[test]
        fn chain_result_is_the_left_fold_of_its_callbacks(
            seed in any::<bool>(),
            steps in proptest::collection::vec(step(), 0..8),
        ) {
            let calls = Arc::new(Mutex::new(Vec::new()));
            let mut chain = CallbackChain::new();
            for (index, step) in steps.iter().copied().enumerate() {
                let calls = Arc::clone(&calls);
                chain.append(from_fn::<u32, _>(move |enabled, _, _| {
                    calls.lock().push(index);
                    step.apply(enabled)
                }));
            }
            let expected = steps.iter().fold(seed, |enabled, step| step.apply(enabled));
            let result = with_context(|cx| invoke(&chain.snapshot(), seed, &0, cx));
            prop_assert_eq!(result, expected);
            prop_assert_eq!(calls.lock().clone(), (0..steps.len()).collect::<Vec<_>>());
        }
    }
}
