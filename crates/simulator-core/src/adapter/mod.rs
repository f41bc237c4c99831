//! Adapters: reusable bundles of callbacks with their own policy state.
//!
//! An adapter attaches to a simulator (template for future processes), a
//! process (itself and its current threads) or a single thread, and detaches
//! by removing exactly the callback objects it registered.

mod disabler;
mod fileio;

pub use disabler::{DisablerMode, SyscallDisabler};
pub use fileio::{FileIoOp, FileIoRecord, TraceFileIo};

use crate::callbacks::Callbacks;
use crate::process::Process;
use crate::thread::Thread;

/// Something adapters can install callbacks on.
pub trait AdapterTarget {
    /// Primary callback set of the target.
    fn callbacks_mut(&mut self) -> &mut Callbacks;

    /// Visits every callback set an adapter should touch.
    fn each_callbacks(&mut self, visit: &mut dyn FnMut(&mut Callbacks)) {
        visit(self.callbacks_mut());
    }
}

impl AdapterTarget for Process {
    fn callbacks_mut(&mut self) -> &mut Callbacks {
        Self::callbacks_mut(self)
    }

    fn each_callbacks(&mut self, visit: &mut dyn FnMut(&mut Callbacks)) {
        visit(Self::callbacks_mut(self));
        for thread in self.threads_mut() {
            visit(thread.callbacks_mut());
        }
    }
}

impl AdapterTarget for Thread {
    fn callbacks_mut(&mut self) -> &mut Callbacks {
        Self::callbacks_mut(self)
    }
}

/// Installable bundle of callbacks.
pub trait Adapter {
    /// Registers the adapter's callbacks on `target`.
    fn attach(&self, target: &mut dyn AdapterTarget);

    /// Removes the callbacks registered by [`Adapter::attach`].
    fn detach(&self, target: &mut dyn AdapterTarget);
}
