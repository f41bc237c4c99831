use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::callbacks::{Callback, CallbackChain, CallbackId, SyscallArgs};

#[derive(Debug)]
struct Entry {
    name: String,
    body: CallbackChain<SyscallArgs>,
}

/// Syscall number to (name, body chain). Shared by every process created by
/// one simulator; the lock is held only while looking up or editing an entry,
/// never while a body runs.
#[derive(Debug, Default)]
pub struct SyscallTable {
    entries: Mutex<BTreeMap<u32, Entry>>,
}

impl SyscallTable {
    /// Table without any syscall.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines (or redefines) `number` with a single body.
    pub fn define(&self, number: u32, name: &str, body: Arc<dyn Callback<SyscallArgs>>) {
        let mut chain = CallbackChain::new();
        chain.append(body);
        let previous = self.entries.lock().insert(
            number,
            Entry {
                name: name.to_string(),
                body: chain,
            },
        );
        if previous.is_some() {
            log::debug!("syscall {number} redefined as {name}");
        }
    }

    fn with_entry<R>(&self, number: u32, f: impl FnOnce(&mut Entry) -> R) -> Option<R> {
        self.entries.lock().get_mut(&number).map(f)
    }

    /// Replaces every body of `number`; false if it is not defined.
    pub fn replace_body(&self, number: u32, body: Arc<dyn Callback<SyscallArgs>>) -> bool {
        self.with_entry(number, |entry| {
            entry.body.clear().append(body);
        })
        .is_some()
    }

    /// Runs `body` after the existing bodies of `number`.
    pub fn append_body(&self, number: u32, body: Arc<dyn Callback<SyscallArgs>>) -> bool {
        self.with_entry(number, |entry| {
            entry.body.append(body);
        })
        .is_some()
    }

    /// Runs `body` ahead of the existing bodies of `number`.
    pub fn prepend_body(&self, number: u32, body: Arc<dyn Callback<SyscallArgs>>) -> bool {
        self.with_entry(number, |entry| {
            entry.body.prepend(body);
        })
        .is_some()
    }

    /// Drops every body of `number`, which then fails with `ENOSYS`.
    pub fn clear_body(&self, number: u32) -> bool {
        self.with_entry(number, |entry| {
            entry.body.clear();
        })
        .is_some()
    }

    /// Removes one body object from `number`.
    pub fn remove_body(&self, number: u32, id: CallbackId) -> bool {
        self.with_entry(number, |entry| entry.body.remove(id))
            .unwrap_or(false)
    }

    /// Name of `number`.
    #[must_use]
    pub fn name(&self, number: u32) -> Option<String> {
        self.entries
            .lock()
            .get(&number)
            .map(|entry| entry.name.clone())
    }

    /// Whether `number` has an entry.
    #[must_use]
    pub fn is_defined(&self, number: u32) -> bool {
        self.entries.lock().contains_key(&number)
    }

    /// Defined numbers in ascending order.
    #[must_use]
    pub fn numbers(&self) -> Vec<u32> {
        self.entries.lock().keys().copied().collect()
    }

    pub(crate) fn snapshot(&self, number: u32) -> Option<Vec<Arc<dyn Callback<SyscallArgs>>>> {
        self.entries
            .lock()
            .get(&number)
            .map(|entry| entry.body.snapshot())
    }
}
