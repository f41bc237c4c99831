//! Host signal interception while the simulator is active.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{const_mutex, Mutex};
use signal_hook::SigId;

use crate::signal::Signal;

/// Per-signal switch for the default action, shared by every guard in the
/// host process. The default action runs while no guard holds the signal.
#[derive(Debug)]
struct DefaultSwitch {
    enabled: Arc<AtomicBool>,
    holders: usize,
}

static DEFAULT_SWITCHES: Mutex<BTreeMap<i32, DefaultSwitch>> = const_mutex(BTreeMap::new());

/// Suppresses the host default action of `signal` until [`release_default`].
fn hold_default(signal: Signal) -> io::Result<()> {
    let mut switches = DEFAULT_SWITCHES.lock();
    match switches.entry(signal.as_raw()) {
        Entry::Occupied(mut entry) => {
            let switch = entry.get_mut();
            switch.holders += 1;
            switch.enabled.store(false, Ordering::Release);
        }
        Entry::Vacant(entry) => {
            let enabled = Arc::new(AtomicBool::new(false));
            signal_hook::flag::register_conditional_default(
                signal.as_raw(),
                Arc::clone(&enabled),
            )?;
            entry.insert(DefaultSwitch {
                enabled,
                holders: 1,
            });
        }
    }
    Ok(())
}

fn release_default(signal: Signal) {
    let mut switches = DEFAULT_SWITCHES.lock();
    if let Some(switch) = switches.get_mut(&signal.as_raw()) {
        switch.holders = switch.holders.saturating_sub(1);
        if switch.holders == 0 {
            switch.enabled.store(true, Ordering::Release);
        }
    }
}

#[derive(Debug)]
struct Watched {
    signal: Signal,
    raised: Arc<AtomicBool>,
    id: SigId,
}

/// Scoped registration of host signal handlers. Each handler only raises a
/// flag; [`ActivationGuard::take_pending`] turns raised flags into guest
/// signals. Dropping the guard unregisters every handler and gives the
/// signals their default host action back. Handlers other code installed
/// before activation stay chained throughout.
#[derive(Debug)]
pub struct ActivationGuard {
    watched: Vec<Watched>,
}

impl ActivationGuard {
    /// Registers a flag handler for each of `signals`.
    ///
    /// # Errors
    ///
    /// Fails if any handler cannot be installed; handlers installed so far
    /// are removed again.
    pub fn install(signals: &[Signal]) -> io::Result<Self> {
        let mut guard = Self {
            watched: Vec::with_capacity(signals.len()),
        };
        for &signal in signals {
            let raised = Arc::new(AtomicBool::new(false));
            hold_default(signal)?;
            let id = match signal_hook::flag::register(signal.as_raw(), Arc::clone(&raised)) {
                Ok(id) => id,
                Err(err) => {
                    release_default(signal);
                    return Err(err);
                }
            };
            log::debug!("intercepting host {signal}");
            guard.watched.push(Watched { signal, raised, id });
        }
        Ok(guard)
    }

    /// Intercepted signals, in registration order.
    #[must_use]
    pub fn signals(&self) -> Vec<Signal> {
        self.watched.iter().map(|watched| watched.signal).collect()
    }

    /// Signals raised since the last call, clearing their flags.
    #[must_use]
    pub fn take_pending(&self) -> Vec<Signal> {
        self.watched
            .iter()
            .filter(|watched| watched.raised.swap(false, Ordering::AcqRel))
            .map(|watched| watched.signal)
            .collect()
    }
}

impl Drop for ActivationGuard {
    fn drop(&mut self) {
        for watched in self.watched.drain(..).rev() {
            if !signal_hook::low_level::unregister(watched.id) {
                log::warn!("host {} handler was already gone", watched.signal);
            }
            release_default(watched.signal);
        }
    }
}
