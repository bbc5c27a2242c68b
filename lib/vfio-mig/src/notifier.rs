// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Priority-ordered VM run-state change notification.
//!
//! Handlers are kept sorted by ascending priority (stable with respect to
//! registration order).  When the VM starts running they are invoked in that
//! order; when it stops they are invoked in reverse.  With the device tree
//! depth as priority, a controller is ready before the devices on its bus
//! start, and those devices quiesce before their controller stops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use strum::Display;

/// Run state of the VM, as reported alongside a change notification.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum RunState {
    Prelaunch,
    Running,
    Paused,
    Suspended,
    InMigrate,
    FinishMigrate,
    PostMigrate,
    SaveVm,
    RestoreVm,
    Shutdown,
    InternalError,
    IoError,
}

/// Callback invoked with `(running, state)` on a run-state change.
pub type VmStateCallback = Arc<dyn Fn(bool, RunState) + Send + Sync>;

/// Callbacks registered for one participant.
#[derive(Clone)]
pub struct VmStateHandler {
    forward: VmStateCallback,
    reverse: VmStateCallback,
    prepare: Option<VmStateCallback>,
}

impl VmStateHandler {
    /// Use the same callback for both directions.
    pub fn new(cb: impl Fn(bool, RunState) + Send + Sync + 'static) -> Self {
        let cb: VmStateCallback = Arc::new(cb);
        Self { forward: cb.clone(), reverse: cb, prepare: None }
    }

    /// Distinct callbacks for the VM starting (`forward`) and stopping
    /// (`reverse`).
    pub fn pair(
        forward: impl Fn(bool, RunState) + Send + Sync + 'static,
        reverse: impl Fn(bool, RunState) + Send + Sync + 'static,
    ) -> Self {
        Self {
            forward: Arc::new(forward),
            reverse: Arc::new(reverse),
            prepare: None,
        }
    }

    /// Add a callback to be run, for every handler, before any of the main
    /// callbacks of a notification.
    pub fn with_prepare(
        self,
        prepare: impl Fn(bool, RunState) + Send + Sync + 'static,
    ) -> Self {
        let prepare: VmStateCallback = Arc::new(prepare);
        Self { prepare: Some(prepare), ..self }
    }
}

/// Handle for a registered [`VmStateHandler`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VmStateEntryId(u64);

struct Entry {
    id: VmStateEntryId,
    priority: u32,
    handler: VmStateHandler,
    live: Arc<AtomicBool>,
}

struct Inner {
    entries: Vec<Entry>,
    next_id: u64,
}

/// Registry of run-state change handlers.
///
/// Notifications are expected to be delivered serially; handlers may
/// unregister entries (including their own) from within a notification.
pub struct VmStateNotifier {
    inner: Mutex<Inner>,
}

impl Default for VmStateNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl VmStateNotifier {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner { entries: Vec::new(), next_id: 0 }) }
    }

    /// Register `handler` at `priority`.
    pub fn register(
        &self,
        priority: u32,
        handler: VmStateHandler,
    ) -> VmStateEntryId {
        let mut inner = self.inner.lock().unwrap();
        let id = VmStateEntryId(inner.next_id);
        inner.next_id += 1;

        // After any existing entries of equal priority
        let pos = inner
            .entries
            .iter()
            .position(|e| e.priority > priority)
            .unwrap_or(inner.entries.len());
        let live = Arc::new(AtomicBool::new(true));
        inner.entries.insert(pos, Entry { id, priority, handler, live });
        id
    }

    /// Remove a handler.  Returns `false` if it was not registered.
    ///
    /// A handler removed during a notification is not invoked for the rest of
    /// that notification.
    pub fn unregister(&self, id: VmStateEntryId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.iter().position(|e| e.id == id) {
            Some(pos) => {
                let entry = inner.entries.remove(pos);
                entry.live.store(false, Ordering::Release);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver a run-state change to every registered handler.
    ///
    /// On `running`, prepare callbacks and then forward callbacks are called
    /// in ascending priority.  Otherwise prepare callbacks and then reverse
    /// callbacks are called in descending priority.
    pub fn notify(&self, running: bool, state: RunState) {
        // Snapshot the ordering so that callbacks are free to (un)register.
        let mut snapshot: Vec<(Arc<AtomicBool>, VmStateHandler)> = {
            let inner = self.inner.lock().unwrap();
            inner
                .entries
                .iter()
                .map(|e| (e.live.clone(), e.handler.clone()))
                .collect()
        };
        if !running {
            snapshot.reverse();
        }

        for (live, handler) in snapshot.iter() {
            if let Some(prepare) = handler.prepare.as_ref() {
                if live.load(Ordering::Acquire) {
                    prepare(running, state);
                }
            }
        }
        for (live, handler) in snapshot.iter() {
            if !live.load(Ordering::Acquire) {
                continue;
            }
            if running {
                (handler.forward)(running, state);
            } else {
                (handler.reverse)(running, state);
            }
        }
    }
}
