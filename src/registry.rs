use std::collections::HashMap;

use parking_lot::{Mutex, MutexGuard};

use crate::types::{ThreadHandle, ThreadIdentity};

/// Identity of managed threads, filled in from the runtime's thread lifecycle notifications.
///
/// The notifications for one thread may arrive in any order, so every setter creates the entry
/// if it is missing. The lock is only ever taken by notification handlers and the sampler, never
/// by application code, which is what makes it safe to hold while the runtime is suspended.
#[derive(Default)]
pub struct ThreadRegistry {
    threads: Mutex<HashMap<ThreadHandle, ThreadIdentity>>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliberately does nothing; the other notifications fill the entry in.
    pub fn on_created(&self, _thread: ThreadHandle) {}

    pub fn on_assigned_to_os_thread(&self, thread: ThreadHandle, native_id: u32) {
        let mut threads = self.threads.lock();
        threads.entry(thread).or_default().native_id = native_id;
    }

    pub fn on_name_changed(&self, thread: ThreadHandle, name: &str) {
        let mut threads = self.threads.lock();
        let identity = threads.entry(thread).or_default();
        identity.name.clear();
        identity.name.push_str(name);
    }

    pub fn on_destroyed(&self, thread: ThreadHandle) {
        self.threads.lock().remove(&thread);
    }

    /// Copy of one thread's identity.
    pub fn lookup(&self, thread: ThreadHandle) -> Option<ThreadIdentity> {
        self.threads.lock().get(&thread).cloned()
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    /// Locks the registry for a whole capture pass so every sample sees the same state.
    pub fn snapshot(&self) -> RegistrySnapshot<'_> {
        RegistrySnapshot {
            threads: self.threads.lock(),
        }
    }
}

pub struct RegistrySnapshot<'a> {
    threads: MutexGuard<'a, HashMap<ThreadHandle, ThreadIdentity>>,
}

impl<'a> RegistrySnapshot<'a> {
    pub fn lookup(&self, thread: ThreadHandle) -> Option<&ThreadIdentity> {
        self.threads.get(&thread)
    }
}
