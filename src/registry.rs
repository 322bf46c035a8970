//! Service registry.
//!
//! The table of every activated service, indexed by name for administrative
//! lookup and by process id for reap-time lookup. Entries are never removed;
//! exited and failed services stay for diagnostics and respawn.
//!
//! Process ids are recycled by the OS, so each pid binding records the
//! instance generation it was made for. A reaped pid only maps back to a
//! service if that generation is still the service's current one.

use crate::service::{ServiceDefinition, ServiceInstance, ServiceStatus};
use crate::socket::BoundSocket;
use std::collections::HashMap;
use tracing::warn;

/// One activated service.
#[derive(Debug)]
pub struct ServiceEntry {
    /// Immutable definition
    pub definition: ServiceDefinition,
    /// Sockets kept for restarts
    pub sockets: Vec<BoundSocket>,
    /// Runtime state
    pub instance: ServiceInstance,
}

impl ServiceEntry {
    /// Create an inactive entry.
    pub fn new(definition: ServiceDefinition, sockets: Vec<BoundSocket>) -> Self {
        Self {
            definition,
            sockets,
            instance: ServiceInstance::new(),
        }
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Diagnostic snapshot.
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus::from_service(&self.definition, &self.instance)
    }
}

#[derive(Debug, Clone, Copy)]
struct PidBinding {
    slot: usize,
    generation: u64,
}

/// Process-wide table of activated services.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<ServiceEntry>,
    by_name: HashMap<String, usize>,
    by_pid: HashMap<u32, PidBinding>,
    next_generation: u64,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry, returning its slot, or `None` if the name is taken.
    pub fn insert(&mut self, entry: ServiceEntry) -> Option<usize> {
        if self.by_name.contains_key(entry.name()) {
            return None;
        }
        let slot = self.entries.len();
        self.by_name.insert(entry.name().to_string(), slot);
        self.entries.push(entry);
        Some(slot)
    }

    /// Whether a service with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Slot of a service by name.
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Look up a service by name.
    pub fn get(&self, name: &str) -> Option<&ServiceEntry> {
        self.by_name.get(name).map(|&slot| &self.entries[slot])
    }

    /// Look up a service by name for mutation.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut ServiceEntry> {
        match self.by_name.get(name) {
            Some(&slot) => Some(&mut self.entries[slot]),
            None => None,
        }
    }

    /// Entry at a slot.
    pub fn entry(&self, slot: usize) -> &ServiceEntry {
        &self.entries[slot]
    }

    /// Entry at a slot, for mutation.
    pub fn entry_mut(&mut self, slot: usize) -> &mut ServiceEntry {
        &mut self.entries[slot]
    }

    /// Look up the live service owning `pid` without unbinding it.
    pub fn find_by_pid(&self, pid: u32) -> Option<&ServiceEntry> {
        let binding = self.by_pid.get(&pid)?;
        let entry = &self.entries[binding.slot];
        (self.is_current(binding, pid)).then_some(entry)
    }

    /// Record a freshly spawned process for the service at `slot`.
    ///
    /// Bumps the instance generation. A binding left over for the same pid
    /// is replaced.
    pub fn bind_pid(&mut self, slot: usize, pid: u32) -> u64 {
        self.next_generation += 1;
        let generation = self.next_generation;

        if let Some(stale) = self.by_pid.insert(pid, PidBinding { slot, generation }) {
            warn!(
                pid = pid,
                stale_service = %self.entries[stale.slot].name(),
                "Replacing stale process binding"
            );
        }

        let instance = &mut self.entries[slot].instance;
        instance.generation = generation;
        instance.pid = Some(pid);
        generation
    }

    /// Unbind a reaped pid, returning the slot of the service it belonged to.
    ///
    /// Returns `None` for pids that were never bound or whose binding no
    /// longer matches the service's current instance.
    pub fn take_pid(&mut self, pid: u32) -> Option<usize> {
        let binding = self.by_pid.remove(&pid)?;
        if self.is_current(&binding, pid) {
            self.entries[binding.slot].instance.pid = None;
            Some(binding.slot)
        } else {
            None
        }
    }

    fn is_current(&self, binding: &PidBinding, pid: u32) -> bool {
        let instance = &self.entries[binding.slot].instance;
        instance.generation == binding.generation && instance.pid == Some(pid)
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in activation order.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.entries.iter()
    }

    /// Status of every service in activation order.
    pub fn statuses(&self) -> Vec<ServiceStatus> {
        self.entries.iter().map(ServiceEntry::status).collect()
    }
}
