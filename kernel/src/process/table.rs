//! Global process table: every live [`Process`], keyed by pid.

extern crate alloc;

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::process::pcb::{Process, ProcessId};

pub struct ProcessTable {
    entries: Mutex<BTreeMap<ProcessId, Process>>,
}

impl ProcessTable {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn insert(&self, process: Process) -> KernelResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&process.pid) {
            return Err(KernelError::AlreadyExists {
                resource: "process",
                id: process.pid.0,
            });
        }
        entries.insert(process.pid, process);
        Ok(())
    }

    pub fn remove(&self, pid: ProcessId) -> KernelResult<Process> {
        self.entries.lock().remove(&pid).ok_or(KernelError::NotFound {
            resource: "process",
            id: pid.0,
        })
    }

    pub fn with<R>(&self, pid: ProcessId, f: impl FnOnce(&Process) -> R) -> KernelResult<R> {
        let entries = self.entries.lock();
        let process = entries.get(&pid).ok_or(KernelError::NotFound {
            resource: "process",
            id: pid.0,
        })?;
        Ok(f(process))
    }

    pub fn with_mut<R>(&self, pid: ProcessId, f: impl FnOnce(&mut Process) -> R) -> KernelResult<R> {
        let mut entries = self.entries.lock();
        let process = entries.get_mut(&pid).ok_or(KernelError::NotFound {
            resource: "process",
            id: pid.0,
        })?;
        Ok(f(process))
    }

    pub fn exists(&self, pid: ProcessId) -> bool {
        self.entries.lock().contains_key(&pid)
    }

    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

pub static PROCESS_TABLE: ProcessTable = ProcessTable::new();

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::task::Priority;
    use alloc::string::ToString;

    #[test]
    fn insert_then_remove_roundtrip() {
        let table = ProcessTable::new();
        let pid = ProcessId(1);
        let process = Process::new_kernel(pid, "test".to_string(), Priority::DEFAULT);
        table.insert(process).unwrap();
        assert!(table.exists(pid));
        table.remove(pid).unwrap();
        assert!(!table.exists(pid));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let table = ProcessTable::new();
        let pid = ProcessId(2);
        table
            .insert(Process::new_kernel(pid, "a".to_string(), Priority::DEFAULT))
            .unwrap();
        assert!(table
            .insert(Process::new_kernel(pid, "b".to_string(), Priority::DEFAULT))
            .is_err());
    }
}
