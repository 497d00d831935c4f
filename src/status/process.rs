//! Process-table probes.

use std::collections::HashSet;
use std::path::Path;

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// One row of the OS process table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub name: String,
}

/// Read access to the process table.
pub trait ProcessTable: Send + Sync {
    /// Every visible process with its executable name.
    fn list(&self) -> Vec<ProcessEntry>;

    /// Whether `pid` currently resolves to a live process.
    fn is_alive(&self, pid: u32) -> bool;
}

/// The live OS process table, read through `sysinfo`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessTable;

impl ProcessTable for SystemProcessTable {
    fn list(&self) -> Vec<ProcessEntry> {
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );
        sys.processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string_lossy().into_owned(),
            })
            .collect()
    }

    fn is_alive(&self, pid: u32) -> bool {
        let mut sys = System::new();
        let pid = Pid::from_u32(pid);
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::nothing(),
        );
        sys.process(pid).is_some()
    }
}

/// A fixed process table, for runs where the host's processes must not
/// influence the result.
#[derive(Debug, Default, Clone)]
pub struct StaticProcessTable {
    entries: Vec<ProcessEntry>,
    alive: HashSet<u32>,
}

impl StaticProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a named process; it also counts as alive.
    pub fn with_process(mut self, pid: u32, name: &str) -> Self {
        self.entries.push(ProcessEntry {
            pid,
            name: name.to_string(),
        });
        self.alive.insert(pid);
        self
    }
}

impl ProcessTable for StaticProcessTable {
    fn list(&self) -> Vec<ProcessEntry> {
        self.entries.clone()
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.contains(&pid)
    }
}

/// Whether the PID recorded in `path` belongs to a live process.
///
/// Missing files, garbage contents and stale PIDs all read as not running.
pub fn pid_file_alive(path: &Path, table: &dyn ProcessTable) -> bool {
    let Ok(content) = std::fs::read_to_string(path) else {
        return false;
    };
    match content.trim().parse::<u32>() {
        Ok(pid) => table.is_alive(pid),
        Err(_) => {
            tracing::debug!(path = %path.display(), "PID file does not hold a PID");
            false
        }
    }
}

/// Whether any process name ends with `suffix`.
pub fn any_name_ends_with(table: &dyn ProcessTable, suffix: &str) -> bool {
    table.list().iter().any(|p| p.name.ends_with(suffix))
}
