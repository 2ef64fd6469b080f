//! Task filtering for start hooks
//!
//! A filtered-out task never gets a pending record, so its completions miss
//! and cost nothing beyond the lookup.

use crate::clock::Task;
use regex::Regex;
use std::collections::HashSet;

/// Which tasks to trace
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Allowed pids (empty = all)
    pids: HashSet<u32>,
    /// Process name pattern (None = all)
    comm: Option<Regex>,
}

impl TaskFilter {
    /// Trace everything
    pub fn all() -> Self {
        Self::default()
    }

    /// Build from a pid allow-list and an optional comm regex
    pub fn new(pids: &[u32], comm_pattern: Option<&str>) -> Result<Self, regex::Error> {
        let comm = comm_pattern.map(Regex::new).transpose()?;
        Ok(Self {
            pids: pids.iter().copied().collect(),
            comm,
        })
    }

    pub fn should_trace(&self, task: &Task) -> bool {
        if !self.pids.is_empty() && !self.pids.contains(&task.pid) {
            return false;
        }
        match &self.comm {
            Some(re) => re.is_match(task.comm.as_str()),
            None => true,
        }
    }

    pub fn is_trace_all(&self) -> bool {
        self.pids.is_empty() && self.comm.is_none()
    }
}
