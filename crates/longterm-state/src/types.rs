//! Domain types for the longterm state store.
//!
//! These types represent the persisted state of tasks, experiments, and
//! machines. All types are serializable to/from JSON for storage in redb
//! tables.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

pub use longterm_core::{TagSet, Target};

/// Unique, never reused identifier of a task.
pub type TaskId = u64;

/// Unix timestamp in seconds.
pub type Timestamp = u64;

// ── Task ──────────────────────────────────────────────────────────

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, eligible once its clock is reached.
    Pending,
    /// Explicitly enabled for its clock.
    Scheduled,
    /// Held back until someone schedules it again.
    Unscheduled,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Completed and failed tasks never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Whether a machine may be handed to a task in this status.
    pub fn is_startable(self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Scheduled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Unscheduled => "unscheduled",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether finishing a task spawns another occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recurrence {
    Single,
    Recurrent,
}

/// One scheduled or executed analysis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: TaskId,
    pub target: Target,
    pub status: TaskStatus,
    /// Analysis duration bound in seconds. Enforced by the analysis runner.
    pub timeout: u64,
    pub repeat: Recurrence,
    /// Offset to the next occurrence in seconds. Always set when recurrent.
    pub delta: Option<u64>,
    pub tags: TagSet,
    /// Free-form options handed through to the analysis.
    pub options: String,
    /// Name of the owning experiment.
    pub experiment: String,
    /// Eggname of the machine running this task.
    pub machine: Option<String>,
    pub added_on: Timestamp,
    /// Earliest time the task may run.
    pub clock: Timestamp,
    pub started_on: Option<Timestamp>,
    pub completed_on: Option<Timestamp>,
}

impl Task {
    pub fn is_recurrent(&self) -> bool {
        self.repeat == Recurrence::Recurrent
    }

    /// Eligible to be handed a machine at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.status.is_startable() && self.clock <= now
    }
}

// ── Experiment ────────────────────────────────────────────────────

/// A named sequence of recurring tasks sharing target and cadence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    pub name: String,
    pub recurrence: Recurrence,
    /// Default offset between occurrences in seconds.
    pub delta: u64,
    /// Default analysis duration in seconds.
    pub timeout: u64,
    pub tags: TagSet,
    pub created_at: Timestamp,
}

// ── Machine ───────────────────────────────────────────────────────

/// A virtual-machine slot in the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Machine {
    /// Eggname, unique across the fleet.
    pub name: String,
    /// Host-only address, unique across the fleet.
    pub ip: Ipv4Addr,
    pub tags: TagSet,
    pub locked: bool,
    /// Experiment currently holding the machine.
    pub locked_by: Option<String>,
    /// Unix timestamp of the last lock flip.
    pub locked_changed_on: Option<Timestamp>,
}

impl Machine {
    /// A free machine with the given identity.
    pub fn new(name: impl Into<String>, ip: Ipv4Addr, tags: TagSet) -> Self {
        Self {
            name: name.into(),
            ip,
            tags,
            locked: false,
            locked_by: None,
            locked_changed_on: None,
        }
    }

    /// Whether the machine carries every tag in `filter`.
    pub fn has_tags(&self, filter: &TagSet) -> bool {
        filter.is_subset(&self.tags)
    }

    /// Free and carrying every tag in `filter`.
    pub fn is_available(&self, filter: &TagSet) -> bool {
        !self.locked && self.has_tags(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use longterm_core::parse_tags;

    #[test]
    fn status_classes() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Pending.is_startable());
        assert!(TaskStatus::Scheduled.is_startable());
        assert!(!TaskStatus::Unscheduled.is_startable());
        assert_eq!(TaskStatus::Unscheduled.to_string(), "unscheduled");
    }

    #[test]
    fn machine_tag_filter() {
        let mut machine = Machine::new(
            "egg01",
            Ipv4Addr::new(192, 168, 56, 3),
            parse_tags("longterm,win7"),
        );
        assert!(machine.is_available(&TagSet::new()));
        assert!(machine.is_available(&parse_tags("longterm")));
        assert!(!machine.is_available(&parse_tags("longterm,x64")));

        machine.locked = true;
        assert!(!machine.is_available(&TagSet::new()));
        assert!(machine.has_tags(&parse_tags("win7")));
    }

    #[test]
    fn task_status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Unscheduled).unwrap();
        assert_eq!(json, "\"unscheduled\"");
    }
}
