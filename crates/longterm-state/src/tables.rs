//! redb table definitions for the longterm state store.
//!
//! Record tables hold JSON-serialized domain types in `&[u8]` values.

use redb::TableDefinition;

/// Tasks keyed by their numeric id.
pub const TASKS: TableDefinition<u64, &[u8]> = TableDefinition::new("tasks");

/// Experiments keyed by their unique name.
pub const EXPERIMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("experiments");

/// Machines keyed by their unique eggname.
pub const MACHINES: TableDefinition<&str, &[u8]> = TableDefinition::new("machines");

/// Counters (`next_task_id`).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key of the task id sequence in [`META`].
pub const NEXT_TASK_ID: &str = "next_task_id";
