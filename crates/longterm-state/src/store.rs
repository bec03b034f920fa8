//! StateStore: redb-backed persistence for tasks, experiments, and machines.
//!
//! Single-record reads go through read transactions. Anything that mutates
//! state runs inside [`StateStore::write`], so a multi-record change such as
//! "delete task, release machine, drop the empty experiment" is committed
//! atomically or not at all. redb admits one write transaction at a time,
//! which also serializes concurrent scheduling of the same experiment.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, Key, ReadableDatabase, ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(map_err!(Serialize))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

// Table helpers shared by read and write transactions.

fn fetch_task(table: &impl ReadableTable<u64, &'static [u8]>, id: TaskId) -> StateResult<Option<Task>> {
    match table.get(id).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn fetch_named<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
) -> StateResult<Option<T>> {
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn scan<K: Key + 'static, T: DeserializeOwned>(
    table: &impl ReadableTable<K, &'static [u8]>,
) -> StateResult<Vec<T>> {
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        results.push(decode(value.value())?);
    }
    Ok(results)
}

fn scan_experiment_tasks(
    table: &impl ReadableTable<u64, &'static [u8]>,
    experiment: &str,
) -> StateResult<Vec<Task>> {
    let tasks: Vec<Task> = scan(table)?;
    Ok(tasks
        .into_iter()
        .filter(|t| t.experiment == experiment)
        .collect())
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(TASKS).map_err(map_err!(Table))?;
        txn.open_table(EXPERIMENTS).map_err(map_err!(Table))?;
        txn.open_table(MACHINES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Run `f` inside one write transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and is aborted
    /// otherwise, leaving the store untouched.
    pub fn write<T, E>(&self, f: impl FnOnce(&StoreTxn) -> Result<T, E>) -> Result<T, E>
    where
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let scope = StoreTxn { txn };
        match f(&scope) {
            Ok(value) => {
                scope.txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                if let Err(abort) = scope.txn.abort() {
                    warn!(error = %abort, "failed to abort write transaction");
                }
                Err(e)
            }
        }
    }

    // ── Tasks ──────────────────────────────────────────────────────

    /// Get a task by id.
    pub fn get_task(&self, id: TaskId) -> StateResult<Option<Task>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        fetch_task(&table, id)
    }

    /// List all tasks in id order.
    pub fn list_tasks(&self) -> StateResult<Vec<Task>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        scan(&table)
    }

    /// List the tasks of an experiment in id order.
    pub fn list_tasks_for_experiment(&self, experiment: &str) -> StateResult<Vec<Task>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(TASKS).map_err(map_err!(Table))?;
        scan_experiment_tasks(&table, experiment)
    }

    // ── Experiments ────────────────────────────────────────────────

    /// Get an experiment by name.
    pub fn get_experiment(&self, name: &str) -> StateResult<Option<Experiment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EXPERIMENTS).map_err(map_err!(Table))?;
        fetch_named(&table, name)
    }

    /// List all experiments in name order.
    pub fn list_experiments(&self) -> StateResult<Vec<Experiment>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(EXPERIMENTS).map_err(map_err!(Table))?;
        scan(&table)
    }

    // ── Machines ───────────────────────────────────────────────────

    /// Get a machine by eggname.
    pub fn get_machine(&self, name: &str) -> StateResult<Option<Machine>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MACHINES).map_err(map_err!(Table))?;
        fetch_named(&table, name)
    }

    /// List all machines in eggname order.
    pub fn list_machines(&self) -> StateResult<Vec<Machine>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(MACHINES).map_err(map_err!(Table))?;
        scan(&table)
    }
}

/// Typed access to the tables inside one write transaction.
///
/// Obtained through [`StateStore::write`]; every change made through it
/// becomes visible together on commit.
pub struct StoreTxn {
    txn: WriteTransaction,
}

impl StoreTxn {
    // ── Tasks ──────────────────────────────────────────────────────

    /// Take the next task id from the sequence. Ids start at 1.
    pub fn allocate_task_id(&self) -> StateResult<TaskId> {
        let mut table = self.txn.open_table(META).map_err(map_err!(Table))?;
        let current = table
            .get(NEXT_TASK_ID)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(1);
        table
            .insert(NEXT_TASK_ID, current + 1)
            .map_err(map_err!(Write))?;
        Ok(current)
    }

    pub fn get_task(&self, id: TaskId) -> StateResult<Option<Task>> {
        let table = self.txn.open_table(TASKS).map_err(map_err!(Table))?;
        fetch_task(&table, id)
    }

    /// Insert or update a task.
    pub fn put_task(&self, task: &Task) -> StateResult<()> {
        let value = encode(task)?;
        let mut table = self.txn.open_table(TASKS).map_err(map_err!(Table))?;
        table
            .insert(task.id, value.as_slice())
            .map_err(map_err!(Write))?;
        debug!(task_id = task.id, status = %task.status, "task stored");
        Ok(())
    }

    /// Delete a task by id. Returns true if it existed.
    pub fn delete_task(&self, id: TaskId) -> StateResult<bool> {
        let mut table = self.txn.open_table(TASKS).map_err(map_err!(Table))?;
        let existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        debug!(task_id = id, existed, "task deleted");
        Ok(existed)
    }

    /// List the tasks of an experiment in id order.
    pub fn tasks_for_experiment(&self, experiment: &str) -> StateResult<Vec<Task>> {
        let table = self.txn.open_table(TASKS).map_err(map_err!(Table))?;
        scan_experiment_tasks(&table, experiment)
    }

    /// The task with the highest id belonging to an experiment.
    pub fn last_task_for_experiment(&self, experiment: &str) -> StateResult<Option<Task>> {
        Ok(self.tasks_for_experiment(experiment)?.pop())
    }

    // ── Experiments ────────────────────────────────────────────────

    pub fn get_experiment(&self, name: &str) -> StateResult<Option<Experiment>> {
        let table = self.txn.open_table(EXPERIMENTS).map_err(map_err!(Table))?;
        fetch_named(&table, name)
    }

    /// Insert or update an experiment.
    pub fn put_experiment(&self, experiment: &Experiment) -> StateResult<()> {
        let value = encode(experiment)?;
        let mut table = self.txn.open_table(EXPERIMENTS).map_err(map_err!(Table))?;
        table
            .insert(experiment.name.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        debug!(experiment = %experiment.name, "experiment stored");
        Ok(())
    }

    /// Delete an experiment by name. Returns true if it existed.
    pub fn delete_experiment(&self, name: &str) -> StateResult<bool> {
        let mut table = self.txn.open_table(EXPERIMENTS).map_err(map_err!(Table))?;
        let existed = table.remove(name).map_err(map_err!(Write))?.is_some();
        debug!(experiment = %name, existed, "experiment deleted");
        Ok(existed)
    }

    // ── Machines ───────────────────────────────────────────────────

    pub fn get_machine(&self, name: &str) -> StateResult<Option<Machine>> {
        let table = self.txn.open_table(MACHINES).map_err(map_err!(Table))?;
        fetch_named(&table, name)
    }

    /// Insert or update a machine.
    pub fn put_machine(&self, machine: &Machine) -> StateResult<()> {
        let value = encode(machine)?;
        let mut table = self.txn.open_table(MACHINES).map_err(map_err!(Table))?;
        table
            .insert(machine.name.as_str(), value.as_slice())
            .map_err(map_err!(Write))?;
        debug!(machine = %machine.name, locked = machine.locked, "machine stored");
        Ok(())
    }

    pub fn list_machines(&self) -> StateResult<Vec<Machine>> {
        let table = self.txn.open_table(MACHINES).map_err(map_err!(Table))?;
        scan(&table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use longterm_core::parse_tags;
    use std::net::Ipv4Addr;

    fn test_task(id: TaskId, experiment: &str) -> Task {
        Task {
            id,
            target: Target::File {
                path: "/srv/samples/a.exe".to_string(),
            },
            status: TaskStatus::Pending,
            timeout: 86_400,
            repeat: Recurrence::Recurrent,
            delta: Some(86_400),
            tags: parse_tags("longterm"),
            options: String::new(),
            experiment: experiment.to_string(),
            machine: None,
            added_on: 1000,
            clock: 1000,
            started_on: None,
            completed_on: None,
        }
    }

    fn test_experiment(name: &str) -> Experiment {
        Experiment {
            name: name.to_string(),
            recurrence: Recurrence::Recurrent,
            delta: 86_400,
            timeout: 86_400,
            tags: parse_tags("longterm"),
            created_at: 1000,
        }
    }

    fn test_machine(name: &str, host: u8) -> Machine {
        Machine::new(name, Ipv4Addr::new(192, 168, 56, host), parse_tags("longterm"))
    }

    // ── Task CRUD ──────────────────────────────────────────────────

    #[test]
    fn task_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let task = test_task(1, "E1");

        store.write(|txn| txn.put_task(&task)).unwrap();

        assert_eq!(store.get_task(1).unwrap(), Some(task));
        assert!(store.get_task(2).unwrap().is_none());
    }

    #[test]
    fn task_ids_are_sequential_and_never_reused() {
        let store = StateStore::open_in_memory().unwrap();

        let first = store.write(|txn| txn.allocate_task_id()).unwrap();
        let second = store.write(|txn| txn.allocate_task_id()).unwrap();
        assert_eq!((first, second), (1, 2));

        store
            .write(|txn| {
                txn.put_task(&test_task(second, "E1"))?;
                txn.delete_task(second)
            })
            .unwrap();

        let third = store.write(|txn| txn.allocate_task_id()).unwrap();
        assert_eq!(third, 3);
    }

    #[test]
    fn tasks_for_experiment_in_id_order() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write(|txn| {
                txn.put_task(&test_task(3, "E1"))?;
                txn.put_task(&test_task(1, "E1"))?;
                txn.put_task(&test_task(2, "E2"))?;
                txn.put_task(&test_task(10, "E1"))
            })
            .unwrap();

        let ids: Vec<TaskId> = store
            .list_tasks_for_experiment("E1")
            .unwrap()
            .iter()
            .map(|t| t.id)
            .collect();
        assert_eq!(ids, vec![1, 3, 10]);

        let last = store
            .write(|txn| txn.last_task_for_experiment("E1"))
            .unwrap()
            .unwrap();
        assert_eq!(last.id, 10);

        let none = store.write(|txn| txn.last_task_for_experiment("nope")).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn task_delete() {
        let store = StateStore::open_in_memory().unwrap();
        store.write(|txn| txn.put_task(&test_task(1, "E1"))).unwrap();

        assert!(store.write(|txn| txn.delete_task(1)).unwrap());
        assert!(!store.write(|txn| txn.delete_task(1)).unwrap());
        assert!(store.list_tasks().unwrap().is_empty());
    }

    // ── Experiment CRUD ────────────────────────────────────────────

    #[test]
    fn experiment_put_get_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let experiment = test_experiment("E1");

        store.write(|txn| txn.put_experiment(&experiment)).unwrap();
        assert_eq!(store.get_experiment("E1").unwrap(), Some(experiment));
        assert_eq!(store.list_experiments().unwrap().len(), 1);

        assert!(store.write(|txn| txn.delete_experiment("E1")).unwrap());
        assert!(!store.write(|txn| txn.delete_experiment("E1")).unwrap());
        assert!(store.get_experiment("E1").unwrap().is_none());
    }

    // ── Machine CRUD ───────────────────────────────────────────────

    #[test]
    fn machine_put_and_list() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .write(|txn| {
                txn.put_machine(&test_machine("egg02", 4))?;
                txn.put_machine(&test_machine("egg01", 3))
            })
            .unwrap();

        let names: Vec<String> = store
            .list_machines()
            .unwrap()
            .into_iter()
            .map(|m| m.name)
            .collect();
        assert_eq!(names, vec!["egg01", "egg02"]);
        assert_eq!(
            store.get_machine("egg02").unwrap().unwrap().ip,
            Ipv4Addr::new(192, 168, 56, 4)
        );
    }

    // ── Transactions ───────────────────────────────────────────────

    #[test]
    fn failed_closure_rolls_back_every_write() {
        let store = StateStore::open_in_memory().unwrap();

        let result: StateResult<()> = store.write(|txn| {
            txn.put_experiment(&test_experiment("E1"))?;
            txn.put_task(&test_task(1, "E1"))?;
            Err(StateError::Write("simulated failure".to_string()))
        });

        assert!(result.is_err());
        assert!(store.get_experiment("E1").unwrap().is_none());
        assert!(store.get_task(1).unwrap().is_none());
    }

    #[test]
    fn writes_are_visible_inside_the_same_transaction() {
        let store = StateStore::open_in_memory().unwrap();
        let seen = store
            .write(|txn| {
                txn.put_machine(&test_machine("egg01", 3))?;
                Ok::<_, StateError>(txn.list_machines()?.len())
            })
            .unwrap();
        assert_eq!(seen, 1);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store
                .write(|txn| {
                    let id = txn.allocate_task_id()?;
                    txn.put_experiment(&test_experiment("E1"))?;
                    txn.put_task(&test_task(id, "E1"))
                })
                .unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_experiment("E1").unwrap().is_some());
        assert_eq!(store.get_task(1).unwrap().unwrap().experiment, "E1");
        let next = store.write(|txn| txn.allocate_task_id()).unwrap();
        assert_eq!(next, 2);
    }

    // ── Edge cases ─────────────────────────────────────────────────

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_tasks().unwrap().is_empty());
        assert!(store.list_experiments().unwrap().is_empty());
        assert!(store.list_machines().unwrap().is_empty());
        assert!(store.list_tasks_for_experiment("any").unwrap().is_empty());
        assert!(store.get_machine("egg01").unwrap().is_none());
    }
}
