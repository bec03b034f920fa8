//! Machine lock manager.
//!
//! A machine is either free or locked to exactly one experiment, and an
//! experiment holds at most one machine. Acquiring a taken machine is an
//! error; releasing is idempotent so that `terminate` may race with a
//! task completing normally.

use tracing::{debug, info};

use longterm_core::TagSet;
use longterm_state::{Machine, StateStore, StoreTxn, Timestamp};

use crate::error::{SchedulerError, SchedulerResult};
use crate::{Clock, system_clock};

/// Lock/unlock/count over the machine table.
#[derive(Clone)]
pub struct MachineLocks {
    state: StateStore,
    clock: Clock,
}

impl MachineLocks {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            clock: system_clock(),
        }
    }

    /// Replace the clock used for `locked_changed_on`.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Lock `machine` to `experiment`.
    pub fn lock(&self, machine: &str, experiment: &str) -> SchedulerResult<Machine> {
        let now = (self.clock)();
        self.state
            .write(|txn| lock_in(txn, machine, experiment, now))
    }

    /// Release whatever machine `experiment` holds. Returns the released
    /// machine, or `None` when nothing was locked to it.
    pub fn unlock_by_experiment(&self, experiment: &str) -> SchedulerResult<Option<Machine>> {
        let now = (self.clock)();
        self.state.write(|txn| unlock_in(txn, experiment, now))
    }

    /// Count free machines carrying every tag in `filter`. An empty filter
    /// counts every free machine.
    pub fn count_available(&self, filter: &TagSet) -> SchedulerResult<usize> {
        let machines = self.state.list_machines()?;
        Ok(machines.iter().filter(|m| m.is_available(filter)).count())
    }

    /// The machine currently locked to `experiment`, if any.
    pub fn machine_for_experiment(&self, experiment: &str) -> SchedulerResult<Option<Machine>> {
        let machines = self.state.list_machines()?;
        Ok(machines
            .into_iter()
            .find(|m| m.locked && m.locked_by.as_deref() == Some(experiment)))
    }

    /// Commit a freshly provisioned machine. This is the point where an
    /// allocated eggname and address become taken.
    pub fn register(&self, machine: Machine) -> SchedulerResult<()> {
        self.state.write(|txn| register_in(txn, &machine))?;
        info!(machine = %machine.name, ip = %machine.ip, "machine registered");
        Ok(())
    }
}

pub(crate) fn lock_in(
    txn: &StoreTxn,
    machine: &str,
    experiment: &str,
    now: Timestamp,
) -> SchedulerResult<Machine> {
    if let Some(held) = held_by(txn, experiment)? {
        return Err(SchedulerError::AlreadyHoldsMachine {
            experiment: experiment.to_string(),
            machine: held.name,
        });
    }

    let mut record = txn
        .get_machine(machine)?
        .ok_or_else(|| SchedulerError::MachineNotFound(machine.to_string()))?;
    if record.locked {
        return Err(SchedulerError::MachineUnavailable(format!(
            "{machine} is locked by {}",
            record.locked_by.as_deref().unwrap_or("unknown")
        )));
    }

    record.locked = true;
    record.locked_by = Some(experiment.to_string());
    record.locked_changed_on = Some(now);
    txn.put_machine(&record)?;
    info!(%machine, %experiment, "machine locked");
    Ok(record)
}

pub(crate) fn unlock_in(
    txn: &StoreTxn,
    experiment: &str,
    now: Timestamp,
) -> SchedulerResult<Option<Machine>> {
    let Some(mut record) = held_by(txn, experiment)? else {
        debug!(%experiment, "no machine locked to experiment");
        return Ok(None);
    };

    record.locked = false;
    record.locked_by = None;
    record.locked_changed_on = Some(now);
    txn.put_machine(&record)?;
    info!(machine = %record.name, %experiment, "machine unlocked");
    Ok(Some(record))
}

pub(crate) fn held_by(txn: &StoreTxn, experiment: &str) -> SchedulerResult<Option<Machine>> {
    Ok(txn
        .list_machines()?
        .into_iter()
        .find(|m| m.locked && m.locked_by.as_deref() == Some(experiment)))
}

/// First free machine carrying every tag in `filter`, in eggname order.
pub(crate) fn first_available(txn: &StoreTxn, filter: &TagSet) -> SchedulerResult<Option<Machine>> {
    Ok(txn
        .list_machines()?
        .into_iter()
        .find(|m| m.is_available(filter)))
}

fn register_in(txn: &StoreTxn, machine: &Machine) -> SchedulerResult<()> {
    if let Some(existing) = txn
        .list_machines()?
        .into_iter()
        .find(|m| m.name == machine.name || m.ip == machine.ip)
    {
        return Err(SchedulerError::DuplicateMachine {
            machine: format!("{} ({})", machine.name, machine.ip),
            existing: format!("{} ({})", existing.name, existing.ip),
        });
    }
    txn.put_machine(machine)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use longterm_core::parse_tags;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn test_locks() -> MachineLocks {
        let state = StateStore::open_in_memory().unwrap();
        MachineLocks::new(state).with_clock(Arc::new(|| 5_000u64))
    }

    fn machine(name: &str, host: u8, tags: &str) -> Machine {
        Machine::new(name, Ipv4Addr::new(192, 168, 56, host), parse_tags(tags))
    }

    fn snapshot(locks: &MachineLocks) -> Vec<Machine> {
        locks.state.list_machines().unwrap()
    }

    #[test]
    fn lock_marks_machine_taken() {
        let locks = test_locks();
        locks.register(machine("egg01", 3, "longterm")).unwrap();

        let locked = locks.lock("egg01", "E1").unwrap();
        assert!(locked.locked);
        assert_eq!(locked.locked_by.as_deref(), Some("E1"));
        assert_eq!(locked.locked_changed_on, Some(5_000));
        assert_eq!(
            locks.machine_for_experiment("E1").unwrap().unwrap().name,
            "egg01"
        );
    }

    #[test]
    fn locking_a_taken_machine_fails() {
        let locks = test_locks();
        locks.register(machine("egg01", 3, "longterm")).unwrap();
        locks.lock("egg01", "E1").unwrap();

        let err = locks.lock("egg01", "E2").unwrap_err();
        assert!(matches!(err, SchedulerError::MachineUnavailable(_)));
        assert!(locks.machine_for_experiment("E2").unwrap().is_none());
    }

    #[test]
    fn experiment_holds_at_most_one_machine() {
        let locks = test_locks();
        locks.register(machine("egg01", 3, "longterm")).unwrap();
        locks.register(machine("egg02", 4, "longterm")).unwrap();
        locks.lock("egg01", "E1").unwrap();

        let err = locks.lock("egg02", "E1").unwrap_err();
        assert!(matches!(err, SchedulerError::AlreadyHoldsMachine { .. }));
        assert_eq!(locks.count_available(&TagSet::new()).unwrap(), 1);
    }

    #[test]
    fn lock_unknown_machine_fails() {
        let locks = test_locks();
        assert!(matches!(
            locks.lock("egg99", "E1"),
            Err(SchedulerError::MachineNotFound(_))
        ));
    }

    #[test]
    fn unlock_is_idempotent() {
        let locks = test_locks();
        locks.register(machine("egg01", 3, "longterm")).unwrap();
        locks.register(machine("egg02", 4, "longterm")).unwrap();
        locks.lock("egg01", "E1").unwrap();
        locks.lock("egg02", "E2").unwrap();

        let released = locks.unlock_by_experiment("E1").unwrap();
        assert_eq!(released.unwrap().name, "egg01");
        let after_once = snapshot(&locks);

        assert!(locks.unlock_by_experiment("E1").unwrap().is_none());
        assert_eq!(snapshot(&locks), after_once);
        // E2 keeps its machine.
        assert!(locks.get_locked("egg02"));
    }

    #[test]
    fn unlock_without_any_lock_is_noop() {
        let locks = test_locks();
        locks.register(machine("egg01", 3, "longterm")).unwrap();
        assert!(locks.unlock_by_experiment("nobody").unwrap().is_none());
        assert_eq!(locks.count_available(&TagSet::new()).unwrap(), 1);
    }

    #[test]
    fn count_available_respects_tags() {
        let locks = test_locks();
        locks.register(machine("egg01", 3, "longterm")).unwrap();
        locks.register(machine("egg02", 4, "longterm,win7")).unwrap();
        locks.register(machine("egg03", 5, "adhoc")).unwrap();
        locks.lock("egg01", "E1").unwrap();

        assert_eq!(locks.count_available(&TagSet::new()).unwrap(), 2);
        assert_eq!(locks.count_available(&parse_tags("longterm")).unwrap(), 1);
        assert_eq!(locks.count_available(&parse_tags("win7,longterm")).unwrap(), 1);
        assert_eq!(locks.count_available(&parse_tags("x64")).unwrap(), 0);
    }

    #[test]
    fn register_rejects_duplicate_name_or_ip() {
        let locks = test_locks();
        locks.register(machine("egg01", 3, "longterm")).unwrap();

        assert!(matches!(
            locks.register(machine("egg01", 9, "longterm")),
            Err(SchedulerError::DuplicateMachine { .. })
        ));
        assert!(matches!(
            locks.register(machine("egg02", 3, "longterm")),
            Err(SchedulerError::DuplicateMachine { .. })
        ));
        assert_eq!(snapshot(&locks).len(), 1);
    }

    impl MachineLocks {
        fn get_locked(&self, name: &str) -> bool {
            self.state.get_machine(name).unwrap().unwrap().locked
        }
    }
}
