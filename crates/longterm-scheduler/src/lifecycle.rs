//! ExperimentScheduler: the task/experiment state machine.
//!
//! Each public operation is a single write transaction against the state
//! store: it reads what it needs, applies one transition, and commits. A
//! failed operation leaves no partial changes behind.

use serde::Serialize;
use tracing::{debug, info, warn};

use longterm_core::{LONGTERM_TAG, TagSet, Target};
use longterm_state::*;

use crate::error::{SchedulerError, SchedulerResult};
use crate::locks::{first_available, held_by, lock_in, unlock_in};
use crate::{Clock, system_clock};

/// Parameters of a new experiment and its first task.
#[derive(Debug, Clone, PartialEq)]
pub struct NewExperiment {
    pub name: String,
    pub target: Target,
    /// Analysis duration in seconds.
    pub timeout: u64,
    /// Offset between occurrences in seconds.
    pub delta: u64,
    pub tags: TagSet,
    pub options: String,
    pub recurrence: Recurrence,
}

/// Desired schedule flag for a not-yet-running task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Scheduled,
    Unscheduled,
}

impl ScheduleState {
    fn status(self) -> TaskStatus {
        match self {
            ScheduleState::Scheduled => TaskStatus::Scheduled,
            ScheduleState::Unscheduled => TaskStatus::Unscheduled,
        }
    }
}

/// How a running task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

/// What `terminate` did besides deleting the task.
#[derive(Debug, Clone, PartialEq)]
pub struct Termination {
    pub task: Task,
    /// Machine released because no task of the experiment is running.
    pub released: Option<String>,
    /// Running tasks demoted to single-shot; they release the machine when
    /// they finish.
    pub demoted: Vec<TaskId>,
    pub experiment_deleted: bool,
}

/// What `remove` did besides deleting the task.
#[derive(Debug, Clone, PartialEq)]
pub struct Removal {
    pub task: Task,
    pub experiment_deleted: bool,
}

/// One line of the experiment listing.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentSummary {
    pub name: String,
    pub task_count: usize,
    pub delta: u64,
    pub timeout: u64,
    pub last_task: Option<TaskId>,
    pub last_status: Option<TaskStatus>,
    pub machine: Option<String>,
}

/// Drives experiments and their tasks through the lifecycle.
#[derive(Clone)]
pub struct ExperimentScheduler {
    state: StateStore,
    clock: Clock,
}

impl ExperimentScheduler {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            clock: system_clock(),
        }
    }

    /// Replace the clock used for task timestamps.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> Timestamp {
        (self.clock)()
    }

    fn write<T>(&self, f: impl FnOnce(&StoreTxn) -> SchedulerResult<T>) -> SchedulerResult<T> {
        self.state.write(f)
    }

    // ── Experiments ────────────────────────────────────────────────

    /// Create an experiment and its first task. Returns the task id.
    ///
    /// Recurring experiments get the longterm tag so they only ever land on
    /// machines provisioned for longterm use.
    pub fn create(&self, new: NewExperiment) -> SchedulerResult<TaskId> {
        let name = new.name.trim().to_string();
        if name.is_empty() {
            return Err(SchedulerError::InvalidArgument(
                "experiment name must not be empty".into(),
            ));
        }
        if new.recurrence == Recurrence::Recurrent && new.delta == 0 {
            return Err(SchedulerError::InvalidArgument(
                "a recurring experiment needs a non-zero delta".into(),
            ));
        }

        let mut tags = new.tags;
        if new.recurrence == Recurrence::Recurrent {
            tags.insert(LONGTERM_TAG.to_string());
        }

        let now = self.now();
        let task = self.write(|txn| {
            if txn.get_experiment(&name)?.is_some() {
                return Err(SchedulerError::DuplicateExperimentName(name.clone()));
            }

            txn.put_experiment(&Experiment {
                name: name.clone(),
                recurrence: new.recurrence,
                delta: new.delta,
                timeout: new.timeout,
                tags: tags.clone(),
                created_at: now,
            })?;

            let task = Task {
                id: txn.allocate_task_id()?,
                target: new.target,
                status: TaskStatus::Pending,
                timeout: new.timeout,
                repeat: new.recurrence,
                delta: (new.recurrence == Recurrence::Recurrent).then_some(new.delta),
                tags,
                options: new.options,
                experiment: name.clone(),
                machine: None,
                added_on: now,
                clock: now,
                started_on: None,
                completed_on: None,
            };
            txn.put_task(&task)?;
            Ok(task)
        })?;

        info!(experiment = %name, task_id = task.id, "experiment created");
        Ok(task.id)
    }

    /// Append the next occurrence of an experiment, `delta` seconds after
    /// its last task, with the given timeout.
    pub fn schedule_next(&self, name: &str, delta: u64, timeout: u64) -> SchedulerResult<Task> {
        let now = self.now();
        let task = self.write(|txn| {
            if txn.get_experiment(name)?.is_none() {
                return Err(SchedulerError::ExperimentNotFound(name.to_string()));
            }
            let last = txn
                .last_task_for_experiment(name)?
                .ok_or_else(|| SchedulerError::NoTasksForExperiment(name.to_string()))?;

            let task = Task {
                id: txn.allocate_task_id()?,
                status: TaskStatus::Pending,
                timeout,
                delta: last.is_recurrent().then_some(delta),
                machine: None,
                added_on: now,
                clock: last.clock.saturating_add(delta),
                started_on: None,
                completed_on: None,
                ..last
            };
            txn.put_task(&task)?;
            Ok(task)
        })?;

        info!(experiment = %name, task_id = task.id, clock = task.clock, "next occurrence scheduled");
        Ok(task)
    }

    /// Look up an experiment by name.
    pub fn experiment(&self, name: &str) -> SchedulerResult<Experiment> {
        self.state
            .get_experiment(name)?
            .ok_or_else(|| SchedulerError::ExperimentNotFound(name.to_string()))
    }

    /// Summaries of every experiment, in name order.
    pub fn list(&self) -> SchedulerResult<Vec<ExperimentSummary>> {
        let experiments = self.state.list_experiments()?;
        let tasks = self.state.list_tasks()?;
        let machines = self.state.list_machines()?;

        Ok(experiments
            .into_iter()
            .map(|exp| {
                let owned: Vec<&Task> = tasks.iter().filter(|t| t.experiment == exp.name).collect();
                let last = owned.last();
                ExperimentSummary {
                    task_count: owned.len(),
                    delta: exp.delta,
                    timeout: exp.timeout,
                    last_task: last.map(|t| t.id),
                    last_status: last.map(|t| t.status),
                    machine: machines
                        .iter()
                        .find(|m| m.locked && m.locked_by.as_deref() == Some(exp.name.as_str()))
                        .map(|m| m.name.clone()),
                    name: exp.name,
                }
            })
            .collect())
    }

    /// Tasks of an experiment in id order.
    pub fn tasks(&self, name: &str) -> SchedulerResult<Vec<Task>> {
        self.experiment(name)?;
        Ok(self.state.list_tasks_for_experiment(name)?)
    }

    /// Set the default delta of an experiment. The experiment's last task
    /// picks it up too if it has not started yet.
    pub fn update_delta(&self, name: &str, delta: u64) -> SchedulerResult<Experiment> {
        if delta == 0 {
            return Err(SchedulerError::InvalidArgument(
                "delta must be non-zero".into(),
            ));
        }
        self.update_experiment(name, |exp, upcoming| {
            exp.delta = delta;
            if let Some(task) = upcoming
                && task.is_recurrent()
            {
                task.delta = Some(delta);
            }
        })
    }

    /// Set the default timeout of an experiment. The experiment's last task
    /// picks it up too if it has not started yet.
    pub fn update_timeout(&self, name: &str, timeout: u64) -> SchedulerResult<Experiment> {
        self.update_experiment(name, |exp, upcoming| {
            exp.timeout = timeout;
            if let Some(task) = upcoming {
                task.timeout = timeout;
            }
        })
    }

    fn update_experiment(
        &self,
        name: &str,
        apply: impl FnOnce(&mut Experiment, Option<&mut Task>),
    ) -> SchedulerResult<Experiment> {
        let experiment = self.write(|txn| {
            let mut exp = txn
                .get_experiment(name)?
                .ok_or_else(|| SchedulerError::ExperimentNotFound(name.to_string()))?;
            let mut upcoming = txn
                .last_task_for_experiment(name)?
                .filter(|t| t.started_on.is_none() && !t.status.is_terminal());

            apply(&mut exp, upcoming.as_mut());

            txn.put_experiment(&exp)?;
            if let Some(task) = &upcoming {
                txn.put_task(task)?;
            }
            Ok(exp)
        })?;
        info!(
            experiment = %name,
            delta = experiment.delta,
            timeout = experiment.timeout,
            "experiment updated"
        );
        Ok(experiment)
    }

    // ── Task transitions ───────────────────────────────────────────

    /// Flip a task between scheduled and unscheduled.
    ///
    /// Only tasks that have not started move; anything else is left alone
    /// and `false` is returned.
    pub fn set_schedule(&self, id: TaskId, desired: ScheduleState) -> SchedulerResult<bool> {
        let target = desired.status();
        self.write(|txn| {
            let mut task = txn.get_task(id)?.ok_or(SchedulerError::TaskNotFound(id))?;

            let movable = matches!(
                task.status,
                TaskStatus::Pending | TaskStatus::Scheduled | TaskStatus::Unscheduled
            );
            if !movable || task.status == target {
                debug!(task_id = id, status = %task.status, desired = %target, "schedule flag unchanged");
                return Ok(false);
            }

            task.status = target;
            txn.put_task(&task)?;
            info!(task_id = id, status = %target, "task schedule changed");
            Ok(true)
        })
    }

    /// Make a task eligible to run right away.
    ///
    /// Unscheduled tasks are scheduled again. A running task already is
    /// running, so it is left alone and `true` is returned. Finished tasks
    /// return `false`.
    pub fn start(&self, id: TaskId) -> SchedulerResult<bool> {
        let now = self.now();
        self.write(|txn| {
            let mut task = txn.get_task(id)?.ok_or(SchedulerError::TaskNotFound(id))?;

            if task.status.is_terminal() {
                warn!(task_id = id, status = %task.status, "task cannot be started");
                return Ok(false);
            }
            if task.status == TaskStatus::Running {
                debug!(task_id = id, "task already running");
                return Ok(true);
            }

            task.clock = now;
            if task.status == TaskStatus::Unscheduled {
                task.status = TaskStatus::Scheduled;
            }
            txn.put_task(&task)?;
            info!(task_id = id, "task moved to now");
            Ok(true)
        })
    }

    /// Tasks eligible to run at `now`, earliest first.
    pub fn due(&self, now: Timestamp) -> SchedulerResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .state
            .list_tasks()?
            .into_iter()
            .filter(|t| t.is_due(now))
            .collect();
        tasks.sort_by_key(|t| (t.clock, t.id));
        Ok(tasks)
    }

    /// Hand a machine to a task and mark it running.
    ///
    /// The experiment keeps using the machine it already holds; otherwise
    /// the first free machine carrying all of the task's tags is locked.
    pub fn begin(&self, id: TaskId) -> SchedulerResult<Task> {
        let now = self.now();
        let task = self.write(|txn| {
            let mut task = txn.get_task(id)?.ok_or(SchedulerError::TaskNotFound(id))?;
            if !task.status.is_startable() {
                return Err(SchedulerError::InvalidState {
                    task: id,
                    status: task.status,
                    action: "begin",
                });
            }

            // One analysis per machine: the held machine is busy while any
            // other task of the experiment runs on it.
            if let Some(busy) = txn
                .tasks_for_experiment(&task.experiment)?
                .into_iter()
                .find(|t| t.id != id && t.status == TaskStatus::Running)
            {
                return Err(SchedulerError::MachineUnavailable(format!(
                    "{} is still running task {} of {}",
                    busy.machine.as_deref().unwrap_or("machine"),
                    busy.id,
                    task.experiment
                )));
            }

            let machine = match held_by(txn, &task.experiment)? {
                Some(machine) => machine,
                None => {
                    let free = first_available(txn, &task.tags)?.ok_or_else(|| {
                        SchedulerError::MachineUnavailable(format!(
                            "no free machine tagged {:?}",
                            task.tags
                        ))
                    })?;
                    lock_in(txn, &free.name, &task.experiment, now)?
                }
            };

            task.status = TaskStatus::Running;
            task.machine = Some(machine.name);
            task.started_on = Some(now);
            txn.put_task(&task)?;
            Ok(task)
        })?;

        info!(
            task_id = id,
            experiment = %task.experiment,
            machine = task.machine.as_deref().unwrap_or_default(),
            "task running"
        );
        Ok(task)
    }

    /// Record the end of a running task.
    ///
    /// A recurrent task spawns its successor (scheduled one delta after the
    /// finished task's clock) and the experiment keeps its machine. A
    /// single-shot task gives the machine back. Returns the successor.
    pub fn finish(&self, id: TaskId, outcome: Outcome) -> SchedulerResult<Option<Task>> {
        let now = self.now();
        let successor = self.write(|txn| {
            let mut task = txn.get_task(id)?.ok_or(SchedulerError::TaskNotFound(id))?;
            if task.status != TaskStatus::Running {
                return Err(SchedulerError::InvalidState {
                    task: id,
                    status: task.status,
                    action: "finish",
                });
            }

            task.status = match outcome {
                Outcome::Completed => TaskStatus::Completed,
                Outcome::Failed => TaskStatus::Failed,
            };
            task.completed_on = Some(now);
            txn.put_task(&task)?;

            if !task.is_recurrent() {
                unlock_in(txn, &task.experiment, now)?;
                return Ok(None);
            }

            let experiment = txn.get_experiment(&task.experiment)?;
            let delta = experiment
                .as_ref()
                .map(|e| e.delta)
                .or(task.delta)
                .unwrap_or_default();
            let timeout = experiment.as_ref().map_or(task.timeout, |e| e.timeout);

            let next = Task {
                id: txn.allocate_task_id()?,
                status: TaskStatus::Scheduled,
                timeout,
                delta: Some(delta),
                machine: None,
                added_on: now,
                clock: task.clock.saturating_add(delta),
                started_on: None,
                completed_on: None,
                ..task.clone()
            };
            txn.put_task(&next)?;
            Ok(Some(next))
        })?;

        match &successor {
            Some(next) => info!(task_id = id, next_id = next.id, clock = next.clock, "task finished, successor scheduled"),
            None => info!(task_id = id, "task finished"),
        }
        Ok(successor)
    }

    /// Cancel a task: delete it and settle the experiment's machine.
    ///
    /// For a task that got past `pending`, a still-running sibling is
    /// demoted to single-shot so it frees the machine when done; without
    /// one the machine is released now. An experiment left without tasks
    /// is deleted.
    pub fn terminate(&self, id: TaskId) -> SchedulerResult<Termination> {
        let now = self.now();
        let termination = self.write(|txn| {
            let task = txn.get_task(id)?.ok_or(SchedulerError::TaskNotFound(id))?;
            txn.delete_task(id)?;

            let mut released = None;
            let mut demoted = Vec::new();
            if task.status != TaskStatus::Pending {
                let running: Vec<Task> = txn
                    .tasks_for_experiment(&task.experiment)?
                    .into_iter()
                    .filter(|t| t.status == TaskStatus::Running)
                    .collect();

                if running.is_empty() {
                    released = unlock_in(txn, &task.experiment, now)?.map(|m| m.name);
                } else {
                    for mut other in running {
                        if other.is_recurrent() {
                            other.repeat = Recurrence::Single;
                            txn.put_task(&other)?;
                        }
                        demoted.push(other.id);
                    }
                }
            }

            let experiment_deleted = drop_if_empty(txn, &task.experiment, now)?;
            Ok(Termination {
                task,
                released,
                demoted,
                experiment_deleted,
            })
        })?;

        info!(
            task_id = id,
            released = ?termination.released,
            demoted = ?termination.demoted,
            experiment_deleted = termination.experiment_deleted,
            "task terminated"
        );
        Ok(termination)
    }

    /// Delete the record of a task that is not running.
    pub fn remove(&self, id: TaskId) -> SchedulerResult<Removal> {
        let now = self.now();
        let removal = self.write(|txn| {
            let task = txn.get_task(id)?.ok_or(SchedulerError::TaskNotFound(id))?;
            if task.status == TaskStatus::Running {
                return Err(SchedulerError::InvalidState {
                    task: id,
                    status: task.status,
                    action: "remove",
                });
            }
            txn.delete_task(id)?;
            let experiment_deleted = drop_if_empty(txn, &task.experiment, now)?;
            Ok(Removal {
                task,
                experiment_deleted,
            })
        })?;

        info!(task_id = id, experiment_deleted = removal.experiment_deleted, "task removed");
        Ok(removal)
    }
}

/// Delete an experiment with no tasks left, releasing any machine it still
/// holds. Returns whether the experiment was deleted.
fn drop_if_empty(txn: &StoreTxn, experiment: &str, now: Timestamp) -> SchedulerResult<bool> {
    if !txn.tasks_for_experiment(experiment)?.is_empty() {
        return Ok(false);
    }
    unlock_in(txn, experiment, now)?;
    let deleted = txn.delete_experiment(experiment)?;
    if deleted {
        info!(%experiment, "experiment has no tasks left, deleted");
    }
    Ok(deleted)
}
