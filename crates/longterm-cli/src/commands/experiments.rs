use longterm_core::{Target, format_duration, join_tags};
use longterm_scheduler::{
    ExperimentScheduler, ExperimentSummary, NewExperiment, ScheduleState,
};
use longterm_state::{Recurrence, Task, TaskId};

use super::Context;
use crate::command::{ListFormat, NewArgs};

fn scheduler(ctx: &Context) -> anyhow::Result<ExperimentScheduler> {
    Ok(ExperimentScheduler::new(ctx.open_store()?))
}

pub fn list(ctx: &Context, format: ListFormat) -> anyhow::Result<()> {
    let experiments = scheduler(ctx)?.list()?;
    match format {
        ListFormat::Json => println!("{}", serde_json::to_string_pretty(&experiments)?),
        ListFormat::Text => print!("{}", render_experiments(&experiments)),
    }
    Ok(())
}

pub fn new(ctx: &Context, args: NewArgs) -> anyhow::Result<()> {
    let name = args.name.clone();
    let task_id = scheduler(ctx)?.create(NewExperiment {
        name: args.name,
        target: Target::parse(&args.path),
        timeout: args.timeout,
        delta: args.delta,
        tags: args.tags,
        options: args.options,
        recurrence: Recurrence::Recurrent,
    })?;
    println!("Created experiment '{name}' with ID: {task_id}");
    Ok(())
}

pub fn schedule(ctx: &Context, name: &str, delta: u64, timeout: u64) -> anyhow::Result<()> {
    let task = scheduler(ctx)?.schedule_next(name, delta, timeout)?;
    println!("Scheduled experiment '{name}' with ID: {}", task.id);
    Ok(())
}

pub fn delta(ctx: &Context, name: &str, delta: Option<u64>) -> anyhow::Result<()> {
    let scheduler = scheduler(ctx)?;
    match delta {
        Some(delta) => {
            scheduler.update_delta(name, delta)?;
            println!("Updated delta of '{name}' to {}", format_duration(delta));
        }
        None => {
            let experiment = scheduler.experiment(name)?;
            println!("Delta of '{name}': {}", format_duration(experiment.delta));
        }
    }
    Ok(())
}

pub fn timeout(ctx: &Context, name: &str, timeout: Option<u64>) -> anyhow::Result<()> {
    let scheduler = scheduler(ctx)?;
    match timeout {
        Some(timeout) => {
            scheduler.update_timeout(name, timeout)?;
            println!("Updated timeout of '{name}' to {}", format_duration(timeout));
        }
        None => {
            let experiment = scheduler.experiment(name)?;
            println!("Timeout of '{name}': {}", format_duration(experiment.timeout));
        }
    }
    Ok(())
}

pub fn tasks(ctx: &Context, name: &str) -> anyhow::Result<()> {
    let tasks = scheduler(ctx)?.tasks(name)?;
    print!("{}", render_tasks(&tasks));
    Ok(())
}

pub fn start(ctx: &Context, task: TaskId) -> anyhow::Result<()> {
    if scheduler(ctx)?.start(task)? {
        println!("Task {task} will run as soon as possible");
    } else {
        println!("Task {task} is finished, left unchanged");
    }
    Ok(())
}

pub fn set_schedule(ctx: &Context, task: TaskId, scheduled: bool) -> anyhow::Result<()> {
    let desired = if scheduled {
        ScheduleState::Scheduled
    } else {
        ScheduleState::Unscheduled
    };
    if scheduler(ctx)?.set_schedule(task, desired)? {
        println!("Task {task} is now {}", if scheduled { "scheduled" } else { "unscheduled" });
    } else {
        println!("Task {task} left unchanged");
    }
    Ok(())
}

pub fn terminate(ctx: &Context, task: TaskId) -> anyhow::Result<()> {
    let outcome = scheduler(ctx)?.terminate(task)?;
    println!("Terminated task {task} of experiment '{}'", outcome.task.experiment);
    if let Some(machine) = &outcome.released {
        println!("Released machine {machine}");
    }
    for id in &outcome.demoted {
        println!("Running task {id} will not recur");
    }
    if outcome.experiment_deleted {
        println!("Removed experiment '{}'", outcome.task.experiment);
    }
    Ok(())
}

pub fn remove(ctx: &Context, task: TaskId) -> anyhow::Result<()> {
    let removal = scheduler(ctx)?.remove(task)?;
    println!("Removed task {task}");
    if removal.experiment_deleted {
        println!("Removed experiment '{}'", removal.task.experiment);
    }
    Ok(())
}

fn render_experiments(experiments: &[ExperimentSummary]) -> String {
    let mut out = format!(
        "{:>20} | {:>5} | {:>6} | {:>7} | {}\n",
        "Name", "Tasks", "Delta", "Timeout", "Machine"
    );
    for exp in experiments {
        out.push_str(&format!(
            "{:>20} | {:>5} | {:>6} | {:>7} | {}\n",
            exp.name,
            exp.task_count,
            format_duration(exp.delta),
            format_duration(exp.timeout),
            exp.machine.as_deref().unwrap_or("-"),
        ));
    }
    out
}

fn render_tasks(tasks: &[Task]) -> String {
    let mut out = format!(
        "{:>6} | {:<11} | {:>10} | {:>7} | {:<9} | {:<6} | {}\n",
        "ID", "Status", "Clock", "Timeout", "Repeat", "Machine", "Target"
    );
    for task in tasks {
        let repeat = match task.repeat {
            Recurrence::Single => "single",
            Recurrence::Recurrent => "recurrent",
        };
        out.push_str(&format!(
            "{:>6} | {:<11} | {:>10} | {:>7} | {:<9} | {:<6} | {} ({}) [{}]\n",
            task.id,
            task.status,
            task.clock,
            format_duration(task.timeout),
            repeat,
            task.machine.as_deref().unwrap_or("-"),
            task.target,
            task.target.category(),
            join_tags(&task.tags),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use longterm_core::{LongtermConfig, TagSet};
    use longterm_state::{StateStore, TaskStatus};

    fn context(dir: &tempfile::TempDir) -> Context {
        Context {
            config: LongtermConfig::default(),
            config_path: None,
            data_dir: dir.path().to_path_buf(),
        }
    }

    fn new_args(name: &str) -> NewArgs {
        NewArgs {
            name: name.to_string(),
            path: "/srv/samples/a.exe".to_string(),
            timeout: 86_400,
            delta: 86_400,
            tags: TagSet::new(),
            options: String::new(),
        }
    }

    fn store(ctx: &Context) -> StateStore {
        ctx.open_store().unwrap()
    }

    #[test]
    fn new_then_schedule_then_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);

        new(&ctx, new_args("E1")).unwrap();
        schedule(&ctx, "E1", 2 * 86_400, 3_600).unwrap();
        {
            let tasks = store(&ctx).list_tasks_for_experiment("E1").unwrap();
            assert_eq!(tasks.len(), 2);
            assert_eq!(tasks[1].clock, tasks[0].clock + 2 * 86_400);
            assert_eq!(tasks[1].timeout, 3_600);
            assert!(tasks[0].tags.contains("longterm"));
        }

        terminate(&ctx, 1).unwrap();
        terminate(&ctx, 2).unwrap();
        assert!(store(&ctx).get_experiment("E1").unwrap().is_none());
        assert!(terminate(&ctx, 2).is_err());
    }

    #[test]
    fn duplicate_experiment_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        new(&ctx, new_args("E1")).unwrap();
        let err = new(&ctx, new_args("E1")).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn delta_and_timeout_updates() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        new(&ctx, new_args("E1")).unwrap();

        delta(&ctx, "E1", Some(3_600)).unwrap();
        timeout(&ctx, "E1", Some(600)).unwrap();
        delta(&ctx, "E1", None).unwrap();

        let experiment = store(&ctx).get_experiment("E1").unwrap().unwrap();
        assert_eq!(experiment.delta, 3_600);
        assert_eq!(experiment.timeout, 600);
        assert!(delta(&ctx, "missing", None).is_err());
    }

    #[test]
    fn schedule_flags() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        new(&ctx, new_args("E1")).unwrap();

        set_schedule(&ctx, 1, false).unwrap();
        assert_eq!(
            store(&ctx).get_task(1).unwrap().unwrap().status,
            TaskStatus::Unscheduled
        );
        start(&ctx, 1).unwrap();
        assert_eq!(
            store(&ctx).get_task(1).unwrap().unwrap().status,
            TaskStatus::Scheduled
        );
        remove(&ctx, 1).unwrap();
        assert!(store(&ctx).list_experiments().unwrap().is_empty());
    }

    #[test]
    fn experiment_table() {
        let summaries = vec![ExperimentSummary {
            name: "E1".to_string(),
            task_count: 2,
            delta: 86_400,
            timeout: 3_600,
            last_task: Some(2),
            last_status: Some(TaskStatus::Pending),
            machine: Some("egg01".to_string()),
        }];
        let table = render_experiments(&summaries);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("Name | Tasks"));
        assert!(lines[1].ends_with("E1 |     2 |     1d |      1h | egg01"));
    }
}
