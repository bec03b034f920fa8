pub mod experiments;
pub mod fleet;
pub mod machines;

use std::path::PathBuf;

use anyhow::Context as _;
use tracing::debug;

use longterm_core::LongtermConfig;
use longterm_state::StateStore;

use crate::command::{ACTIONS, Command, find_action};

/// What every handler gets: the validated config and where state lives.
pub struct Context {
    pub config: LongtermConfig,
    pub config_path: Option<PathBuf>,
    pub data_dir: PathBuf,
}

impl Context {
    pub fn open_store(&self) -> anyhow::Result<StateStore> {
        let path = self.config.store_path(&self.data_dir);
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let store = StateStore::open(&path)
            .with_context(|| format!("failed to open state store at {}", path.display()))?;
        debug!(path = %path.display(), "state store opened");
        Ok(store)
    }
}

pub async fn execute(ctx: &Context, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Help { action } => help(action.as_deref()),
        Command::List { format } => experiments::list(ctx, format),
        Command::New(args) => experiments::new(ctx, args),
        Command::Schedule {
            name,
            delta,
            timeout,
        } => experiments::schedule(ctx, &name, delta, timeout),
        Command::Delta { name, delta } => experiments::delta(ctx, &name, delta),
        Command::Timeout { name, timeout } => experiments::timeout(ctx, &name, timeout),
        Command::Tasks { name } => experiments::tasks(ctx, &name),
        Command::Start { task } => experiments::start(ctx, task),
        Command::ScheduleTask { task } => experiments::set_schedule(ctx, task, true),
        Command::UnscheduleTask { task } => experiments::set_schedule(ctx, task, false),
        Command::Terminate { task } => experiments::terminate(ctx, task),
        Command::Remove { task } => experiments::remove(ctx, task),
        Command::CountAvailableMachines { verbose, tags } => {
            machines::count_available(ctx, verbose, tags)
        }
        Command::AllocateIpaddr { verbose } => machines::allocate_ipaddr(ctx, verbose),
        Command::AllocateEggname { verbose } => machines::allocate_eggname(ctx, verbose),
        Command::AddMachine { name, ip, tags } => machines::add(ctx, &name, ip, tags),
        Command::Machines => machines::list(ctx),
        Command::MachineCronjob(action) => fleet::cronjob(ctx, action),
        Command::Provision { floor } => fleet::provision(ctx, floor).await,
        Command::Watch { floor, interval } => fleet::watch(ctx, floor, interval).await,
    }
}

fn help(action: Option<&str>) -> anyhow::Result<()> {
    match action {
        Some(name) => {
            let spec = find_action(name).ok_or_else(|| anyhow::anyhow!("Unknown action: {name}"))?;
            print!("{}", spec.help());
        }
        None => {
            println!("Usage: experiment <action> [arguments] [key=value ...]\n");
            for spec in ACTIONS {
                println!("  {:<48} {}", spec.signature(), spec.summary);
            }
        }
    }
    Ok(())
}
