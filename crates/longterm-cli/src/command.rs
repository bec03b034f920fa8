//! Typed commands.
//!
//! Every action takes positional arguments first, then `key=value` pairs.
//! The text is mapped onto a [`Command`] variant here and validated once;
//! handlers only ever see typed values.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use thiserror::Error;

use longterm_core::{TagSet, parse_duration, parse_tags};
use longterm_state::TaskId;

/// Name, arguments, and help of one action.
#[derive(Debug)]
pub struct ActionSpec {
    pub name: &'static str,
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
    pub summary: &'static str,
    pub arguments: &'static [(&'static str, &'static str)],
}

impl ActionSpec {
    /// `new name path | timeout delta tags options`
    pub fn signature(&self) -> String {
        let mut parts = vec![self.name];
        parts.extend(self.required);
        if !self.optional.is_empty() {
            parts.push("|");
            parts.extend(self.optional);
        }
        parts.join(" ")
    }

    pub fn help(&self) -> String {
        let mut out = format!("{}\n\nUsage: experiment {}\n", self.summary, self.signature());
        if !self.arguments.is_empty() {
            out.push('\n');
        }
        for (name, text) in self.arguments {
            let marker = if self.optional.contains(name) { "Opt.  " } else { "      " };
            out.push_str(&format!("{marker}{name:<8} = {text}\n"));
        }
        out
    }

    fn params(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.required.iter().chain(self.optional).copied()
    }
}

pub const ACTIONS: &[ActionSpec] = &[
    ActionSpec {
        name: "help",
        required: &[],
        optional: &["action"],
        summary: "Show help on an action.",
        arguments: &[("action", "Action to get help on.")],
    },
    ActionSpec {
        name: "list",
        required: &[],
        optional: &["format"],
        summary: "List all experiments.",
        arguments: &[("format", "Output format: text or json.")],
    },
    ActionSpec {
        name: "new",
        required: &["name", "path"],
        optional: &["timeout", "delta", "tags", "options"],
        summary: "Create a new experiment.",
        arguments: &[
            ("name", "Experiment name."),
            ("path", "File path or URL to analyze."),
            ("timeout", "Duration of the analysis (default 1d)."),
            ("delta", "Relative time between the last and the next task (default 1d)."),
            ("tags", "Extra tags, comma separated."),
            ("options", "Extra analysis options."),
        ],
    },
    ActionSpec {
        name: "schedule",
        required: &["name"],
        optional: &["delta", "timeout"],
        summary: "Schedule the next analysis of an experiment.",
        arguments: &[
            ("name", "Experiment name."),
            ("delta", "Relative time after the last task (default 1d)."),
            ("timeout", "Duration of the analysis (default 1d)."),
        ],
    },
    ActionSpec {
        name: "delta",
        required: &["name"],
        optional: &["delta"],
        summary: "Get or set the delta between analyses of an experiment.",
        arguments: &[
            ("name", "Experiment name."),
            ("delta", "Updated relative time after the last task."),
        ],
    },
    ActionSpec {
        name: "timeout",
        required: &["name"],
        optional: &["timeout"],
        summary: "Get or set the analysis duration of an experiment.",
        arguments: &[
            ("name", "Experiment name."),
            ("timeout", "Updated duration of the analysis."),
        ],
    },
    ActionSpec {
        name: "tasks",
        required: &["name"],
        optional: &[],
        summary: "List the tasks of an experiment.",
        arguments: &[("name", "Experiment name.")],
    },
    ActionSpec {
        name: "start",
        required: &["task"],
        optional: &[],
        summary: "Make a task eligible to run right away.",
        arguments: &[("task", "Task id.")],
    },
    ActionSpec {
        name: "schedule-task",
        required: &["task"],
        optional: &[],
        summary: "Mark a pending or unscheduled task as scheduled.",
        arguments: &[("task", "Task id.")],
    },
    ActionSpec {
        name: "unschedule-task",
        required: &["task"],
        optional: &[],
        summary: "Hold back a pending or scheduled task.",
        arguments: &[("task", "Task id.")],
    },
    ActionSpec {
        name: "terminate",
        required: &["task"],
        optional: &[],
        summary: "Cancel a task and release its experiment's machine when idle.",
        arguments: &[("task", "Task id.")],
    },
    ActionSpec {
        name: "remove",
        required: &["task"],
        optional: &[],
        summary: "Delete a task that is not running.",
        arguments: &[("task", "Task id.")],
    },
    ActionSpec {
        name: "count-available-machines",
        required: &[],
        optional: &["verbose", "tags"],
        summary: "Count the available machines for longterm analysis.",
        arguments: &[
            ("verbose", "Verbose output."),
            (
                "tags",
                "Required machine tags. Defaults to the fleet tags, so only \
                 longterm machines are counted; pass tags= to count every free machine.",
            ),
        ],
    },
    ActionSpec {
        name: "machine-cronjob",
        required: &[],
        optional: &["action", "path"],
        summary: "Manage the cronjob that provisions machines for longterm analysis.",
        arguments: &[
            ("action", "dump or install (default dump)."),
            ("path", "Cronjob path in install mode."),
        ],
    },
    ActionSpec {
        name: "allocate-ipaddr",
        required: &[],
        optional: &["verbose"],
        summary: "Calculate the next available IP address. Nothing is reserved.",
        arguments: &[("verbose", "Verbose output.")],
    },
    ActionSpec {
        name: "allocate-eggname",
        required: &[],
        optional: &["verbose"],
        summary: "Calculate the next available egg name. Nothing is reserved.",
        arguments: &[("verbose", "Verbose output.")],
    },
    ActionSpec {
        name: "add-machine",
        required: &["name", "ip"],
        optional: &["tags"],
        summary: "Register a freshly cloned machine.",
        arguments: &[
            ("name", "Egg name."),
            ("ip", "Host-only IP address."),
            ("tags", "Machine tags (default: fleet tags)."),
        ],
    },
    ActionSpec {
        name: "machines",
        required: &[],
        optional: &[],
        summary: "List machines and their locks.",
        arguments: &[],
    },
    ActionSpec {
        name: "provision",
        required: &[],
        optional: &["floor"],
        summary: "Clone machines until the fleet floor is met.",
        arguments: &[("floor", "Minimum number of free machines (default from config).")],
    },
    ActionSpec {
        name: "watch",
        required: &[],
        optional: &["floor", "interval"],
        summary: "Keep provisioning every interval until interrupted.",
        arguments: &[
            ("floor", "Minimum number of free machines (default from config)."),
            ("interval", "Time between checks (default from config)."),
        ],
    },
];

/// Look up an action; dashes and underscores are interchangeable.
pub fn find_action(name: &str) -> Option<&'static ActionSpec> {
    let name = name.replace('_', "-");
    ACTIONS.iter().find(|a| a.name == name)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    #[error("Missing argument: {name}")]
    MissingArgument {
        action: &'static str,
        name: &'static str,
    },

    #[error("Invalid argument: {reason}")]
    InvalidArgument { action: &'static str, reason: String },

    #[error("Unknown action: {0}")]
    UnknownAction(String),
}

impl CliError {
    /// The action whose signature should accompany the error.
    pub fn action(&self) -> Option<&'static ActionSpec> {
        match self {
            CliError::MissingArgument { action, .. } | CliError::InvalidArgument { action, .. } => {
                find_action(action)
            }
            CliError::UnknownAction(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronjobAction {
    Dump,
    Install(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArgs {
    pub name: String,
    pub path: String,
    pub timeout: u64,
    pub delta: u64,
    pub tags: TagSet,
    pub options: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help { action: Option<String> },
    List { format: ListFormat },
    New(NewArgs),
    Schedule { name: String, delta: u64, timeout: u64 },
    Delta { name: String, delta: Option<u64> },
    Timeout { name: String, timeout: Option<u64> },
    Tasks { name: String },
    Start { task: TaskId },
    ScheduleTask { task: TaskId },
    UnscheduleTask { task: TaskId },
    Terminate { task: TaskId },
    Remove { task: TaskId },
    /// `tags: None` counts by the fleet tags.
    CountAvailableMachines { verbose: bool, tags: Option<TagSet> },
    MachineCronjob(CronjobAction),
    AllocateIpaddr { verbose: bool },
    AllocateEggname { verbose: bool },
    AddMachine { name: String, ip: Ipv4Addr, tags: Option<TagSet> },
    Machines,
    Provision { floor: Option<usize> },
    Watch { floor: Option<usize>, interval: Option<u64> },
}

/// One day, the default timeout and delta.
const DEFAULT_SECS: u64 = 86_400;

impl Command {
    /// Map an action and its raw arguments onto a command.
    pub fn parse(action: &str, raw: &[String]) -> Result<Self, CliError> {
        let spec = find_action(action).ok_or_else(|| CliError::UnknownAction(action.to_string()))?;
        let mut args = Args::bind(spec, raw)?;

        let command = match spec.name {
            "help" => Command::Help {
                action: args.optional("action"),
            },
            "list" => Command::List {
                format: match args.optional("format").as_deref() {
                    None | Some("text") => ListFormat::Text,
                    Some("json") => ListFormat::Json,
                    Some(other) => return Err(args.invalid(format!("unknown format '{other}'"))),
                },
            },
            "new" => Command::New(NewArgs {
                name: args.required("name")?,
                path: args.required("path")?,
                timeout: args.duration("timeout")?.unwrap_or(DEFAULT_SECS),
                delta: args.duration("delta")?.unwrap_or(DEFAULT_SECS),
                tags: args.optional("tags").map(|t| parse_tags(&t)).unwrap_or_default(),
                options: args.optional("options").unwrap_or_default(),
            }),
            "schedule" => Command::Schedule {
                name: args.required("name")?,
                delta: args.duration("delta")?.unwrap_or(DEFAULT_SECS),
                timeout: args.duration("timeout")?.unwrap_or(DEFAULT_SECS),
            },
            "delta" => Command::Delta {
                name: args.required("name")?,
                delta: args.duration("delta")?,
            },
            "timeout" => Command::Timeout {
                name: args.required("name")?,
                timeout: args.duration("timeout")?,
            },
            "tasks" => Command::Tasks {
                name: args.required("name")?,
            },
            "start" => Command::Start {
                task: args.task_id("task")?,
            },
            "schedule-task" => Command::ScheduleTask {
                task: args.task_id("task")?,
            },
            "unschedule-task" => Command::UnscheduleTask {
                task: args.task_id("task")?,
            },
            "terminate" => Command::Terminate {
                task: args.task_id("task")?,
            },
            "remove" => Command::Remove {
                task: args.task_id("task")?,
            },
            "count-available-machines" => Command::CountAvailableMachines {
                verbose: args.flag("verbose", true)?,
                tags: args.optional("tags").map(|t| parse_tags(&t)),
            },
            "machine-cronjob" => {
                let action = args.optional("action");
                match action.as_deref() {
                    None | Some("dump") => Command::MachineCronjob(CronjobAction::Dump),
                    Some("install") => match args.optional("path") {
                        Some(path) => Command::MachineCronjob(CronjobAction::Install(path.into())),
                        None => {
                            return Err(CliError::MissingArgument {
                                action: spec.name,
                                name: "path",
                            });
                        }
                    },
                    Some(other) => {
                        return Err(args.invalid(format!("unknown cronjob action '{other}'")));
                    }
                }
            }
            "allocate-ipaddr" => Command::AllocateIpaddr {
                verbose: args.flag("verbose", true)?,
            },
            "allocate-eggname" => Command::AllocateEggname {
                verbose: args.flag("verbose", true)?,
            },
            "add-machine" => Command::AddMachine {
                name: args.required("name")?,
                ip: args.ip("ip")?,
                tags: args.optional("tags").map(|t| parse_tags(&t)),
            },
            "machines" => Command::Machines,
            "provision" => Command::Provision {
                floor: args.count("floor")?,
            },
            "watch" => Command::Watch {
                floor: args.count("floor")?,
                interval: match args.duration("interval")? {
                    Some(0) => return Err(args.invalid("interval must be non-zero".to_string())),
                    other => other,
                },
            },
            other => return Err(CliError::UnknownAction(other.to_string())),
        };
        Ok(command)
    }
}

/// Arguments bound to an action's parameter names.
struct Args {
    spec: &'static ActionSpec,
    values: BTreeMap<&'static str, String>,
}

impl Args {
    fn bind(spec: &'static ActionSpec, raw: &[String]) -> Result<Self, CliError> {
        let params: Vec<&'static str> = spec.params().collect();
        let mut args = Args {
            spec,
            values: BTreeMap::new(),
        };
        let mut positional = 0;
        let mut named_seen = false;

        for arg in raw {
            if let Some((key, value)) = split_named(arg) {
                named_seen = true;
                let Some(param) = params.iter().copied().find(|p| *p == key) else {
                    return Err(args.invalid(format!("unknown argument '{key}'")));
                };
                if args.values.insert(param, value.to_string()).is_some() {
                    return Err(args.invalid(format!("'{key}' given twice")));
                }
            } else {
                if named_seen {
                    return Err(args.invalid(format!(
                        "positional argument '{arg}' after key=value arguments"
                    )));
                }
                let Some(param) = params.get(positional).copied() else {
                    return Err(args.invalid(format!("unexpected argument '{arg}'")));
                };
                args.values.insert(param, arg.clone());
                positional += 1;
            }
        }

        if let Some(missing) = spec.required.iter().find(|r| !args.values.contains_key(*r)) {
            return Err(CliError::MissingArgument {
                action: spec.name,
                name: *missing,
            });
        }
        Ok(args)
    }

    fn invalid(&self, reason: String) -> CliError {
        CliError::InvalidArgument {
            action: self.spec.name,
            reason,
        }
    }

    fn optional(&mut self, name: &str) -> Option<String> {
        self.values.remove(name)
    }

    fn required(&mut self, name: &'static str) -> Result<String, CliError> {
        self.values.remove(name).ok_or(CliError::MissingArgument {
            action: self.spec.name,
            name,
        })
    }

    fn duration(&mut self, name: &str) -> Result<Option<u64>, CliError> {
        self.optional(name)
            .map(|raw| {
                parse_duration(&raw).map_err(|e| self.invalid(format!("{name}: {e}")))
            })
            .transpose()
    }

    fn flag(&mut self, name: &str, default: bool) -> Result<bool, CliError> {
        match self.optional(name).as_deref() {
            None => Ok(default),
            Some("true" | "yes" | "1") => Ok(true),
            Some("false" | "no" | "0") => Ok(false),
            Some(other) => Err(self.invalid(format!("{name}: expected true or false, got '{other}'"))),
        }
    }

    fn task_id(&mut self, name: &'static str) -> Result<TaskId, CliError> {
        let raw = self.required(name)?;
        raw.trim()
            .parse()
            .map_err(|_| self.invalid(format!("{name}: '{raw}' is not a task id")))
    }

    fn count(&mut self, name: &str) -> Result<Option<usize>, CliError> {
        self.optional(name)
            .map(|raw| {
                raw.trim()
                    .parse()
                    .map_err(|_| self.invalid(format!("{name}: '{raw}' is not a number")))
            })
            .transpose()
    }

    fn ip(&mut self, name: &'static str) -> Result<Ipv4Addr, CliError> {
        let raw = self.required(name)?;
        raw.trim()
            .parse()
            .map_err(|_| self.invalid(format!("{name}: '{raw}' is not an IPv4 address")))
    }
}

/// Split `key=value`. Values like URLs with query strings stay positional
/// because their "key" is not a plain identifier.
fn split_named(arg: &str) -> Option<(&str, &str)> {
    let (key, value) = arg.split_once('=')?;
    let plain = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    plain.then_some((key, value))
}
