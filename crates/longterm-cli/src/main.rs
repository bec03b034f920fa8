use std::path::PathBuf;

use clap::Parser;

mod command;
mod commands;

use command::{CliError, Command};
use commands::Context;
use longterm_core::LongtermConfig;

const DEFAULT_CONFIG_FILE: &str = "longterm.toml";

#[derive(Parser)]
#[command(
    name = "experiment",
    about = "Schedule recurring longterm experiments and keep machines provisioned for them",
    version
)]
struct Cli {
    /// Path to longterm.toml (default: <data-dir>/longterm.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory holding the state store
    #[arg(long, default_value = ".", global = true)]
    data_dir: PathBuf,
    /// Action to perform (see `experiment help`)
    action: String,
    /// Positional arguments, then key=value pairs
    #[arg(allow_hyphen_values = true, trailing_var_arg = true)]
    arguments: Vec<String>,
}

#[tokio::main]
async fn main() {
    // Logs go to stderr so stdout stays parseable for the cronjob script.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn,longterm=info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        report(&e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let command = Command::parse(&cli.action, &cli.arguments)?;
    let (config, config_path) = load_config(cli.config, &cli.data_dir)?;
    let ctx = Context {
        config,
        config_path,
        data_dir: cli.data_dir,
    };
    commands::execute(&ctx, command).await
}

/// Load and validate the config. An explicit `--config` must exist; the
/// default location is optional.
fn load_config(
    explicit: Option<PathBuf>,
    data_dir: &std::path::Path,
) -> anyhow::Result<(LongtermConfig, Option<PathBuf>)> {
    let path = match explicit {
        Some(path) => Some(path),
        None => Some(data_dir.join(DEFAULT_CONFIG_FILE)).filter(|p| p.is_file()),
    };
    let config = match &path {
        Some(path) => LongtermConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {e:#}", path.display()))?,
        None => LongtermConfig::default(),
    };
    config.validate()?;
    Ok((config, path))
}

fn report(error: &anyhow::Error) {
    match error.downcast_ref::<CliError>() {
        Some(cli_error) => {
            eprintln!("{cli_error}");
            if let Some(spec) = cli_error.action() {
                eprintln!();
                eprint!("{}", spec.help());
            }
        }
        None => eprintln!("Error: {error:#}"),
    }
}
