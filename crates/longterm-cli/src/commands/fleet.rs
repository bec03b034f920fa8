use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tracing::{error, info};

use longterm_core::join_tags;
use longterm_provision::{Provisioner, VmcloakClone};

use super::Context;
use crate::command::CronjobAction;

/// Values substituted into the cronjob script.
struct CronjobParams<'a> {
    experiment: Vec<String>,
    cuckoo_root: PathBuf,
    floor: usize,
    clone_command: &'a str,
    bird: &'a str,
    tags: String,
}

pub fn cronjob(ctx: &Context, action: CronjobAction) -> anyhow::Result<()> {
    let script = render_cronjob(&cronjob_params(ctx)?);
    match action {
        CronjobAction::Dump => print!("{script}"),
        CronjobAction::Install(path) => {
            install_script(&path, &script)?;
            println!("Installed machine cronjob to {}", path.display());
        }
    }
    Ok(())
}

pub async fn provision(ctx: &Context, floor: Option<usize>) -> anyhow::Result<()> {
    let floor = floor.unwrap_or(ctx.config.fleet.floor);
    let report = provisioner(ctx)?.check_and_provision(floor).await?;

    for request in &report.cloned {
        println!("Cloned {} ({})", request.name, request.ip);
    }
    println!(
        "Available machines: {} (floor {})",
        report.available_after, report.floor
    );
    if let Some(reason) = report.stopped_on {
        anyhow::bail!("provisioning stopped: {reason}");
    }
    Ok(())
}

pub async fn watch(ctx: &Context, floor: Option<usize>, interval: Option<u64>) -> anyhow::Result<()> {
    let floor = floor.unwrap_or(ctx.config.fleet.floor);
    let interval = match interval {
        Some(secs) => secs,
        None => ctx.config.watch_interval_secs()?,
    };
    anyhow::ensure!(interval > 0, "watch interval must be non-zero");
    let provisioner = provisioner(ctx)?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("shutdown signal received"),
            Err(e) => error!(error = %e, "failed to listen for ctrl-c"),
        }
        let _ = shutdown_tx.send(true);
    });

    provisioner
        .run(floor, Duration::from_secs(interval), shutdown_rx)
        .await;
    Ok(())
}

fn provisioner(ctx: &Context) -> anyhow::Result<Provisioner> {
    let tool = VmcloakClone::from_config(&ctx.config.clone)?;
    Ok(Provisioner::from_config(
        ctx.open_store()?,
        Arc::new(tool),
        &ctx.config,
    ))
}

fn cronjob_params(ctx: &Context) -> anyhow::Result<CronjobParams<'_>> {
    let exe = std::env::current_exe().context("failed to locate the experiment binary")?;
    let mut experiment = vec![exe.display().to_string()];
    if let Some(config) = &ctx.config_path {
        experiment.push("--config".to_string());
        experiment.push(absolute(config)?.display().to_string());
    }
    experiment.push("--data-dir".to_string());
    experiment.push(absolute(&ctx.data_dir)?.display().to_string());

    let cuckoo_root = match &ctx.config.clone.cuckoo_root {
        Some(root) => root.clone(),
        None => std::env::current_dir()?,
    };

    Ok(CronjobParams {
        experiment,
        cuckoo_root,
        floor: ctx.config.fleet.floor,
        clone_command: &ctx.config.clone.command,
        bird: &ctx.config.clone.bird,
        tags: join_tags(&ctx.config.fleet_tags()),
    })
}

fn absolute(path: &Path) -> anyhow::Result<PathBuf> {
    Ok(std::path::absolute(path)?)
}

fn render_cronjob(params: &CronjobParams<'_>) -> String {
    let experiment = params
        .experiment
        .iter()
        .map(|arg| format!("\"{arg}\""))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        r#"#!/bin/sh
# Provisions virtual machines for longterm analysis. Run it as the user the
# sandbox runs under.
set -e

CUCKOO="{root}"

experiment() {{
    {experiment} "$@"
}}

# Keep at least {floor} free longterm machines around.
while [ "$(experiment count-available-machines verbose=false)" -lt {floor} ]; do
    IPADDR="$(experiment allocate-ipaddr verbose=false)"
    EGGNAME="$(experiment allocate-eggname verbose=false)"
    {command} -r --bird {bird} --hostonly-ip "$IPADDR" \
        --cuckoo "$CUCKOO" "$EGGNAME" --tags {tags}
    experiment add-machine "$EGGNAME" "$IPADDR" tags={tags}
done
"#,
        root = params.cuckoo_root.display(),
        floor = params.floor,
        command = params.clone_command,
        bird = params.bird,
        tags = params.tags,
    )
}

fn install_script(path: &Path, script: &str) -> anyhow::Result<()> {
    std::fs::write(path, script).with_context(|| format!("failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use longterm_core::LongtermConfig;

    fn params() -> CronjobParams<'static> {
        CronjobParams {
            experiment: vec![
                "/usr/local/bin/experiment".to_string(),
                "--data-dir".to_string(),
                "/var/lib/longterm".to_string(),
            ],
            cuckoo_root: PathBuf::from("/opt/cuckoo"),
            floor: 5,
            clone_command: "vmcloak-clone",
            bird: "bird0",
            tags: "longterm".to_string(),
        }
    }

    #[test]
    fn cronjob_script_embeds_root_and_floor() {
        let script = render_cronjob(&params());
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("CUCKOO=\"/opt/cuckoo\""));
        assert!(script.contains(
            "\"/usr/local/bin/experiment\" \"--data-dir\" \"/var/lib/longterm\" \"$@\""
        ));
        assert!(script.contains("count-available-machines verbose=false)\" -lt 5 ]"));
        assert!(script.contains("vmcloak-clone -r --bird bird0 --hostonly-ip \"$IPADDR\" \\\n"));
        assert!(script.contains("\"$EGGNAME\" --tags longterm\n"));
        assert!(script.contains("experiment add-machine \"$EGGNAME\" \"$IPADDR\" tags=longterm"));
    }

    #[test]
    fn cronjob_follows_config() {
        let mut p = params();
        p.floor = 8;
        p.bird = "win7x64";
        let script = render_cronjob(&p);
        assert!(script.contains("-lt 8 ]"));
        assert!(script.contains("--bird win7x64"));
    }

    #[test]
    fn install_writes_executable_script() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = LongtermConfig::default();
        config.clone.cuckoo_root = Some(PathBuf::from("/opt/cuckoo"));
        config.fleet.floor = 3;
        let ctx = Context {
            config,
            config_path: None,
            data_dir: dir.path().to_path_buf(),
        };
        let path = dir.path().join("longterm-cron.sh");

        cronjob(&ctx, CronjobAction::Install(path.clone())).unwrap();

        let script = std::fs::read_to_string(&path).unwrap();
        assert!(script.contains("CUCKOO=\"/opt/cuckoo\""));
        assert!(script.contains("-lt 3 ]"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }
}
