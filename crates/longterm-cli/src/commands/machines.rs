use std::net::Ipv4Addr;

use longterm_core::{TagSet, join_tags, next_address, next_free_identity};
use longterm_scheduler::MachineLocks;
use longterm_state::Machine;

use super::Context;

pub fn count_available(ctx: &Context, verbose: bool, tags: Option<TagSet>) -> anyhow::Result<()> {
    let tags = tags.unwrap_or_else(|| ctx.config.fleet_tags());
    let count = MachineLocks::new(ctx.open_store()?).count_available(&tags)?;
    if verbose {
        println!("Available machines: {count}");
    } else {
        println!("{count}");
    }
    Ok(())
}

pub fn allocate_ipaddr(ctx: &Context, verbose: bool) -> anyhow::Result<()> {
    let machines = ctx.open_store()?.list_machines()?;
    let ip = next_address(&ctx.config.network, machines.iter().map(|m| &m.ip))?;
    if verbose {
        println!("Next IP address: {ip}");
    } else {
        println!("{ip}");
    }
    Ok(())
}

pub fn allocate_eggname(ctx: &Context, verbose: bool) -> anyhow::Result<()> {
    let machines = ctx.open_store()?.list_machines()?;
    let name = next_free_identity(&ctx.config.identity, machines.iter().map(|m| m.name.as_str()))?;
    if verbose {
        println!("Next egg name: {name}");
    } else {
        println!("{name}");
    }
    Ok(())
}

pub fn add(ctx: &Context, name: &str, ip: Ipv4Addr, tags: Option<TagSet>) -> anyhow::Result<()> {
    if !ctx.config.network.contains(&ip) {
        tracing::warn!(%ip, subnet = %ctx.config.network, "machine address outside the managed subnet");
    }
    let tags = tags.unwrap_or_else(|| ctx.config.fleet_tags());
    MachineLocks::new(ctx.open_store()?).register(Machine::new(name, ip, tags))?;
    println!("Registered machine {name} ({ip})");
    Ok(())
}

pub fn list(ctx: &Context) -> anyhow::Result<()> {
    let machines = ctx.open_store()?.list_machines()?;
    print!("{}", render_machines(&machines));
    Ok(())
}

fn render_machines(machines: &[Machine]) -> String {
    let mut out = format!("{:<10} | {:<15} | {:<16} | {}\n", "Name", "IP", "Lock", "Tags");
    for machine in machines {
        let lock = match (&machine.locked, &machine.locked_by) {
            (true, Some(experiment)) => experiment.as_str(),
            (true, None) => "locked",
            (false, _) => "free",
        };
        out.push_str(&format!(
            "{:<10} | {:<15} | {:<16} | {}\n",
            machine.name,
            machine.ip.to_string(),
            lock,
            join_tags(&machine.tags)
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use longterm_core::{LongtermConfig, parse_tags};

    fn context(dir: &tempfile::TempDir) -> Context {
        Context {
            config: LongtermConfig::default(),
            config_path: None,
            data_dir: dir.path().to_path_buf(),
        }
    }

    #[test]
    fn add_machine_uses_fleet_tags_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);

        add(&ctx, "egg01", Ipv4Addr::new(192, 168, 56, 3), None).unwrap();
        add(&ctx, "egg02", Ipv4Addr::new(192, 168, 56, 4), Some(parse_tags("adhoc"))).unwrap();
        assert!(add(&ctx, "egg03", Ipv4Addr::new(192, 168, 56, 3), None).is_err());

        let machines = ctx.open_store().unwrap().list_machines().unwrap();
        assert_eq!(machines.len(), 2);
        assert_eq!(machines[0].tags, parse_tags("longterm"));
        assert_eq!(machines[1].tags, parse_tags("adhoc"));
    }

    #[test]
    fn allocation_on_exhausted_subnet_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(&dir);
        ctx.config.network.broadcast_octet = 5;

        allocate_ipaddr(&ctx, false).unwrap();
        add(&ctx, "egg01", Ipv4Addr::new(192, 168, 56, 3), None).unwrap();
        add(&ctx, "egg02", Ipv4Addr::new(192, 168, 56, 4), None).unwrap();
        assert!(allocate_ipaddr(&ctx, false).is_err());
        allocate_eggname(&ctx, true).unwrap();
    }

    #[test]
    fn eggname_skips_live_machine_after_gap() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(&dir);
        add(&ctx, "egg01", Ipv4Addr::new(192, 168, 56, 3), None).unwrap();
        add(&ctx, "egg03", Ipv4Addr::new(192, 168, 56, 5), None).unwrap();

        let machines = ctx.open_store().unwrap().list_machines().unwrap();
        let name =
            next_free_identity(&ctx.config.identity, machines.iter().map(|m| m.name.as_str())).unwrap();
        assert_eq!(name, "egg04");
        allocate_eggname(&ctx, false).unwrap();
    }

    #[test]
    fn machine_table_shows_lock_owner() {
        let mut locked = Machine::new("egg01", Ipv4Addr::new(192, 168, 56, 3), parse_tags("longterm"));
        locked.locked = true;
        locked.locked_by = Some("E1".to_string());
        let free = Machine::new("egg02", Ipv4Addr::new(192, 168, 56, 4), parse_tags("longterm,win7"));

        let table = render_machines(&[locked, free]);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("egg01"));
        assert!(lines[1].contains("| E1 "));
        assert!(lines[2].contains("| free "));
        assert!(lines[2].ends_with("longterm,win7"));
    }
}
