//! Provisioner: fleet floor monitor.
//!
//! Reads machine availability from the state store and clones machines
//! until the floor is met. Each round is stateless: everything it needs is
//! re-read from the store, so it can be triggered from cron or run in the
//! long-lived `run` loop.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use longterm_core::{IdentitySpace, LongtermConfig, Subnet, TagSet, next_address, next_free_identity};
use longterm_scheduler::MachineLocks;
use longterm_state::{Machine, StateStore};

use crate::clone::{CloneRequest, CloneTool};
use crate::error::ProvisionResult;

/// Outcome of one provisioning round.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisionReport {
    pub floor: usize,
    pub available_before: usize,
    /// Machines cloned this round, in order.
    pub cloned: Vec<CloneRequest>,
    pub available_after: usize,
    /// Why the round stopped early, if a clone or its registration failed.
    pub stopped_on: Option<String>,
}

impl ProvisionReport {
    pub fn floor_met(&self) -> bool {
        self.available_after >= self.floor
    }
}

/// Keeps at least `floor` free machines carrying the fleet tags.
pub struct Provisioner {
    state: StateStore,
    locks: MachineLocks,
    tool: Arc<dyn CloneTool>,
    subnet: Subnet,
    identity: IdentitySpace,
    tags: TagSet,
}

impl Provisioner {
    /// Create a provisioner with the stock subnet, eggnames, and tags.
    pub fn new(state: StateStore, tool: Arc<dyn CloneTool>) -> Self {
        Self::from_config(state, tool, &LongtermConfig::default())
    }

    pub fn from_config(state: StateStore, tool: Arc<dyn CloneTool>, config: &LongtermConfig) -> Self {
        Self {
            locks: MachineLocks::new(state.clone()),
            state,
            tool,
            subnet: config.network,
            identity: config.identity.clone(),
            tags: config.fleet_tags(),
        }
    }

    /// Free machines carrying the fleet tags.
    pub fn count_available(&self) -> ProvisionResult<usize> {
        Ok(self.locks.count_available(&self.tags)?)
    }

    /// Compute the identity and address for the next machine from the
    /// current machine table. Nothing is reserved, but neither value
    /// collides with a machine already in the table.
    pub fn next_request(&self) -> ProvisionResult<CloneRequest> {
        let machines = self.state.list_machines()?;
        let ip = next_address(&self.subnet, machines.iter().map(|m| &m.ip))?;
        let name = next_free_identity(&self.identity, machines.iter().map(|m| m.name.as_str()))?;
        Ok(CloneRequest {
            name,
            ip,
            tags: self.tags.clone(),
        })
    }

    /// Clone machines one at a time until `floor` free machines exist.
    ///
    /// Issues at most `floor` clone requests. A failed clone or a failed
    /// registration ends the round; the next round starts over from the
    /// store.
    pub async fn check_and_provision(&self, floor: usize) -> ProvisionResult<ProvisionReport> {
        let available_before = self.count_available()?;
        let mut report = ProvisionReport {
            floor,
            available_before,
            ..Default::default()
        };

        let mut available = available_before;
        while available < floor && report.cloned.len() < floor {
            let request = self.next_request()?;
            info!(
                machine = %request.name,
                ip = %request.ip,
                available,
                floor,
                "cloning machine"
            );

            if let Err(e) = self.tool.clone_machine(&request).await {
                warn!(
                    machine = %request.name,
                    ip = %request.ip,
                    error = %e,
                    "clone failed, stopping this round"
                );
                report.stopped_on = Some(format!("{}: {e:#}", request.name));
                break;
            }

            // The name was free when the request was computed, so a record
            // with the requested address is the tool's own registration.
            let registered = match self.state.get_machine(&request.name)? {
                Some(existing) if existing.ip == request.ip => {
                    debug!(machine = %request.name, "clone tool registered machine itself");
                    Ok(())
                }
                _ => self.locks.register(Machine::new(
                    request.name.clone(),
                    request.ip,
                    request.tags.clone(),
                )),
            };

            if let Err(e) = registered {
                error!(
                    machine = %request.name,
                    ip = %request.ip,
                    error = %e,
                    "cloned machine could not be registered, stopping this round"
                );
                report.stopped_on = Some(format!("{}: {e}", request.name));
                report.cloned.push(request);
                break;
            }

            report.cloned.push(request);
            available = self.count_available()?;
        }

        report.available_after = self.count_available()?;
        Ok(report)
    }

    /// Run a provisioning round every `interval` until shutdown.
    pub async fn run(
        &self,
        floor: usize,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        if interval.is_zero() {
            error!("provisioning monitor needs a non-zero interval");
            return;
        }
        info!(floor, interval_secs = interval.as_secs(), "provisioning monitor started");

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.check_and_provision(floor).await {
                        Ok(report) if report.cloned.is_empty() && report.stopped_on.is_none() => {
                            debug!(available = report.available_after, floor, "fleet floor met");
                        }
                        Ok(report) => {
                            info!(
                                cloned = report.cloned.len(),
                                available = report.available_after,
                                floor,
                                stopped_on = ?report.stopped_on,
                                "provisioning round finished"
                            );
                        }
                        Err(e) => error!(error = %e, "provisioning round failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("provisioning monitor shutting down");
                    break;
                }
            }
        }
    }
}
