//! longterm-provision: keeps enough free machines around for recurring
//! experiments.
//!
//! Counts the free machines carrying the fleet tags and, while the count is
//! below the floor, asks the clone tooling for one more machine at a time.
//!
//! # Provisioning loop
//!
//! ```text
//! while count_available(fleet_tags) < floor and clones < floor:
//!     machines = re-read machine table
//!     request  = (next_free_identity(machines.name), next_address(machines.ip))
//!     clone(request)           // stop this round on failure
//!     register(request)        // unless the tool already did; stop on failure
//! ```
//!
//! The loop re-reads the machine table before every allocation, so machines
//! added out of band between two clones are never handed out twice.

pub mod clone;
pub mod error;
pub mod monitor;

pub use clone::{CloneFuture, CloneRequest, CloneTool, VmcloakClone};
pub use error::{ProvisionError, ProvisionResult};
pub use monitor::{ProvisionReport, Provisioner};
