//! Address and eggname allocation for freshly cloned machines.
//!
//! Both allocators are pure: they compute the next value from what is already
//! known about the fleet and never reserve it. A value is only taken once a
//! machine record carrying it has been committed to the state store.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised when an allocation space has no room left.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("ran out of IP addresses for subnet {0}")]
    AddressSpaceExhausted(String),

    #[error("ran out of {width}-digit eggnames at machine count {count}")]
    IdentitySpaceExhausted { count: usize, width: u32 },
}

// ── Addresses ─────────────────────────────────────────────────────

/// The host-only /24 network the fleet's machines are attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subnet {
    /// First three octets shared by every managed address.
    pub prefix: [u8; 3],
    /// Octet handed out when no managed address exists yet. Lower octets
    /// belong to the host and infrastructure.
    pub first_octet: u8,
    /// First octet that may never be handed out.
    pub broadcast_octet: u8,
}

impl Default for Subnet {
    fn default() -> Self {
        Self {
            prefix: [192, 168, 56],
            first_octet: 3,
            broadcast_octet: 254,
        }
    }
}

impl Subnet {
    /// Whether `ip` falls inside this subnet.
    pub fn contains(&self, ip: &Ipv4Addr) -> bool {
        ip.octets()[..3] == self.prefix
    }

    /// Build the address for a host octet.
    pub fn address(&self, host: u8) -> Ipv4Addr {
        let [a, b, c] = self.prefix;
        Ipv4Addr::new(a, b, c, host)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.prefix;
        write!(f, "{a}.{b}.{c}.0/24")
    }
}

/// Compute the next free address inside `subnet`.
///
/// Addresses outside the subnet are ignored. The result is one past the
/// highest managed host octet, or `subnet.first_octet` when none is known.
pub fn next_address<'a>(
    subnet: &Subnet,
    known: impl IntoIterator<Item = &'a Ipv4Addr>,
) -> Result<Ipv4Addr, AllocError> {
    let highest = known
        .into_iter()
        .filter(|ip| subnet.contains(ip))
        .map(|ip| ip.octets()[3])
        .max();

    let next = match highest {
        Some(host) => u16::from(host) + 1,
        None => u16::from(subnet.first_octet),
    };

    if next >= u16::from(subnet.broadcast_octet) {
        return Err(AllocError::AddressSpaceExhausted(subnet.to_string()));
    }

    Ok(subnet.address(next as u8))
}

// ── Eggnames ──────────────────────────────────────────────────────

/// Naming scheme for machine identities: `{prefix}{counter:0width}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySpace {
    pub prefix: String,
    pub width: u32,
}

impl Default for IdentitySpace {
    fn default() -> Self {
        Self {
            prefix: "egg".to_string(),
            width: 2,
        }
    }
}

impl IdentitySpace {
    /// Largest counter that still fits in `width` digits, if bounded.
    fn max_counter(&self) -> Option<u64> {
        10u64.checked_pow(self.width).map(|limit| limit - 1)
    }
}

/// Compute the eggname for the machine that follows `machine_count` existing ones.
pub fn next_identity(space: &IdentitySpace, machine_count: usize) -> Result<String, AllocError> {
    let counter = machine_count as u64 + 1;
    if let Some(max) = space.max_counter()
        && counter > max
    {
        return Err(AllocError::IdentitySpaceExhausted {
            count: machine_count,
            width: space.width,
        });
    }

    Ok(format!(
        "{}{:0width$}",
        space.prefix,
        counter,
        width = space.width as usize
    ))
}

/// Like [`next_identity`], but steps past names that are already taken.
///
/// The count-based name collides with a live machine once one was removed
/// out of band (`egg01`, `egg03` left: the count says `egg03`). The next
/// free counter above the count is used instead.
pub fn next_free_identity<'a>(
    space: &IdentitySpace,
    taken: impl IntoIterator<Item = &'a str>,
) -> Result<String, AllocError> {
    let taken: HashSet<&str> = taken.into_iter().collect();
    let mut count = taken.len();
    loop {
        let name = next_identity(space, count)?;
        if !taken.contains(name.as_str()) {
            return Ok(name);
        }
        count += 1;
    }
}
