//! longterm-core: shared building blocks for the longterm experiment scheduler.
//!
//! Pure functions and plain types with no storage dependency:
//!
//! - [`alloc`]: next free host-only IP address and next sequential eggname
//! - [`duration`]: human duration strings (`"1d"`, `"2h"`) to seconds
//! - [`target`]: what a task analyzes (file path or URL)
//! - [`tags`]: comma-separated tag sets
//! - [`config`]: the `longterm.toml` configuration file

pub mod alloc;
pub mod config;
pub mod duration;
pub mod tags;
pub mod target;

pub use alloc::{AllocError, IdentitySpace, Subnet, next_address, next_free_identity, next_identity};
pub use config::{ConfigError, LongtermConfig};
pub use duration::{DurationError, format_duration, parse_duration};
pub use tags::{LONGTERM_TAG, TagSet, join_tags, parse_tags};
pub use target::Target;
