//! Command implementations.
//!
//! Each subcommand is implemented in its own module.

pub(crate) mod completions;
pub(crate) mod inspect;
pub(crate) mod media;
pub(crate) mod ports;
pub(crate) mod record;
