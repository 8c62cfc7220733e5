//! Subcommand implementations.

pub(crate) mod info;
pub(crate) mod install;
pub(crate) mod invoke;
pub(crate) mod list;
pub(crate) mod remove;
pub(crate) mod search;
