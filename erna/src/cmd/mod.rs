//! Our subcommands.

pub mod job;
pub mod migrate;
pub mod runs;
pub mod upload;
