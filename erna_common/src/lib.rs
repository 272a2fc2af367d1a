//! Code shared between the ERNA orchestrator, the node executor and the
//! operator tools.

#![warn(missing_docs)]

pub use anyhow;
pub use cast;
pub use chrono;
pub use diesel;
pub use serde_json;
pub use tracing;

pub mod admission;
pub mod cluster;
pub mod config;
pub mod db;
pub mod drs;
pub mod errors;
pub mod models;
pub mod night;
pub mod paths;
#[allow(missing_docs, unused_imports)]
mod schema;
pub mod status;
pub mod tracing_support;

/// Common imports used by many modules.
pub mod prelude {
    pub use anyhow::{format_err, Context as _};
    pub use chrono::{NaiveDate, NaiveDateTime, Utc};
    pub use diesel::{self, prelude::*, SqliteConnection};
    pub use serde::{Deserialize, Serialize};
    pub use std::{
        collections::{BTreeMap, HashMap},
        fmt,
        fs::File,
        io::Write,
        path::{Path, PathBuf},
    };
    pub use tracing::{debug, error, info, instrument, trace, warn};

    pub use super::db::Store;
    pub use super::errors::DisplayCausesExt;
    pub use super::models::*;
    pub use super::night::Night;
    pub use super::{Error, Result};
}

/// Error type for this crate's functions.
pub type Error = anyhow::Error;

/// Result type for this crate's functions.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The version of `erna_common` that we're using. This can be used to make
/// sure that the orchestrator and the executors were built together.
pub fn erna_common_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
