//! Database models.

use diesel::{
    deserialize::{self, FromSql},
    serialize::{self, IsNull, Output, ToSql},
    sql_types::Integer,
    sqlite::{Sqlite, SqliteValue},
    AsExpression, FromSqlRow,
};
use std::str::FromStr;

use crate::prelude::*;

mod drs_file;
mod jar;
mod job;
mod raw_data_file;
mod xml;

pub use self::drs_file::*;
pub use self::jar::*;
pub use self::job::*;
pub use self::raw_data_file::*;
pub use self::xml::*;

/// Where a job is in its life. Stored as a foreign key into the
/// `processing_states` table, whose rows are seeded from this enum.
#[derive(
    AsExpression,
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    FromSqlRow,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[diesel(sql_type = Integer)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingState {
    /// The job has been created, but not handed to the cluster yet.
    Inserted,
    /// The job has been submitted to the cluster scheduler.
    Queued,
    /// An executor has started working on the job.
    Running,
    /// The job finished and its output has been stored.
    Success,
    /// The job could not be dispatched, or the tool failed.
    Failed,
    /// The job ran out of time.
    WalltimeExceeded,
    /// The executor could not find the raw data or DRS file.
    InputFileMissing,
}

impl ProcessingState {
    /// Every state, in the order of their ids.
    pub const ALL: [ProcessingState; 7] = [
        ProcessingState::Inserted,
        ProcessingState::Queued,
        ProcessingState::Running,
        ProcessingState::Success,
        ProcessingState::Failed,
        ProcessingState::WalltimeExceeded,
        ProcessingState::InputFileMissing,
    ];

    /// The id of this state in `processing_states`.
    pub fn id(self) -> i32 {
        match self {
            ProcessingState::Inserted => 1,
            ProcessingState::Queued => 2,
            ProcessingState::Running => 3,
            ProcessingState::Success => 4,
            ProcessingState::Failed => 5,
            ProcessingState::WalltimeExceeded => 6,
            ProcessingState::InputFileMissing => 7,
        }
    }

    /// Look up a state by its id in `processing_states`.
    pub fn from_id(id: i32) -> Result<ProcessingState> {
        ProcessingState::ALL
            .iter()
            .copied()
            .find(|state| state.id() == id)
            .ok_or_else(|| format_err!("unknown processing state id {}", id))
    }

    /// The description stored in `processing_states`, which is also the name
    /// used on the wire.
    pub fn description(self) -> &'static str {
        match self {
            ProcessingState::Inserted => "inserted",
            ProcessingState::Queued => "queued",
            ProcessingState::Running => "running",
            ProcessingState::Success => "success",
            ProcessingState::Failed => "failed",
            ProcessingState::WalltimeExceeded => "walltime_exceeded",
            ProcessingState::InputFileMissing => "input_file_missing",
        }
    }

    /// Is this a state in which the job will stay unless an operator steps
    /// in?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessingState::Success
                | ProcessingState::Failed
                | ProcessingState::WalltimeExceeded
                | ProcessingState::InputFileMissing
        )
    }

    /// May an executor's status report move a job from `self` to `to`?
    /// Repeating the current state is handled separately by the caller.
    pub fn accepts_report(self, to: ProcessingState) -> bool {
        match (self, to) {
            (ProcessingState::Queued, ProcessingState::Running) => true,
            (ProcessingState::Running, to) => to.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ProcessingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.description().fmt(f)
    }
}

impl FromStr for ProcessingState {
    type Err = Error;

    fn from_str(s: &str) -> Result<ProcessingState> {
        ProcessingState::ALL
            .iter()
            .copied()
            .find(|state| state.description() == s)
            .ok_or_else(|| format_err!("unknown processing state {:?}", s))
    }
}

impl ToSql<Integer, Sqlite> for ProcessingState {
    fn to_sql<'b>(&'b self, out: &mut Output<'b, '_, Sqlite>) -> serialize::Result {
        out.set_value(self.id());
        Ok(IsNull::No)
    }
}

impl FromSql<Integer, Sqlite> for ProcessingState {
    fn from_sql(bytes: SqliteValue<'_, '_, '_>) -> deserialize::Result<Self> {
        let id = <i32 as FromSql<Integer, Sqlite>>::from_sql(bytes)?;
        ProcessingState::from_id(id).map_err(|err| err.to_string().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptions_round_trip() {
        for state in ProcessingState::ALL {
            assert_eq!(state.description().parse::<ProcessingState>().unwrap(), state);
            assert_eq!(ProcessingState::from_id(state.id()).unwrap(), state);
        }
        assert!("error".parse::<ProcessingState>().is_err());
    }

    #[test]
    fn running_only_leads_to_terminal_states() {
        for to in ProcessingState::ALL {
            assert_eq!(ProcessingState::Running.accepts_report(to), to.is_terminal());
        }
    }

    #[test]
    fn terminal_states_accept_no_reports() {
        for from in ProcessingState::ALL.iter().copied().filter(|s| s.is_terminal()) {
            for to in ProcessingState::ALL {
                assert!(!from.accepts_report(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&ProcessingState::WalltimeExceeded).unwrap();
        assert_eq!(json, "\"walltime_exceeded\"");
    }
}
