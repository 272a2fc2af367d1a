//! Error-handling code.

use std::fmt;

use thiserror::Error;

use crate::models::ProcessingState;
use crate::night::Night;

/// Why a job could not be admitted. These are all per-item errors: a batch
/// insert collects them and carries on with the next file.
#[derive(Debug, Error)]
pub enum AdmissionError {
    /// The XML belongs to a different jar version than the one requested.
    #[error("xml {xml} is meant for jar {xml_jar_version}, not for jar {jar_version}")]
    VersionMismatch {
        /// The name of the XML.
        xml: String,
        /// The jar version the XML was uploaded for.
        xml_jar_version: String,
        /// The jar version requested for the job.
        jar_version: String,
    },

    /// No available and compatible DRS file exists for this run.
    #[error("no drs file found for {night}_{run_id:03}")]
    NoDrsFile {
        /// The night of the raw data file.
        night: Night,
        /// The run of the raw data file.
        run_id: i32,
    },

    /// The raw data file was recorded with a region of interest we don't
    /// know how to calibrate.
    #[error("unsupported region of interest {roi} for {night}_{run_id:03}")]
    UnsupportedRoi {
        /// The night of the raw data file.
        night: Night,
        /// The run of the raw data file.
        run_id: i32,
        /// The offending region of interest.
        roi: i32,
    },

    /// A job for this (raw data file, jar, xml) triple already exists.
    #[error("job for {night}_{run_id:03} with this jar and xml already exists")]
    DuplicateJob {
        /// The night of the raw data file.
        night: Night,
        /// The run of the raw data file.
        run_id: i32,
    },

    /// Something went wrong talking to the store.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// A status change which the state machine does not allow.
#[derive(Debug, Error)]
#[error("job {job_id} cannot go from {from} to {to}")]
pub struct TransitionError {
    /// The job we tried to update.
    pub job_id: i32,
    /// The state the job is in.
    pub from: ProcessingState,
    /// The state we were asked to move it to.
    pub to: ProcessingState,
}

/// Support for displaying an error with its complete list of causes. Our log
/// lines are single records, so we want the whole chain in one place.
pub trait DisplayCausesExt {
    /// Display the error and its causes.
    fn display_causes(&self) -> DisplayCauses<'_>;
}

impl DisplayCausesExt for anyhow::Error {
    fn display_causes(&self) -> DisplayCauses<'_> {
        DisplayCauses { err: self }
    }
}

/// Helper type used to display errors.
pub struct DisplayCauses<'a> {
    err: &'a anyhow::Error,
}

impl fmt::Display for DisplayCauses<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.err)?;
        for cause in self.err.chain().skip(1) {
            write!(f, ": caused by: {}", cause)?;
        }
        Ok(())
    }
}

#[test]
fn display_causes_includes_the_whole_chain() {
    use anyhow::Context as _;

    let err = Err::<(), _>(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "no such file",
    ))
    .context("could not read jar")
    .unwrap_err();
    assert_eq!(
        err.display_causes().to_string(),
        "could not read jar: caused by: no such file",
    );
}
