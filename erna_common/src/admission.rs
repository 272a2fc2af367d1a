//! Creating new jobs.

use crate::db::is_unique_violation;
use crate::drs::find_drs_file;
use crate::errors::AdmissionError;
use crate::prelude::*;

/// The walltime we request for a job unless told otherwise, in minutes.
pub const DEFAULT_WALLTIME: i32 = 180;

/// The priority of a job unless told otherwise. Lower values are more urgent.
pub const DEFAULT_PRIORITY: i32 = 5;

/// Everything that is the same for all jobs of one batch.
#[derive(Clone, Debug)]
pub struct JobTemplate<'a> {
    /// The tool version to run.
    pub jar: &'a Jar,
    /// The configuration to run it with. Must belong to `jar`.
    pub xml: &'a Xml,
    /// The walltime to request, in minutes.
    pub walltime: i32,
    /// Lower values are submitted first.
    pub priority: i32,
    /// Use the nearest DRS run, rather than the last one before the data.
    pub prefer_closest: bool,
}

impl<'a> JobTemplate<'a> {
    /// A template with the default walltime and priority.
    pub fn new(jar: &'a Jar, xml: &'a Xml) -> Self {
        JobTemplate {
            jar,
            xml,
            walltime: DEFAULT_WALLTIME,
            priority: DEFAULT_PRIORITY,
            prefer_closest: true,
        }
    }
}

/// Create a job processing `raw` as described by `template`.
#[instrument(skip_all, fields(night = %raw.night, run_id = raw.run_id), level = "debug")]
pub fn insert_job(
    raw: &RawDataFile,
    template: &JobTemplate<'_>,
    conn: &mut SqliteConnection,
) -> Result<Job, AdmissionError> {
    if template.xml.jar_id != template.jar.id {
        let xml_jar = Jar::find(template.xml.jar_id, conn)?;
        return Err(AdmissionError::VersionMismatch {
            xml: template.xml.name.clone(),
            xml_jar_version: xml_jar.version,
            jar_version: template.jar.version.clone(),
        });
    }

    let drs = find_drs_file(raw, template.prefer_closest, conn)?;
    let new_job = NewJob {
        raw_data_file_id: raw.id,
        drs_file_id: drs.id,
        jar_id: template.jar.id,
        xml_id: template.xml.id,
        status: ProcessingState::Inserted,
        priority: template.priority,
        walltime: template.walltime,
    };
    match new_job.insert(conn) {
        Ok(job) => {
            debug!("inserted job {} using drs run {}", job.id, drs.run_id);
            Ok(job)
        }
        Err(err) if is_unique_violation(&err) => Err(AdmissionError::DuplicateJob {
            night: raw.night,
            run_id: raw.run_id,
        }),
        Err(err) => Err(err.into()),
    }
}

/// Create a job for every file in `raws`. Files which could not be admitted
/// are logged and returned together with the reason, and the remaining files
/// are still processed.
pub fn insert_many<'r>(
    raws: &'r [RawDataFile],
    template: &JobTemplate<'_>,
    conn: &mut SqliteConnection,
) -> Vec<(&'r RawDataFile, AdmissionError)> {
    let mut failed = vec![];
    let mut inserted = 0;
    for raw in raws {
        match insert_job(raw, template, conn) {
            Ok(_) => inserted += 1,
            Err(err @ AdmissionError::DuplicateJob { .. }) => {
                debug!("skipping {}: {}", raw.basename(), err);
                failed.push((raw, err));
            }
            Err(err) => {
                warn!("could not insert job for {}: {}", raw.basename(), err);
                failed.push((raw, err));
            }
        }
    }
    info!("inserted {} jobs, {} files failed", inserted, failed.len());
    failed
}
