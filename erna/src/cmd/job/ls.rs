//! The `job ls` subcommand.

use erna_common::prelude::*;
use prettytable::{format::consts::FORMAT_CLEAN, row, Table};

/// The `job ls` subcommand.
pub fn run(status: Option<ProcessingState>, conn: &mut SqliteConnection) -> Result<()> {
    // Look up the information to display.
    let jobs = Job::list(status, conn)?;
    let details = jobs
        .iter()
        .map(|job| job.details(conn))
        .collect::<Result<Vec<_>>>()?;

    job_table(&details).printstd();
    Ok(())
}

/// Build a table with one row per job.
fn job_table(details: &[JobDetails]) -> Table {
    // This library makes some rather unusual API choices, but it does the job
    // well enough.
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.add_row(row!["JOB_ID", "RUN", "DRS", "JAR", "XML", "STATUS", "PRIORITY", "WALLTIME"]);
    for d in details {
        table.add_row(row![
            d.job.id,
            format!("{}_{:03}", d.raw_data_file.night, d.raw_data_file.run_id),
            format!("{}_{:03}", d.drs_file.night, d.drs_file.run_id),
            d.jar.version,
            d.xml.name,
            d.job.status,
            d.job.priority,
            d.job.walltime
        ]);
    }
    table
}
