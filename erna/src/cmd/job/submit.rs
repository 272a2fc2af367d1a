//! The `job submit` subcommand.

use erna_common::{
    admission::{insert_many, JobTemplate},
    prelude::*,
};
use std::io::Read;

/// How to build the jobs of one `job submit`.
#[derive(Debug)]
pub struct SubmitOptions {
    pub jar: String,
    pub xml: String,
    pub priority: i32,
    pub walltime: i32,
    pub prefer_closest: bool,
}

/// One row of a run list.
#[derive(Debug, Deserialize)]
struct RunlistRow {
    night: Night,
    run_id: i32,
}

/// Run the `job submit` subcommand.
pub fn run(runlist: &Path, options: &SubmitOptions, conn: &mut SqliteConnection) -> Result<()> {
    let f = File::open(runlist).with_context(|| format!("could not open {}", runlist.display()))?;
    let (inserted, failures) = submit(f, options, conn)?;
    println!("inserted {} jobs", inserted);
    if !failures.is_empty() {
        println!("{} runs failed:", failures.len());
        for failure in &failures {
            println!("  {}", failure);
        }
    }
    Ok(())
}

/// Insert a job for every run in `rdr`. Returns the number of jobs inserted
/// and a description of every run which could not be admitted.
fn submit<R: Read>(
    rdr: R,
    options: &SubmitOptions,
    conn: &mut SqliteConnection,
) -> Result<(usize, Vec<String>)> {
    // Executors can't run jobs without any time.
    if options.walltime <= 0 {
        return Err(format_err!(
            "walltime must be a positive number of minutes, got {}",
            options.walltime
        ));
    }
    let jar = Jar::find_by_version(&options.jar, conn)?;
    let xml = Xml::find_by_name_and_jar(&options.xml, &jar, conn)?;
    let template = JobTemplate {
        walltime: options.walltime,
        priority: options.priority,
        prefer_closest: options.prefer_closest,
        ..JobTemplate::new(&jar, &xml)
    };

    let mut failures = vec![];
    let mut raws = vec![];
    for row in csv::Reader::from_reader(rdr).deserialize() {
        let row: RunlistRow = row.context("could not parse run list")?;
        match RawDataFile::find_by_night_run(row.night, row.run_id, conn)? {
            Some(raw) => raws.push(raw),
            None => failures.push(format!("{}_{:03}: unknown run", row.night, row.run_id)),
        }
    }

    let rejected = insert_many(&raws, &template, conn);
    let inserted = raws.len() - rejected.len();
    failures.extend(
        rejected
            .into_iter()
            .map(|(raw, err)| format!("{}_{:03}: {}", raw.night, raw.run_id, err)),
    );
    Ok((inserted, failures))
}
