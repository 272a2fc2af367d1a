//! The `job describe` subcommand.

use erna_common::{config::Config, prelude::*};

use crate::description::render_description;

/// Template for human-readable `describe` output.
const DESCRIBE_TEMPLATE: &str = include_str!("describe.txt.hbs");

// Convert it into a serializable object.
#[derive(Serialize)]
struct Params {
    #[serde(flatten)]
    details: JobDetails,
    job_name: String,
    raw_data_path: PathBuf,
    drs_path: PathBuf,
    log_path: PathBuf,
}

impl Params {
    fn new(details: JobDetails, config: &Config) -> Params {
        let layout = &config.paths;
        Params {
            job_name: details.job.job_name(&config.cluster.job_prefix),
            raw_data_path: layout.raw_data_path(&details.raw_data_file),
            drs_path: layout.drs_path(&details.drs_file),
            log_path: layout.log_path(&config.cluster.job_prefix, details.job.id),
            details,
        }
    }
}

/// The `job describe` subcommand.
pub fn run(id: i32, config: &Config, conn: &mut SqliteConnection) -> Result<()> {
    // Load the data we want to display.
    let details = Job::find(id, conn)?.details(conn)?;
    let params = Params::new(details, config);

    // Print the description.
    print!("{}", render_description(DESCRIBE_TEMPLATE, &params)?);
    Ok(())
}
