//! The `job` subcommand.

use erna_common::{
    admission::{DEFAULT_PRIORITY, DEFAULT_WALLTIME},
    config::Config,
    prelude::*,
};

mod describe;
mod ls;
mod reset_walltime;
mod submit;

/// The `job` subcommand.
#[derive(Debug, clap::Subcommand)]
pub enum Opt {
    /// Create jobs for a list of runs.
    Submit {
        /// A CSV file with the columns night and run_id.
        runlist: PathBuf,
        /// The tool version to run.
        #[arg(long)]
        jar: String,
        /// The name of the XML to run it with.
        #[arg(long)]
        xml: String,
        /// Jobs with lower values are submitted first.
        #[arg(long, default_value_t = DEFAULT_PRIORITY)]
        priority: i32,
        /// The walltime to request, in minutes.
        #[arg(
            long,
            default_value_t = DEFAULT_WALLTIME,
            value_parser = clap::value_parser!(i32).range(1..),
        )]
        walltime: i32,
        /// Calibrate with the last DRS run before each run, instead of the
        /// closest one.
        #[arg(long)]
        before: bool,
    },

    /// List jobs.
    Ls {
        /// Only list jobs with this status.
        #[arg(long)]
        status: Option<ProcessingState>,
    },

    /// Describe a specific job.
    Describe {
        /// The ID of the job to describe.
        id: i32,
    },

    /// Give every job which ran out of time more time, and run it again.
    ResetWalltime {
        /// What to multiply the old walltime with.
        #[arg(long)]
        factor: f64,
    },
}

/// Run the `job` subcommand.
pub fn run(opt: &Opt, config: &Config, store: &Store) -> Result<()> {
    let mut conn = store.conn()?;
    match opt {
        Opt::Submit {
            runlist,
            jar,
            xml,
            priority,
            walltime,
            before,
        } => {
            let options = submit::SubmitOptions {
                jar: jar.clone(),
                xml: xml.clone(),
                priority: *priority,
                walltime: *walltime,
                prefer_closest: !before,
            };
            submit::run(runlist, &options, &mut conn)
        }
        Opt::Ls { status } => ls::run(*status, &mut conn),
        Opt::Describe { id } => describe::run(*id, config, &mut conn),
        Opt::ResetWalltime { factor } => reset_walltime::run(*factor, &mut conn),
    }
}
