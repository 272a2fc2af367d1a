//! Talking to the cluster scheduler.
//!
//! The submitter and the shutdown logic only ever see a [`ClusterAdapter`].
//! Each backend turns its three operations into the matching scheduler
//! commands.

use std::process::{Command, Stdio};

use crate::config::{Backend, ClusterConfig};
use crate::prelude::*;

mod grid_engine;
mod local;
mod slurm;

pub use self::grid_engine::GridEngineAdapter;
pub use self::local::LocalAdapter;
pub use self::slurm::SlurmAdapter;

/// Names of the environment variables the node executor reads.
pub mod vars {
    /// The ID of the job to run.
    pub const JOB_ID: &str = "ERNA_JOB_ID";
    /// The jar to run.
    pub const JARFILE: &str = "JARFILE";
    /// The XML to run the jar with.
    pub const XMLFILE: &str = "XMLFILE";
    /// The raw data file to process.
    pub const INPUTFILE: &str = "INPUTFILE";
    /// The DRS file to calibrate with.
    pub const DRSFILE: &str = "DRSFILE";
    /// The auxiliary data of the night.
    pub const AUXDIR: &str = "AUXDIR";
    /// Where the output goes.
    pub const OUTPUTDIR: &str = "OUTPUTDIR";
    /// The output file name without extension.
    pub const OUTPUT_BASENAME: &str = "OUTPUT_BASENAME";
    /// The walltime of the job, in minutes.
    pub const WALLTIME: &str = "WALLTIME";
    /// The host of the job monitor.
    pub const SUBMITTER_HOST: &str = "SUBMITTER_HOST";
    /// The port of the job monitor.
    pub const SUBMITTER_PORT: &str = "SUBMITTER_PORT";
    /// The java binary to use.
    pub const JAVA_BIN: &str = "JAVA_BIN";
    /// Variables starting with this are passed to the tool as properties.
    pub const TOOL_PROPERTY_PREFIX: &str = "facttools_";
}

/// Everything a scheduler needs to know to run one node executor.
#[derive(Clone, Debug, PartialEq)]
pub struct JobSubmission {
    /// The name of the cluster job, see [`job_name`].
    pub job_name: String,
    /// The walltime to request, in minutes.
    pub walltime: i32,
    /// Where to send the executor's stdout and stderr.
    pub log_path: PathBuf,
    /// The environment of the node executor.
    pub env: BTreeMap<String, String>,
}

/// What the scheduler says one of our jobs is doing.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ClusterJobState {
    /// Waiting for a node.
    Queued,
    /// Running on a node.
    Running,
    /// Anything else, such as held or in an error state.
    Other(String),
}

/// One of our jobs, as listed by the scheduler.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterJob {
    /// The scheduler's ID for this job.
    pub cluster_id: String,
    /// Our name for this job.
    pub name: String,
    /// The ID of our job in the store.
    pub job_id: i32,
    /// What the job is doing.
    pub state: ClusterJobState,
}

/// A cluster scheduler.
pub trait ClusterAdapter: fmt::Debug + Send + Sync {
    /// Submit a node executor. Returns the scheduler's ID for the new job.
    fn submit(&self, submission: &JobSubmission) -> Result<String>;

    /// List the jobs submitted under our job name prefix.
    fn list_jobs(&self) -> Result<Vec<ClusterJob>>;

    /// Cancel the job named `job_name`.
    fn cancel(&self, job_name: &str) -> Result<()>;
}

/// Count the jobs in `jobs` which are in `state`.
pub fn count_in_state(jobs: &[ClusterJob], state: &ClusterJobState) -> usize {
    jobs.iter().filter(|job| &job.state == state).count()
}

impl ClusterConfig {
    /// Build the adapter for the configured backend.
    pub fn adapter(&self) -> Result<Box<dyn ClusterAdapter>> {
        Ok(match self.backend {
            Backend::Slurm => Box::new(SlurmAdapter::new(self.clone(), self.user()?)),
            Backend::GridEngine => Box::new(GridEngineAdapter::new(self.clone(), self.user()?)),
            Backend::Local => Box::new(LocalAdapter::new(self.clone())),
        })
    }
}

/// The name of the cluster job running job `job_id`.
pub fn job_name(prefix: &str, job_id: i32) -> String {
    format!("{}_{}", prefix, job_id)
}

/// The job ID encoded in `name`, if it's one of ours.
pub fn parse_job_name(prefix: &str, name: &str) -> Option<i32> {
    let id = name.strip_prefix(prefix)?.strip_prefix('_')?;
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    id.parse().ok()
}

/// Describe `cmd` for log and error messages.
fn describe(cmd: &Command) -> String {
    let mut desc = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        desc.push(' ');
        desc.push_str(&arg.to_string_lossy());
    }
    desc
}

/// Run a scheduler command and return its stdout. If it fails, its stderr
/// becomes part of the error.
pub fn run_command(cmd: &mut Command) -> Result<String> {
    let desc = describe(cmd);
    trace!("running {}", desc);
    let output = cmd
        .stdin(Stdio::null())
        .output()
        .with_context(|| format!("error starting {}", desc))?;
    if !output.status.success() {
        return Err(format_err!(
            "{} failed with {}: {}",
            desc,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim(),
        ));
    }
    String::from_utf8(output.stdout).with_context(|| format!("{} printed invalid UTF-8", desc))
}

/// Collect the arguments of `cmd`, for tests.
#[cfg(test)]
fn args_of(cmd: &Command) -> Vec<String> {
    cmd.get_args()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

#[cfg(test)]
fn test_config(backend: Backend) -> ClusterConfig {
    ClusterConfig {
        backend,
        queue: Some("fact_long".to_owned()),
        mail_address: Some("ops@example.org".to_owned()),
        mail_type: "FAIL".to_owned(),
        executable: PathBuf::from("/opt/erna/bin/erna-executor"),
        job_prefix: "erna".to_owned(),
        user: Some("fact".to_owned()),
        extra_args: vec![],
        env: BTreeMap::new(),
        local_slots: None,
    }
}

#[cfg(test)]
fn test_submission() -> JobSubmission {
    let mut env = BTreeMap::new();
    env.insert(vars::JOB_ID.to_owned(), "42".to_owned());
    env.insert(vars::WALLTIME.to_owned(), "90".to_owned());
    JobSubmission {
        job_name: job_name("erna", 42),
        walltime: 90,
        log_path: PathBuf::from("/fact/erna/logs/erna_00000042.log"),
        env,
    }
}
