//! SLURM: `sbatch`, `squeue` and `scancel`.

use std::process::Command;

use super::{
    parse_job_name, run_command, ClusterAdapter, ClusterJob, ClusterJobState, JobSubmission,
};
use crate::config::ClusterConfig;
use crate::prelude::*;

/// Submits node executors with `sbatch`.
#[derive(Debug)]
pub struct SlurmAdapter {
    config: ClusterConfig,
    user: String,
}

impl SlurmAdapter {
    /// Submit as described by `config`, listing the jobs of `user`.
    pub fn new(config: ClusterConfig, user: String) -> Self {
        SlurmAdapter { config, user }
    }

    /// The `sbatch` command for `submission`. The executor inherits the
    /// environment of `sbatch`, so that's where we put its variables.
    fn submit_command(&self, submission: &JobSubmission) -> Command {
        let log_path = submission.log_path.display().to_string();
        let mut cmd = Command::new("sbatch");
        cmd.arg("--parsable")
            .args(["-J", submission.job_name.as_str()]);
        if let Some(queue) = &self.config.queue {
            cmd.args(["-p", queue.as_str()]);
        }
        if let Some(mail_address) = &self.config.mail_address {
            cmd.arg(format!("--mail-user={}", mail_address));
        }
        cmd.arg(format!("--mail-type={}", self.config.mail_type))
            .arg(format!("--time={}", submission.walltime))
            .args(["-o", log_path.as_str(), "-e", log_path.as_str()])
            .arg("--export=ALL")
            .args(&self.config.extra_args)
            .arg(&self.config.executable)
            .envs(&self.config.env)
            .envs(&submission.env);
        cmd
    }

    fn list_command(&self) -> Command {
        let mut cmd = Command::new("squeue");
        cmd.args(["-u", self.user.as_str(), "-h", "-o", "%i|%j|%T"]);
        cmd
    }
}

impl ClusterAdapter for SlurmAdapter {
    #[instrument(skip_all, fields(job_name = %submission.job_name), level = "debug")]
    fn submit(&self, submission: &JobSubmission) -> Result<String> {
        let stdout = run_command(&mut self.submit_command(submission))?;
        // `--parsable` prints `<id>` or `<id>;<cluster>`.
        let id = stdout.trim().split(';').next().unwrap_or_default();
        if id.is_empty() {
            return Err(format_err!("sbatch did not print a job id for {}", submission.job_name));
        }
        Ok(id.to_owned())
    }

    fn list_jobs(&self) -> Result<Vec<ClusterJob>> {
        let stdout = run_command(&mut self.list_command())?;
        Ok(parse_squeue(&self.config.job_prefix, &stdout))
    }

    fn cancel(&self, job_name: &str) -> Result<()> {
        run_command(Command::new("scancel").args(["-u", self.user.as_str(), "-n", job_name]))?;
        Ok(())
    }
}

/// Parse `squeue -h -o "%i|%j|%T"`, keeping only jobs named with `prefix`.
fn parse_squeue(prefix: &str, stdout: &str) -> Vec<ClusterJob> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.trim().splitn(3, '|');
            let cluster_id = fields.next()?;
            let name = fields.next()?;
            let state = fields.next()?;
            let job_id = parse_job_name(prefix, name)?;
            let state = match state {
                "PENDING" | "REQUEUED" | "REQUEUE_HOLD" => ClusterJobState::Queued,
                "RUNNING" | "CONFIGURING" | "COMPLETING" => ClusterJobState::Running,
                other => ClusterJobState::Other(other.to_owned()),
            };
            Some(ClusterJob {
                cluster_id: cluster_id.to_owned(),
                name: name.to_owned(),
                job_id,
                state,
            })
        })
        .collect()
}
