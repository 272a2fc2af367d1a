//! Grid Engine: `qsub`, `qstat` and `qdel`.

use std::process::Command;

use super::{
    parse_job_name, run_command, ClusterAdapter, ClusterJob, ClusterJobState, JobSubmission,
};
use crate::config::ClusterConfig;
use crate::prelude::*;

/// Submits node executors with `qsub`.
#[derive(Debug)]
pub struct GridEngineAdapter {
    config: ClusterConfig,
    user: String,
}

impl GridEngineAdapter {
    /// Submit as described by `config`, listing the jobs of `user`.
    pub fn new(config: ClusterConfig, user: String) -> Self {
        GridEngineAdapter { config, user }
    }

    /// The `qsub` command for `submission`. The executor's environment is
    /// passed with `-v`, which can't carry values containing commas.
    fn submit_command(&self, submission: &JobSubmission) -> Result<Command> {
        let mut env = vec![];
        for (key, value) in self.config.env.iter().chain(submission.env.iter()) {
            if value.contains(',') {
                return Err(format_err!("cannot pass {}={:?} to qsub -v", key, value));
            }
            env.push(format!("{}={}", key, value));
        }

        let log_path = submission.log_path.display().to_string();
        let mut cmd = Command::new("qsub");
        cmd.args(["-terse", "-N", submission.job_name.as_str()]);
        if let Some(queue) = &self.config.queue {
            cmd.args(["-q", queue.as_str()]);
        }
        if let Some(mail_address) = &self.config.mail_address {
            cmd.args(["-M", mail_address.as_str(), "-m", mail_options(&self.config.mail_type)]);
        }
        cmd.args(["-b", "yes", "-o", log_path.as_str(), "-e", log_path.as_str()])
            .arg("-l")
            .arg(format!(
                "h_rt={:02}:{:02}:00",
                submission.walltime / 60,
                submission.walltime % 60,
            ))
            .arg("-v")
            .arg(env.join(","))
            .args(&self.config.extra_args)
            .arg(&self.config.executable);
        Ok(cmd)
    }
}

impl ClusterAdapter for GridEngineAdapter {
    #[instrument(skip_all, fields(job_name = %submission.job_name), level = "debug")]
    fn submit(&self, submission: &JobSubmission) -> Result<String> {
        let stdout = run_command(&mut self.submit_command(submission)?)?;
        let id = stdout.trim();
        if id.is_empty() {
            return Err(format_err!("qsub did not print a job id for {}", submission.job_name));
        }
        Ok(id.to_owned())
    }

    fn list_jobs(&self) -> Result<Vec<ClusterJob>> {
        // Plain `qstat` truncates job names, but `-r` adds the full name.
        let stdout = run_command(Command::new("qstat").args(["-u", self.user.as_str(), "-r"]))?;
        Ok(parse_qstat(&self.config.job_prefix, &stdout))
    }

    fn cancel(&self, job_name: &str) -> Result<()> {
        run_command(Command::new("qdel").arg(job_name))?;
        Ok(())
    }
}

/// Translate SLURM-style mail types into `qsub -m` letters.
fn mail_options(mail_type: &str) -> &str {
    match mail_type {
        "FAIL" => "a",
        "BEGIN" => "b",
        "END" => "e",
        "ALL" => "bea",
        "NONE" => "n",
        other => other,
    }
}

/// Parse `qstat -r`, keeping only jobs named with `prefix`.
fn parse_qstat(prefix: &str, stdout: &str) -> Vec<ClusterJob> {
    let mut rows: Vec<(String, String, String)> = vec![];
    for line in stdout.lines() {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        if let Some(full_name) = line.trim().strip_prefix("Full jobname:") {
            if let Some(row) = rows.last_mut() {
                row.1 = full_name.trim().to_owned();
            }
        } else if fields.len() >= 5 && fields[0].bytes().all(|b| b.is_ascii_digit()) {
            rows.push((fields[0].to_owned(), fields[2].to_owned(), fields[4].to_owned()));
        }
    }

    rows.into_iter()
        .filter_map(|(cluster_id, name, state)| {
            let job_id = parse_job_name(prefix, &name)?;
            let state = if state.contains('E') {
                ClusterJobState::Other(state)
            } else if state.contains('r') || state.contains('t') {
                ClusterJobState::Running
            } else if state.contains("qw") {
                ClusterJobState::Queued
            } else {
                ClusterJobState::Other(state)
            };
            Some(ClusterJob {
                cluster_id,
                name,
                job_id,
                state,
            })
        })
        .collect()
}
