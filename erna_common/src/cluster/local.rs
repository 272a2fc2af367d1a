//! Running node executors as child processes, for development and tests.

use std::{
    collections::VecDeque,
    fs::{self, OpenOptions},
    process::{Child, Command, Stdio},
    sync::{Mutex, MutexGuard},
    thread,
};

use super::{parse_job_name, ClusterAdapter, ClusterJob, ClusterJobState, JobSubmission};
use crate::config::ClusterConfig;
use crate::prelude::*;

/// Runs each node executor as a child of the current process. At most
/// `slots` children run at once, and the rest wait their turn as queued
/// jobs.
#[derive(Debug)]
pub struct LocalAdapter {
    config: ClusterConfig,
    slots: usize,
    jobs: Mutex<LocalJobs>,
}

#[derive(Debug, Default)]
struct LocalJobs {
    next_id: u64,
    running: BTreeMap<String, (u64, Child)>,
    waiting: VecDeque<(u64, JobSubmission)>,
}

impl LocalAdapter {
    /// Run the executor described by `config`.
    pub fn new(config: ClusterConfig) -> Self {
        let slots = config.local_slots.unwrap_or_else(|| {
            thread::available_parallelism().map_or(1, |n| n.get())
        });
        LocalAdapter {
            config,
            slots: slots.max(1),
            jobs: Mutex::new(LocalJobs::default()),
        }
    }

    fn jobs(&self) -> Result<MutexGuard<'_, LocalJobs>> {
        self.jobs
            .lock()
            .map_err(|_| format_err!("local job table was poisoned"))
    }

    /// Start an executor for `submission`, logging to its log file.
    #[instrument(skip_all, fields(job_name = %submission.job_name), level = "debug")]
    fn spawn(&self, submission: &JobSubmission) -> Result<Child> {
        if let Some(dir) = submission.log_path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("could not create {}", dir.display()))?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&submission.log_path)
            .with_context(|| format!("could not open {}", submission.log_path.display()))?;
        let log_err = log.try_clone().context("could not duplicate log file handle")?;
        Command::new(&self.config.executable)
            .args(&self.config.extra_args)
            .envs(&self.config.env)
            .envs(&submission.env)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .spawn()
            .with_context(|| format!("could not start {}", self.config.executable.display()))
    }

    /// Forget children which have exited, and start waiting jobs in the
    /// slots they left.
    fn reap_and_start(&self, jobs: &mut LocalJobs) -> Result<()> {
        let mut finished = vec![];
        for (name, (_, child)) in jobs.running.iter_mut() {
            let status = child
                .try_wait()
                .with_context(|| format!("could not check on {}", name))?;
            if let Some(status) = status {
                debug!("local job {} exited with {}", name, status);
                finished.push(name.clone());
            }
        }
        for name in finished {
            jobs.running.remove(&name);
        }

        while jobs.running.len() < self.slots {
            let (id, submission) = match jobs.waiting.pop_front() {
                Some(waiting) => waiting,
                None => break,
            };
            match self.spawn(&submission) {
                Ok(child) => {
                    jobs.running.insert(submission.job_name, (id, child));
                }
                // The executor never runs, so it will never report. Its job
                // stays queued until an operator looks at it.
                Err(err) => error!(
                    "could not start local job {}: {}",
                    submission.job_name,
                    err.display_causes()
                ),
            }
        }
        Ok(())
    }
}

impl ClusterAdapter for LocalAdapter {
    fn submit(&self, submission: &JobSubmission) -> Result<String> {
        let mut jobs = self.jobs()?;
        self.reap_and_start(&mut jobs)?;
        jobs.next_id += 1;
        let id = jobs.next_id;
        if jobs.running.len() < self.slots && jobs.waiting.is_empty() {
            let child = self.spawn(submission)?;
            jobs.running.insert(submission.job_name.clone(), (id, child));
        } else {
            debug!("all {} local slots busy, queueing {}", self.slots, submission.job_name);
            jobs.waiting.push_back((id, submission.clone()));
        }
        Ok(id.to_string())
    }

    fn list_jobs(&self) -> Result<Vec<ClusterJob>> {
        let mut jobs = self.jobs()?;
        self.reap_and_start(&mut jobs)?;

        let running = jobs
            .running
            .iter()
            .map(|(name, (id, _))| (*id, name, ClusterJobState::Running));
        let waiting = jobs
            .waiting
            .iter()
            .map(|(id, submission)| (*id, &submission.job_name, ClusterJobState::Queued));
        Ok(running
            .chain(waiting)
            .filter_map(|(id, name, state)| {
                Some(ClusterJob {
                    cluster_id: id.to_string(),
                    name: name.clone(),
                    job_id: parse_job_name(&self.config.job_prefix, name)?,
                    state,
                })
            })
            .collect())
    }

    fn cancel(&self, job_name: &str) -> Result<()> {
        let mut jobs = self.jobs()?;
        let waiting_len = jobs.waiting.len();
        jobs.waiting.retain(|(_, submission)| submission.job_name != job_name);
        if jobs.waiting.len() < waiting_len {
            return Ok(());
        }

        match jobs.running.remove(job_name) {
            Some((_, mut child)) => {
                child
                    .kill()
                    .with_context(|| format!("could not kill {}", job_name))?;
                child
                    .wait()
                    .with_context(|| format!("could not wait for {}", job_name))?;
                Ok(())
            }
            None => Err(format_err!("no local job named {}", job_name)),
        }
    }
}
