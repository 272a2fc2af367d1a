//! A background thread which hands pending jobs to the cluster.
//!
//! We only store state in the job store, and we assume that the cluster may
//! be slow or unavailable at any time. Every poll starts from scratch: we ask
//! the scheduler how busy it is, fill the free slots with the most urgent
//! pending jobs, and go back to sleep.

use crossbeam::channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::{
    fs,
    panic::{catch_unwind, AssertUnwindSafe},
    process,
    sync::Arc,
    thread,
    time::Duration,
};

use erna_common::{
    cast,
    cluster::{count_in_state, vars, ClusterAdapter, ClusterJobState, JobSubmission},
    config::{Config, ShutdownConfig},
    paths::{output_basename, Layout},
    prelude::*,
    tracing,
};

/// Submits pending jobs to the cluster.
#[derive(Debug)]
pub struct Submitter {
    store: Store,
    adapter: Arc<dyn ClusterAdapter>,
    layout: Layout,
    job_prefix: String,
    monitor_host: String,
    monitor_port: u16,
    interval: Duration,
    max_queued_jobs: usize,
    retry_max_elapsed: Duration,
}

impl Submitter {
    /// Create a submitter using the settings from `config`.
    pub fn new(config: &Config, store: Store, adapter: Arc<dyn ClusterAdapter>) -> Self {
        Submitter {
            store,
            adapter,
            layout: config.paths.clone(),
            job_prefix: config.cluster.job_prefix.clone(),
            monitor_host: config.monitor.host.clone(),
            monitor_port: config.monitor.port,
            interval: config.submitter.interval,
            max_queued_jobs: config.submitter.max_queued_jobs,
            retry_max_elapsed: config.submitter.retry_max_elapsed,
        }
    }

    /// Spawn a thread and run the submitter in it until `stop` is closed.
    #[tracing::instrument(skip_all, level = "trace")]
    pub fn start(self, stop: Receiver<()>) -> Result<thread::JoinHandle<()>> {
        let builder = thread::Builder::new().name("submitter".to_owned());
        builder
            .spawn(move || self.run_wrapper(stop))
            .context("could not create submitter thread")
    }

    /// Run the submitter, and abort if we catch any panics.
    fn run_wrapper(self, stop: Receiver<()>) {
        // A submitter which silently died would leave the orchestrator
        // looking healthy while nothing gets submitted, so take the whole
        // process down instead.
        if let Err(err) = catch_unwind(AssertUnwindSafe(|| self.run(&stop))) {
            let msg = if let Some(msg) = err.downcast_ref::<&str>() {
                *msg
            } else if let Some(msg) = err.downcast_ref::<String>() {
                msg
            } else {
                "an unknown panic occurred"
            };
            error!("SUBMITTER PANIC, aborting: {}", msg);
            eprintln!("SUBMITTER PANIC, aborting: {}", msg);
            process::abort();
        }
    }

    /// Poll until `stop` is closed or receives a message.
    fn run(&self, stop: &Receiver<()>) {
        info!(
            "submitter started, polling every {:?} for up to {} queued jobs",
            self.interval, self.max_queued_jobs,
        );
        loop {
            // All errors are retried on the next poll. If the store or the
            // scheduler is down, we'll pick up again once it's back.
            if let Err(err) = self.process_pending_jobs(stop) {
                error!("error submitting jobs (will retry later): {}", err.display_causes());
            }
            match stop.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("submitter stopped");
    }

    /// Fill the free slots in the cluster queue with pending jobs. Returns the
    /// number of jobs submitted. We stop early once `stop` is closed or
    /// receives a message.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn process_pending_jobs(&self, stop: &Receiver<()>) -> Result<usize> {
        let cluster_jobs = self.adapter.list_jobs()?;
        let running = count_in_state(&cluster_jobs, &ClusterJobState::Running);
        let queued = count_in_state(&cluster_jobs, &ClusterJobState::Queued);

        let mut conn = self.store.conn()?;
        let pending = Job::count_with_status(ProcessingState::Inserted, &mut conn)?;
        info!(
            "cluster: {} running, {} queued; store: {} pending",
            running, queued, pending
        );

        let capacity = self.max_queued_jobs.saturating_sub(queued);
        if capacity == 0 || pending == 0 {
            return Ok(0);
        }

        let jobs = Job::pending(cast::i64(capacity)?, &mut conn)?;
        drop(conn);
        let mut submitted = 0;
        for job in jobs {
            if stop_requested(stop) {
                info!("stopping, leaving the remaining jobs pending");
                break;
            }
            let job_id = job.id;
            match self.submit_job(job) {
                Ok(true) => submitted += 1,
                Ok(false) => {}
                Err(err) => error!("could not submit job {}: {}", job_id, err.display_causes()),
            }
        }
        Ok(submitted)
    }

    /// Queue `job` in the store and hand it to the cluster. If the cluster
    /// won't take it, the job is marked as failed and we return `false`.
    fn submit_job(&self, mut job: Job) -> Result<bool> {
        // Mark the job first, so a quick executor can't report `running`
        // before we're done here.
        self.store
            .retry_transient(self.retry_max_elapsed, |conn| job.mark_as_queued(conn))?;
        let dispatched = self
            .store
            .retry_transient(self.retry_max_elapsed, |conn| self.dispatch(&job, conn));
        match dispatched {
            Ok(cluster_id) => {
                info!("submitted job {} as cluster job {}", job.id, cluster_id);
                Ok(true)
            }
            Err(err) => {
                error!(
                    "could not submit job {}, marking as failed: {}",
                    job.id,
                    err.display_causes(),
                );
                self.store
                    .retry_transient(self.retry_max_elapsed, |conn| job.mark_as_failed(conn))
                    .context("could not mark job as failed, it stays queued")?;
                Ok(false)
            }
        }
    }

    /// Put the files `job` needs in place and hand it to the scheduler.
    fn dispatch(&self, job: &Job, conn: &mut SqliteConnection) -> Result<String> {
        let details = job.details(conn)?;
        let jar_path = self.layout.materialize_jar(&details.jar, conn)?;
        let xml_path = self.layout.materialize_xml(&details.jar, &details.xml)?;
        let submission = self.build_submission(&details, &jar_path, &xml_path);
        for dir in [
            submission.log_path.parent(),
            Some(Path::new(&submission.env[vars::OUTPUTDIR])),
        ]
        .into_iter()
        .flatten()
        {
            fs::create_dir_all(dir).with_context(|| format!("could not create {}", dir.display()))?;
        }
        self.adapter.submit(&submission)
    }

    /// Describe the cluster job running `details`.
    pub fn build_submission(
        &self,
        details: &JobDetails,
        jar_path: &Path,
        xml_path: &Path,
    ) -> JobSubmission {
        let JobDetails {
            job,
            raw_data_file,
            drs_file,
            jar,
            xml,
        } = details;
        let night = raw_data_file.night;
        fn path(p: &Path) -> String {
            p.display().to_string()
        }

        let mut env = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            env.insert(key.to_owned(), value);
        };
        set(vars::JOB_ID, job.id.to_string());
        set(vars::JARFILE, path(jar_path));
        set(vars::XMLFILE, path(xml_path));
        set(vars::INPUTFILE, path(&self.layout.raw_data_path(raw_data_file)));
        set(vars::DRSFILE, path(&self.layout.drs_path(drs_file)));
        set(vars::AUXDIR, path(&self.layout.aux_dir(night)));
        set(vars::OUTPUTDIR, path(&self.layout.output_dir(night, jar, xml)));
        set(vars::OUTPUT_BASENAME, output_basename(raw_data_file, jar, xml));
        set(vars::WALLTIME, job.walltime.to_string());
        set(vars::SUBMITTER_HOST, self.monitor_host.clone());
        set(vars::SUBMITTER_PORT, self.monitor_port.to_string());

        JobSubmission {
            job_name: job.job_name(&self.job_prefix),
            walltime: job.walltime,
            log_path: self.layout.log_path(&self.job_prefix, job.id),
            env,
        }
    }
}

/// Has the owner of `stop` asked us to stop? Doesn't consume a pending
/// message, so the poll loop sees it too.
fn stop_requested(stop: &Receiver<()>) -> bool {
    if !stop.is_empty() {
        return true;
    }
    match stop.try_recv() {
        Err(TryRecvError::Empty) => false,
        Ok(()) | Err(TryRecvError::Disconnected) => true,
    }
}

/// Clean up our cluster jobs before the orchestrator exits. Queued jobs are
/// cancelled and put back into the store's queue. Running jobs are either
/// cancelled too, or we wait until the cluster says they're done.
#[tracing::instrument(skip_all, level = "debug")]
pub fn drain(
    store: &Store,
    adapter: &dyn ClusterAdapter,
    job_prefix: &str,
    shutdown: &ShutdownConfig,
) -> Result<()> {
    let cancelled = cancel_and_reset(store, adapter, job_prefix, ProcessingState::Queued)?;
    info!("cancelled {} queued jobs", cancelled);

    if shutdown.cancel_running {
        let cancelled = cancel_and_reset(store, adapter, job_prefix, ProcessingState::Running)?;
        info!("cancelled {} running jobs", cancelled);
        return Ok(());
    }

    loop {
        let jobs = adapter.list_jobs()?;
        let running = count_in_state(&jobs, &ClusterJobState::Running);
        if running == 0 {
            return Ok(());
        }
        info!("waiting for {} running jobs to finish", running);
        thread::sleep(shutdown.poll_interval);
    }
}

/// Cancel every job in `status` and reset it to `inserted`. Returns the
/// number of jobs reset.
fn cancel_and_reset(
    store: &Store,
    adapter: &dyn ClusterAdapter,
    job_prefix: &str,
    status: ProcessingState,
) -> Result<usize> {
    let mut conn = store.conn()?;
    let mut reset = 0;
    for job in Job::with_status(status, &mut conn)? {
        let name = job.job_name(job_prefix);
        // The job may have left the cluster on its own in the meantime.
        if let Err(err) = adapter.cancel(&name) {
            warn!("could not cancel {}: {}", name, err.display_causes());
        }
        if reset_cancelled(job.id, &mut conn)? {
            reset += 1;
        }
    }
    Ok(reset)
}

/// Put a job we just cancelled back into the queue. Its executor may have
/// reported in before the cancel reached it, so we look at the job's current
/// state instead of the one we cancelled it in. Returns `false` if the job
/// had already finished.
fn reset_cancelled(job_id: i32, conn: &mut SqliteConnection) -> Result<bool> {
    // Jobs only ever move forward, so this ends once the job is reset or
    // finished.
    loop {
        let mut job = Job::find(job_id, conn)?;
        let status = job.status;
        if !matches!(status, ProcessingState::Queued | ProcessingState::Running) {
            warn!("job {} finished as {} before we could reset it", job_id, status);
            return Ok(false);
        }
        if job.reset_to_inserted(status, conn)? {
            return Ok(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEnv;
    use crossbeam::channel;

    #[test]
    fn capacity_limits_submissions() {
        let env = TestEnv::new(5);
        env.adapter.set_cluster_jobs(2, 0);
        for run_id in 1..=10 {
            env.insert_job(20230101, run_id, 5);
        }

        let submitter = env.submitter();
        assert_eq!(submitter.process_pending_jobs(&channel::never()).unwrap(), 3);
        assert_eq!(env.adapter.submitted().len(), 3);
        let mut conn = env.store.conn().unwrap();
        assert_eq!(Job::count_with_status(ProcessingState::Queued, &mut conn).unwrap(), 3);
        assert_eq!(Job::count_with_status(ProcessingState::Inserted, &mut conn).unwrap(), 7);
    }

    #[test]
    fn full_queue_submits_nothing() {
        let env = TestEnv::new(5);
        env.adapter.set_cluster_jobs(7, 0);
        env.insert_job(20230101, 1, 5);
        assert_eq!(env.submitter().process_pending_jobs(&channel::never()).unwrap(), 0);
        assert!(env.adapter.submitted().is_empty());
    }

    #[test]
    fn urgent_and_recent_jobs_go_first() {
        let env = TestEnv::new(5);
        let a = env.insert_job(20230101, 1, 5);
        let b = env.insert_job(20230101, 2, 1);
        let c = env.insert_job(20230301, 3, 5);

        env.submitter().process_pending_jobs(&channel::never()).unwrap();
        let names = env
            .adapter
            .submitted()
            .into_iter()
            .map(|s| s.job_name)
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![format!("erna_{}", b.id), format!("erna_{}", c.id), format!("erna_{}", a.id)],
        );
    }

    #[test]
    fn submissions_carry_the_executor_environment() {
        let env = TestEnv::new(5);
        let job = env.insert_job(20230101, 5, 5);
        env.submitter().process_pending_jobs(&channel::never()).unwrap();

        let submission = env.adapter.submitted().remove(0);
        let erna_dir = env.config.paths.erna_dir.clone();
        assert_eq!(submission.walltime, 180);
        assert_eq!(
            submission.log_path,
            erna_dir.join(format!("logs/erna_{:08}.log", job.id)),
        );
        assert!(submission.log_path.parent().unwrap().is_dir());

        let vars = &submission.env;
        assert_eq!(vars[vars::JOB_ID], job.id.to_string());
        let night_dir = env.config.paths.raw_dir.join("2023/01/01");
        assert_eq!(
            vars[vars::INPUTFILE],
            night_dir.join("20230101_005.fits.fz").display().to_string(),
        );
        assert_eq!(
            vars[vars::DRSFILE],
            night_dir.join("20230101_003.drs.fits.gz").display().to_string(),
        );
        assert_eq!(vars[vars::OUTPUT_BASENAME], "20230101_005_1.0.0_std");
        assert_eq!(vars[vars::SUBMITTER_PORT], "12700");
        assert!(Path::new(&vars[vars::OUTPUTDIR]).is_dir());
        assert_eq!(fs::read(&vars[vars::JARFILE]).unwrap(), vec![0xca, 0xfe]);
        assert_eq!(fs::read_to_string(&vars[vars::XMLFILE]).unwrap(), "<container/>");
    }

    #[test]
    fn dispatch_failures_mark_the_job_failed() {
        let env = TestEnv::new(5);
        env.adapter.fail_submissions();
        let job = env.insert_job(20230101, 1, 5);
        let other = env.insert_job(20230101, 2, 5);

        assert_eq!(env.submitter().process_pending_jobs(&channel::never()).unwrap(), 0);
        let mut conn = env.store.conn().unwrap();
        assert_eq!(Job::find(job.id, &mut conn).unwrap().status, ProcessingState::Failed);
        assert_eq!(Job::find(other.id, &mut conn).unwrap().status, ProcessingState::Failed);
    }

    #[test]
    fn one_refused_job_does_not_hold_up_the_others() {
        let env = TestEnv::new(5);
        let first = env.insert_job(20230101, 1, 1);
        let refused = env.insert_job(20230101, 2, 2);
        let last = env.insert_job(20230101, 3, 3);
        env.adapter.fail_submission_of(&format!("erna_{}", refused.id));

        assert_eq!(env.submitter().process_pending_jobs(&channel::never()).unwrap(), 2);
        let mut conn = env.store.conn().unwrap();
        assert_eq!(Job::find(first.id, &mut conn).unwrap().status, ProcessingState::Queued);
        assert_eq!(Job::find(refused.id, &mut conn).unwrap().status, ProcessingState::Failed);
        assert_eq!(Job::find(last.id, &mut conn).unwrap().status, ProcessingState::Queued);
    }

    #[test]
    fn stopping_mid_poll_leaves_the_rest_pending() {
        let env = TestEnv::new(5);
        for run_id in 1..=4 {
            env.insert_job(20230101, run_id, 5);
        }
        let (stop_tx, stop_rx) = channel::bounded(1);
        env.adapter.close_after_submissions(2, stop_tx);

        assert_eq!(env.submitter().process_pending_jobs(&stop_rx).unwrap(), 2);
        assert_eq!(env.adapter.submitted().len(), 2);
        let mut conn = env.store.conn().unwrap();
        assert_eq!(Job::count_with_status(ProcessingState::Queued, &mut conn).unwrap(), 2);
        assert_eq!(Job::count_with_status(ProcessingState::Inserted, &mut conn).unwrap(), 2);
    }

    #[test]
    fn stop_messages_are_seen_but_not_consumed() {
        let (stop_tx, stop_rx) = channel::bounded(1);
        assert!(!stop_requested(&stop_rx));
        stop_tx.send(()).unwrap();
        assert!(stop_requested(&stop_rx));
        assert!(stop_requested(&stop_rx));
        assert_eq!(stop_rx.try_recv(), Ok(()));
    }

    #[test]
    fn scheduler_outages_are_errors_for_this_poll_only() {
        let env = TestEnv::new(5);
        env.insert_job(20230101, 1, 5);
        env.adapter.fail_listing(true);
        assert!(env.submitter().process_pending_jobs(&channel::never()).is_err());
        env.adapter.fail_listing(false);
        assert_eq!(env.submitter().process_pending_jobs(&channel::never()).unwrap(), 1);
    }

    #[test]
    fn submitter_thread_stops_when_asked() {
        let env = TestEnv::new(5);
        let (stop_tx, stop_rx) = crossbeam::channel::bounded(1);
        let handle = env.submitter().start(stop_rx).unwrap();
        drop(stop_tx);
        handle.join().unwrap();
    }

    #[test]
    fn draining_resets_queued_and_cancelled_running_jobs() {
        let env = TestEnv::new(5);
        let queued = env.insert_job(20230101, 1, 5);
        let running = env.insert_job(20230101, 2, 5);
        let untouched = env.insert_job(20230101, 3, 5);
        {
            let mut conn = env.store.conn().unwrap();
            let mut q = Job::find(queued.id, &mut conn).unwrap();
            q.mark_as_queued(&mut conn).unwrap();
            let mut r = Job::find(running.id, &mut conn).unwrap();
            r.mark_as_queued(&mut conn).unwrap();
            Job::apply_status_report(
                &erna_common::status::StatusReport::new(r.id, ProcessingState::Running),
                &mut conn,
            )
            .unwrap();
        }

        let shutdown = ShutdownConfig {
            cancel_running: true,
            poll_interval: Duration::from_millis(10),
        };
        drain(&env.store, env.adapter.as_ref(), "erna", &shutdown).unwrap();

        let mut cancelled = env.adapter.cancelled();
        cancelled.sort();
        let mut expected = vec![format!("erna_{}", queued.id), format!("erna_{}", running.id)];
        expected.sort();
        assert_eq!(cancelled, expected);
        let mut conn = env.store.conn().unwrap();
        for job in [&queued, &running, &untouched] {
            assert_eq!(Job::find(job.id, &mut conn).unwrap().status, ProcessingState::Inserted);
        }
    }

    #[test]
    fn draining_resets_jobs_which_started_while_being_cancelled() {
        let env = TestEnv::new(5);
        let job = env.insert_job(20230101, 1, 5);
        {
            let mut conn = env.store.conn().unwrap();
            Job::find(job.id, &mut conn).unwrap().mark_as_queued(&mut conn).unwrap();
        }
        env.adapter.start_jobs_on_cancel(env.store.clone());

        let shutdown = ShutdownConfig {
            cancel_running: false,
            poll_interval: Duration::from_millis(10),
        };
        drain(&env.store, env.adapter.as_ref(), "erna", &shutdown).unwrap();

        assert_eq!(env.adapter.cancelled(), vec![format!("erna_{}", job.id)]);
        let mut conn = env.store.conn().unwrap();
        assert_eq!(Job::find(job.id, &mut conn).unwrap().status, ProcessingState::Inserted);
    }

    #[test]
    fn draining_waits_for_running_jobs() {
        let env = TestEnv::new(5);
        env.adapter.set_cluster_jobs(0, 1);
        let adapter = env.adapter.clone();
        let finisher = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            adapter.set_cluster_jobs(0, 0);
        });

        let shutdown = ShutdownConfig {
            cancel_running: false,
            poll_interval: Duration::from_millis(10),
        };
        drain(&env.store, env.adapter.as_ref(), "erna", &shutdown).unwrap();
        finisher.join().unwrap();
        assert!(env.adapter.list_jobs().unwrap().is_empty());
    }
}
