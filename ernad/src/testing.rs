//! Helpers shared by our tests.

use crossbeam::channel::Sender;
use std::sync::{Arc, Mutex};

use erna_common::{
    admission::{insert_job, JobTemplate},
    cluster::{parse_job_name, ClusterAdapter, ClusterJob, ClusterJobState, JobSubmission},
    config::Config,
    prelude::*,
    status::StatusReport,
};

use crate::submitter::Submitter;

/// A store, a config pointing into a temporary directory, and a fake
/// cluster.
pub struct TestEnv {
    pub store: Store,
    pub config: Config,
    pub adapter: Arc<FakeAdapter>,
    _dir: tempfile::TempDir,
}

impl TestEnv {
    pub fn new(max_queued_jobs: usize) -> TestEnv {
        let dir = tempfile::tempdir().expect("could not create temp dir");
        let root = dir.path().display();
        let config = Config::from_yaml(&format!(
            r#"
submitter:
  interval: 10ms
  max_queued_jobs: {max_queued_jobs}
  retry_max_elapsed: 1s
monitor:
  retry_max_elapsed: 1s
cluster:
  backend: local
paths:
  raw_dir: {root}/raw
  aux_dir: {root}/aux
  erna_dir: {root}/erna
"#,
        ))
        .expect("invalid test config");
        let url = dir.path().join("erna.sqlite");
        let store =
            Store::open_with_pool_size(url.to_str().unwrap(), 4).expect("could not open store");
        TestEnv {
            store,
            config,
            adapter: Arc::new(FakeAdapter::default()),
            _dir: dir,
        }
    }

    pub fn submitter(&self) -> Submitter {
        Submitter::new(&self.config, self.store.clone(), self.adapter.clone())
    }

    /// Insert a job for raw data run `run_id` of `night`, calibrated with DRS
    /// run 3 of the same night.
    pub fn insert_job(&self, night: i32, run_id: i32, priority: i32) -> Job {
        let mut conn = self.store.conn().unwrap();
        let night = Night::from_int(night).unwrap();
        let raw = NewRawDataFile {
            night,
            run_id,
            available: true,
            roi: 300,
            run_type_key: 1,
            run_type_name: "data".to_owned(),
        }
        .insert(&mut conn)
        .unwrap();
        NewDrsFile::upsert_all(
            &[NewDrsFile {
                night,
                run_id: 3,
                available: true,
                roi: 300,
                drs_step: 2,
            }],
            &mut conn,
        )
        .unwrap();
        let jar = Jar::find_by_version("1.0.0", &mut conn).unwrap_or_else(|_| {
            NewJar {
                version: "1.0.0".to_owned(),
                jar_file: vec![0xca, 0xfe],
            }
            .insert(&mut conn)
            .unwrap()
        });
        let xml = Xml::find_by_name_and_jar("std", &jar, &mut conn).unwrap_or_else(|_| {
            NewXml {
                name: "std".to_owned(),
                content: "<container/>".to_owned(),
                comment: String::new(),
                jar_id: jar.id,
            }
            .insert(&mut conn)
            .unwrap()
        });
        let template = JobTemplate {
            priority,
            ..JobTemplate::new(&jar, &xml)
        };
        insert_job(&raw, &template, &mut conn).unwrap()
    }
}

#[derive(Debug, Default)]
struct FakeCluster {
    queued: usize,
    running: usize,
    submitted: Vec<JobSubmission>,
    cancelled: Vec<String>,
    fail_submissions: bool,
    fail_submission_of: Option<String>,
    fail_listing: bool,
    close_after: Option<(usize, Sender<()>)>,
    start_on_cancel: Option<Store>,
}

/// A cluster which only records what we ask it to do.
#[derive(Debug, Default)]
pub struct FakeAdapter {
    cluster: Mutex<FakeCluster>,
}

impl FakeAdapter {
    /// Pretend other jobs of ours are on the cluster.
    pub fn set_cluster_jobs(&self, queued: usize, running: usize) {
        let mut cluster = self.cluster.lock().unwrap();
        cluster.queued = queued;
        cluster.running = running;
    }

    pub fn fail_submissions(&self) {
        self.cluster.lock().unwrap().fail_submissions = true;
    }

    /// Refuse only the job called `job_name`.
    pub fn fail_submission_of(&self, job_name: &str) {
        self.cluster.lock().unwrap().fail_submission_of = Some(job_name.to_owned());
    }

    /// Drop `stop` once `count` jobs have been submitted.
    pub fn close_after_submissions(&self, count: usize, stop: Sender<()>) {
        self.cluster.lock().unwrap().close_after = Some((count, stop));
    }

    /// Report every job we're asked to cancel as `running` first, as if its
    /// executor had started just before the cancel arrived.
    pub fn start_jobs_on_cancel(&self, store: Store) {
        self.cluster.lock().unwrap().start_on_cancel = Some(store);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.cluster.lock().unwrap().fail_listing = fail;
    }

    pub fn submitted(&self) -> Vec<JobSubmission> {
        self.cluster.lock().unwrap().submitted.clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cluster.lock().unwrap().cancelled.clone()
    }
}

impl ClusterAdapter for FakeAdapter {
    fn submit(&self, submission: &JobSubmission) -> Result<String> {
        let mut cluster = self.cluster.lock().unwrap();
        let refused = cluster.fail_submission_of.as_ref() == Some(&submission.job_name);
        if cluster.fail_submissions || refused {
            return Err(format_err!("sbatch: error: invalid partition specified"));
        }
        cluster.submitted.push(submission.clone());
        let submitted = cluster.submitted.len();
        if matches!(&cluster.close_after, Some((count, _)) if submitted >= *count) {
            cluster.close_after = None;
        }
        Ok(format!("{}", 1000 + submitted))
    }

    fn list_jobs(&self) -> Result<Vec<ClusterJob>> {
        let cluster = self.cluster.lock().unwrap();
        if cluster.fail_listing {
            return Err(format_err!("squeue: error: slurm_load_jobs error"));
        }
        let states = std::iter::repeat(ClusterJobState::Queued)
            .take(cluster.queued)
            .chain(std::iter::repeat(ClusterJobState::Running).take(cluster.running));
        Ok(states
            .enumerate()
            .map(|(i, state)| {
                let job_id = 90_000 + i as i32;
                ClusterJob {
                    cluster_id: job_id.to_string(),
                    name: format!("erna_{}", job_id),
                    job_id,
                    state,
                }
            })
            .collect())
    }

    fn cancel(&self, job_name: &str) -> Result<()> {
        let mut cluster = self.cluster.lock().unwrap();
        if let Some(store) = &cluster.start_on_cancel {
            let job_id = parse_job_name("erna", job_name).unwrap();
            let report = StatusReport::new(job_id, ProcessingState::Running);
            Job::apply_status_report(&report, &mut store.conn().unwrap()).unwrap();
        }
        cluster.cancelled.push(job_name.to_owned());
        Ok(())
    }
}
