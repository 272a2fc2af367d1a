use crate::errors::TransitionError;
use crate::prelude::*;
use crate::schema::*;
use crate::status::StatusReport;

/// One invocation of one jar with one XML on one raw data file.
#[derive(Clone, Debug, Identifiable, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = jobs, check_for_backend(diesel::sqlite::Sqlite))]
pub struct Job {
    /// The unique ID of this job.
    pub id: i32,
    /// The raw data file to process.
    pub raw_data_file_id: i32,
    /// The DRS file used to calibrate `raw_data_file_id`.
    pub drs_file_id: i32,
    /// The tool version to run.
    pub jar_id: i32,
    /// The configuration to run the tool with.
    pub xml_id: i32,
    /// Where the output was stored. Only set once the job succeeded.
    pub result_file: Option<String>,
    /// The current status of this job.
    #[diesel(column_name = status_id)]
    pub status: ProcessingState,
    /// Lower values are submitted first.
    pub priority: i32,
    /// The walltime to request from the cluster, in minutes.
    pub walltime: i32,
    /// The MD5 checksum of `result_file`.
    pub md5hash: Option<String>,
}

/// What happened when we applied a status report.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReportOutcome {
    /// The job moved to the reported state.
    Applied,
    /// The job was already in the reported state, so nothing changed.
    AlreadyApplied,
}

impl Job {
    /// Find a job by ID.
    pub fn find(id: i32, conn: &mut SqliteConnection) -> Result<Job> {
        jobs::table
            .find(id)
            .first(conn)
            .with_context(|| format!("could not load job {}", id))
    }

    /// Find the job processing `raw_data_file_id` with this jar and XML, if
    /// there is one.
    pub fn find_by_triple(
        raw_data_file_id: i32,
        jar_id: i32,
        xml_id: i32,
        conn: &mut SqliteConnection,
    ) -> Result<Option<Job>> {
        jobs::table
            .filter(jobs::raw_data_file_id.eq(raw_data_file_id))
            .filter(jobs::jar_id.eq(jar_id))
            .filter(jobs::xml_id.eq(xml_id))
            .first(conn)
            .optional()
            .context("could not look up job")
    }

    /// List all jobs, optionally only those with `status`.
    pub fn list(status: Option<ProcessingState>, conn: &mut SqliteConnection) -> Result<Vec<Job>> {
        let mut query = jobs::table.order(jobs::id).into_boxed();
        if let Some(status) = status {
            query = query.filter(jobs::status_id.eq(status));
        }
        query.load(conn).context("could not list jobs")
    }

    /// All jobs with the specified status.
    pub fn with_status(status: ProcessingState, conn: &mut SqliteConnection) -> Result<Vec<Job>> {
        Job::list(Some(status), conn)
    }

    /// How many jobs have the specified status?
    pub fn count_with_status(status: ProcessingState, conn: &mut SqliteConnection) -> Result<i64> {
        jobs::table
            .filter(jobs::status_id.eq(status))
            .count()
            .get_result(conn)
            .with_context(|| format!("could not count {} jobs", status))
    }

    /// The next `limit` jobs waiting to be submitted: most urgent priority
    /// first, and newest nights first among equal priorities.
    pub fn pending(limit: i64, conn: &mut SqliteConnection) -> Result<Vec<Job>> {
        jobs::table
            .inner_join(raw_data_files::table)
            .filter(jobs::status_id.eq(ProcessingState::Inserted))
            .order((
                jobs::priority.asc(),
                raw_data_files::night.desc(),
                jobs::id.asc(),
            ))
            .limit(limit)
            .select(Job::as_select())
            .load(conn)
            .context("could not load pending jobs")
    }

    /// Load everything we need to know to run this job.
    pub fn details(&self, conn: &mut SqliteConnection) -> Result<JobDetails> {
        Ok(JobDetails {
            job: self.clone(),
            raw_data_file: RawDataFile::find(self.raw_data_file_id, conn)?,
            drs_file: DrsFile::find(self.drs_file_id, conn)?,
            jar: Jar::find(self.jar_id, conn)?,
            xml: Xml::find(self.xml_id, conn)?,
        })
    }

    /// The name under which this job is known to the cluster scheduler.
    pub fn job_name(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.id)
    }

    /// Move this job from `from` to `to`, but only if it is still in `from`.
    /// Returns `false` if somebody else changed the job first.
    fn transition(
        &mut self,
        from: ProcessingState,
        to: ProcessingState,
        conn: &mut SqliteConnection,
    ) -> Result<bool> {
        let updated = diesel::update(
            jobs::table
                .filter(jobs::id.eq(self.id))
                .filter(jobs::status_id.eq(from)),
        )
        .set(jobs::status_id.eq(to))
        .execute(conn)
        .with_context(|| format!("could not mark job {} as {}", self.id, to))?;
        if updated > 0 {
            self.status = to;
        }
        Ok(updated > 0)
    }

    /// Mark this job as handed over to the cluster. We do this right before
    /// submitting, because an executor may report back before the scheduler
    /// command returns.
    pub fn mark_as_queued(&mut self, conn: &mut SqliteConnection) -> Result<()> {
        if !self.transition(ProcessingState::Inserted, ProcessingState::Queued, conn)? {
            return Err(TransitionError {
                job_id: self.id,
                from: Job::find(self.id, conn)?.status,
                to: ProcessingState::Queued,
            }
            .into());
        }
        Ok(())
    }

    /// Mark a job we just queued as impossible to dispatch. It will stay like
    /// this until an operator looks at it.
    pub fn mark_as_failed(&mut self, conn: &mut SqliteConnection) -> Result<()> {
        if !self.transition(ProcessingState::Queued, ProcessingState::Failed, conn)? {
            return Err(TransitionError {
                job_id: self.id,
                from: Job::find(self.id, conn)?.status,
                to: ProcessingState::Failed,
            }
            .into());
        }
        Ok(())
    }

    /// Put a job which was cancelled on the cluster back into the queue of
    /// jobs to submit. Only `queued` and `running` jobs can be reset, and only
    /// if they are still in `from`. Returns `false` if the job had moved on.
    pub fn reset_to_inserted(
        &mut self,
        from: ProcessingState,
        conn: &mut SqliteConnection,
    ) -> Result<bool> {
        if !matches!(from, ProcessingState::Queued | ProcessingState::Running) {
            return Err(TransitionError {
                job_id: self.id,
                from,
                to: ProcessingState::Inserted,
            }
            .into());
        }
        self.transition(from, ProcessingState::Inserted, conn)
    }

    /// Apply a status report sent by an executor. Reports repeating the
    /// current state change nothing. A repeated `success` must carry the
    /// result we already stored.
    pub fn apply_status_report(
        report: &StatusReport,
        conn: &mut SqliteConnection,
    ) -> Result<ReportOutcome> {
        report.validate()?;
        conn.immediate_transaction(|conn| -> Result<ReportOutcome> {
            let job = Job::find(report.job_id, conn)?;
            let rejected = || TransitionError {
                job_id: job.id,
                from: job.status,
                to: report.status,
            };

            if job.status == report.status {
                let same_result =
                    job.result_file == report.result_path && job.md5hash == report.checksum;
                if report.status == ProcessingState::Success && !same_result {
                    return Err(rejected().into());
                }
                return Ok(ReportOutcome::AlreadyApplied);
            }
            if !job.status.accepts_report(report.status) {
                return Err(rejected().into());
            }

            let target = jobs::table
                .filter(jobs::id.eq(job.id))
                .filter(jobs::status_id.eq(job.status));
            if report.status == ProcessingState::Success {
                diesel::update(target)
                    .set((
                        jobs::status_id.eq(report.status),
                        jobs::result_file.eq(&report.result_path),
                        jobs::md5hash.eq(&report.checksum),
                    ))
                    .execute(conn)
            } else {
                diesel::update(target)
                    .set(jobs::status_id.eq(report.status))
                    .execute(conn)
            }
            .with_context(|| format!("could not mark job {} as {}", job.id, report.status))?;
            Ok(ReportOutcome::Applied)
        })
    }

    /// Give every job which ran out of time `factor` times its old walltime
    /// (rounded up) and queue it for submission again. Returns the number of
    /// jobs reset.
    pub fn reset_walltime_exceeded(factor: f64, conn: &mut SqliteConnection) -> Result<usize> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(format_err!("walltime factor must be at least 1, got {}", factor));
        }
        conn.immediate_transaction(|conn| -> Result<usize> {
            let exceeded = jobs::table
                .filter(jobs::status_id.eq(ProcessingState::WalltimeExceeded))
                .select((jobs::id, jobs::walltime))
                .load::<(i32, i32)>(conn)
                .context("could not load jobs which exceeded their walltime")?;
            for &(id, walltime) in &exceeded {
                let new_walltime = cast::i32((f64::from(walltime) * factor).ceil())
                    .with_context(|| format!("new walltime for job {} is out of range", id))?;
                diesel::update(jobs::table.find(id))
                    .set((
                        jobs::walltime.eq(new_walltime),
                        jobs::status_id.eq(ProcessingState::Inserted),
                    ))
                    .execute(conn)
                    .with_context(|| format!("could not reset job {}", id))?;
                debug!("job {}: walltime {} -> {} minutes", id, walltime, new_walltime);
            }
            Ok(exceeded.len())
        })
    }

    /// Generate a sample value for testing.
    pub fn factory(id: i32) -> Self {
        Job {
            id,
            raw_data_file_id: 1,
            drs_file_id: 1,
            jar_id: 1,
            xml_id: 1,
            result_file: None,
            status: ProcessingState::Inserted,
            priority: 5,
            walltime: 180,
            md5hash: None,
        }
    }
}

/// A job together with the rows it refers to.
#[derive(Clone, Debug, Serialize)]
pub struct JobDetails {
    /// The job itself.
    pub job: Job,
    /// The raw data file to process.
    pub raw_data_file: RawDataFile,
    /// The DRS file used to calibrate it.
    pub drs_file: DrsFile,
    /// The tool version to run.
    pub jar: Jar,
    /// The configuration to run the tool with.
    pub xml: Xml,
}

/// Data required to create a new `Job`.
#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob {
    /// The raw data file to process.
    pub raw_data_file_id: i32,
    /// The DRS file used to calibrate `raw_data_file_id`.
    pub drs_file_id: i32,
    /// The tool version to run.
    pub jar_id: i32,
    /// The configuration to run the tool with.
    pub xml_id: i32,
    /// The initial status of the job.
    #[diesel(column_name = status_id)]
    pub status: ProcessingState,
    /// Lower values are submitted first.
    pub priority: i32,
    /// The walltime to request from the cluster, in minutes.
    pub walltime: i32,
}

impl NewJob {
    /// Insert a new job into the database.
    pub fn insert(&self, conn: &mut SqliteConnection) -> Result<Job> {
        diesel::insert_into(jobs::table)
            .values(self)
            .get_result(conn)
            .with_context(|| {
                format!(
                    "error inserting job for raw data file {}",
                    self.raw_data_file_id
                )
            })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Insert a raw data file, a DRS file, a jar and an XML, and return a
    /// `NewJob` tying them together.
    pub fn new_job_fixture(
        night: i32,
        run_id: i32,
        priority: i32,
        conn: &mut SqliteConnection,
    ) -> NewJob {
        let night = Night::from_int(night).unwrap();
        let raw = NewRawDataFile {
            night,
            run_id,
            available: true,
            roi: 300,
            run_type_key: 1,
            run_type_name: "data".to_owned(),
        }
        .insert(conn)
        .unwrap();
        let drs = match DrsFile::find_by_night_run(night, 1, conn).unwrap() {
            Some(drs) => drs,
            None => NewDrsFile {
                night,
                run_id: 1,
                available: true,
                roi: 300,
                drs_step: 2,
            }
            .insert(conn)
            .unwrap(),
        };
        let jar = match Jar::find_by_version("1.0.0", conn) {
            Ok(jar) => jar,
            Err(_) => NewJar {
                version: "1.0.0".to_owned(),
                jar_file: vec![0xca, 0xfe],
            }
            .insert(conn)
            .unwrap(),
        };
        let xml = match Xml::find_by_name_and_jar("std", &jar, conn) {
            Ok(xml) => xml,
            Err(_) => NewXml {
                name: "std".to_owned(),
                content: "<container/>".to_owned(),
                comment: String::new(),
                jar_id: jar.id,
            }
            .insert(conn)
            .unwrap(),
        };
        NewJob {
            raw_data_file_id: raw.id,
            drs_file_id: drs.id,
            jar_id: jar.id,
            xml_id: xml.id,
            status: ProcessingState::Inserted,
            priority,
            walltime: 180,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::new_job_fixture;
    use super::*;
    use crate::db::testing::TestStore;

    const CHECKSUM: &str = "d41d8cd98f00b204e9800998ecf8427e";

    fn report(job: &Job, status: ProcessingState) -> StatusReport {
        StatusReport::new(job.id, status)
    }

    fn success(job: &Job, path: &str) -> StatusReport {
        StatusReport::success(job.id, path.to_owned(), CHECKSUM.to_owned())
    }

    fn queued_job(conn: &mut SqliteConnection) -> Job {
        let mut job = new_job_fixture(20230101, 5, 5, conn).insert(conn).unwrap();
        job.mark_as_queued(conn).unwrap();
        job
    }

    #[test]
    fn pending_jobs_are_ordered_by_priority_then_newest_night() {
        let test = TestStore::new();
        let mut conn = test.conn();
        let a = new_job_fixture(20230101, 1, 5, &mut conn).insert(&mut conn).unwrap();
        let b = new_job_fixture(20230101, 2, 1, &mut conn).insert(&mut conn).unwrap();
        let c = new_job_fixture(20230301, 3, 5, &mut conn).insert(&mut conn).unwrap();

        let pending = Job::pending(10, &mut conn).unwrap();
        let ids = pending.iter().map(|j| j.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![b.id, c.id, a.id]);

        let limited = Job::pending(2, &mut conn).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn pending_skips_jobs_that_are_not_inserted() {
        let test = TestStore::new();
        let mut conn = test.conn();
        let mut job = new_job_fixture(20230101, 1, 5, &mut conn).insert(&mut conn).unwrap();
        job.mark_as_queued(&mut conn).unwrap();
        assert!(Job::pending(10, &mut conn).unwrap().is_empty());
        assert_eq!(Job::count_with_status(ProcessingState::Queued, &mut conn).unwrap(), 1);
    }

    #[test]
    fn queueing_twice_fails() {
        let test = TestStore::new();
        let mut conn = test.conn();
        let mut job = queued_job(&mut conn);
        let err = job.mark_as_queued(&mut conn).unwrap_err();
        assert!(err.downcast_ref::<TransitionError>().is_some());
    }

    #[test]
    fn only_queued_jobs_can_fail_to_dispatch() {
        let test = TestStore::new();
        let mut conn = test.conn();
        let mut job = new_job_fixture(20230101, 1, 5, &mut conn).insert(&mut conn).unwrap();
        assert!(job.mark_as_failed(&mut conn).is_err());
        job.mark_as_queued(&mut conn).unwrap();
        job.mark_as_failed(&mut conn).unwrap();
        assert_eq!(Job::find(job.id, &mut conn).unwrap().status, ProcessingState::Failed);
    }

    #[test]
    fn reports_drive_the_job_to_success() {
        let test = TestStore::new();
        let mut conn = test.conn();
        let job = queued_job(&mut conn);

        let running = report(&job, ProcessingState::Running);
        let outcome = Job::apply_status_report(&running, &mut conn).unwrap();
        assert_eq!(outcome, ReportOutcome::Applied);
        Job::apply_status_report(&success(&job, "/out/x.fits"), &mut conn).unwrap();

        let after = Job::find(job.id, &mut conn).unwrap();
        assert_eq!(
            after,
            Job {
                status: ProcessingState::Success,
                result_file: Some("/out/x.fits".to_owned()),
                md5hash: Some(CHECKSUM.to_owned()),
                ..job
            }
        );
    }

    #[test]
    fn replayed_success_changes_nothing() {
        let test = TestStore::new();
        let mut conn = test.conn();
        let job = queued_job(&mut conn);
        Job::apply_status_report(&report(&job, ProcessingState::Running), &mut conn).unwrap();
        Job::apply_status_report(&success(&job, "/out/x.fits"), &mut conn).unwrap();
        let before = Job::find(job.id, &mut conn).unwrap();

        let outcome = Job::apply_status_report(&success(&job, "/out/x.fits"), &mut conn).unwrap();
        assert_eq!(outcome, ReportOutcome::AlreadyApplied);
        assert_eq!(Job::find(job.id, &mut conn).unwrap(), before);

        assert!(Job::apply_status_report(&success(&job, "/out/y.fits"), &mut conn).is_err());
        assert_eq!(Job::find(job.id, &mut conn).unwrap(), before);
    }

    #[test]
    fn terminal_states_are_final() {
        let test = TestStore::new();
        let mut conn = test.conn();
        let job = queued_job(&mut conn);
        Job::apply_status_report(&report(&job, ProcessingState::Running), &mut conn).unwrap();
        Job::apply_status_report(&report(&job, ProcessingState::Failed), &mut conn).unwrap();

        for status in [
            ProcessingState::Running,
            ProcessingState::WalltimeExceeded,
            ProcessingState::InputFileMissing,
            ProcessingState::Inserted,
        ] {
            let err = Job::apply_status_report(&report(&job, status), &mut conn).unwrap_err();
            assert!(err.downcast_ref::<TransitionError>().is_some());
        }
        assert!(Job::apply_status_report(&success(&job, "/out/x.fits"), &mut conn).is_err());
        assert_eq!(Job::find(job.id, &mut conn).unwrap().status, ProcessingState::Failed);
    }

    #[test]
    fn reports_for_jobs_that_were_never_queued_are_rejected() {
        let test = TestStore::new();
        let mut conn = test.conn();
        let job = new_job_fixture(20230101, 1, 5, &mut conn).insert(&mut conn).unwrap();
        let running = report(&job, ProcessingState::Running);
        assert!(Job::apply_status_report(&running, &mut conn).is_err());
        assert_eq!(Job::find(job.id, &mut conn).unwrap().status, ProcessingState::Inserted);
    }

    #[test]
    fn reports_for_unknown_jobs_fail() {
        let test = TestStore::new();
        let mut conn = test.conn();
        let report = StatusReport::new(4711, ProcessingState::Running);
        assert!(Job::apply_status_report(&report, &mut conn).is_err());
    }

    #[test]
    fn walltime_bump_only_touches_exceeded_jobs() {
        let test = TestStore::new();
        let mut conn = test.conn();
        let exceeded = queued_job(&mut conn);
        Job::apply_status_report(&report(&exceeded, ProcessingState::Running), &mut conn).unwrap();
        let timed_out = report(&exceeded, ProcessingState::WalltimeExceeded);
        Job::apply_status_report(&timed_out, &mut conn).unwrap();
        let untouched = new_job_fixture(20230101, 9, 5, &mut conn).insert(&mut conn).unwrap();

        assert_eq!(Job::reset_walltime_exceeded(1.5, &mut conn).unwrap(), 1);
        let reset = Job::find(exceeded.id, &mut conn).unwrap();
        assert_eq!(reset.status, ProcessingState::Inserted);
        assert_eq!(reset.walltime, 270);
        assert_eq!(Job::find(untouched.id, &mut conn).unwrap(), untouched);

        assert_eq!(Job::reset_walltime_exceeded(1.5, &mut conn).unwrap(), 0);
        assert!(Job::reset_walltime_exceeded(0.5, &mut conn).is_err());
    }

    #[test]
    fn only_cancelled_queued_or_running_jobs_can_be_reset() {
        let test = TestStore::new();
        let mut conn = test.conn();
        let mut job = queued_job(&mut conn);
        assert!(!job.reset_to_inserted(ProcessingState::Running, &mut conn).unwrap());
        assert!(job.reset_to_inserted(ProcessingState::Queued, &mut conn).unwrap());
        assert_eq!(Job::find(job.id, &mut conn).unwrap().status, ProcessingState::Inserted);
        assert!(job.reset_to_inserted(ProcessingState::Success, &mut conn).is_err());
    }

    #[test]
    fn job_names_use_the_prefix() {
        assert_eq!(Job::factory(17).job_name("erna"), "erna_17");
    }
}
