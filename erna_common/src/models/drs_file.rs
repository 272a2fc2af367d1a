use crate::prelude::*;
use crate::schema::*;

/// A DRS calibration run, needed to interpret the raw data runs of the same
/// night.
#[derive(Clone, Debug, Identifiable, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = drs_files, check_for_backend(diesel::sqlite::Sqlite))]
pub struct DrsFile {
    /// The unique ID of this file.
    pub id: i32,
    /// The night in which this run was recorded.
    pub night: Night,
    /// The run number within `night`.
    pub run_id: i32,
    /// Has the last scan found this file on disk?
    pub available: bool,
    /// The region of interest the digitizer was configured with.
    pub roi: i32,
    /// Which step of the DRS calibration sequence this run is.
    pub drs_step: i32,
}

impl DrsFile {
    /// Find a DRS file by ID.
    pub fn find(id: i32, conn: &mut SqliteConnection) -> Result<DrsFile> {
        drs_files::table
            .find(id)
            .first(conn)
            .with_context(|| format!("could not load drs file {}", id))
    }

    /// Find a DRS file by its night and run, if we know about it.
    pub fn find_by_night_run(
        night: Night,
        run_id: i32,
        conn: &mut SqliteConnection,
    ) -> Result<Option<DrsFile>> {
        drs_files::table
            .filter(drs_files::night.eq(night))
            .filter(drs_files::run_id.eq(run_id))
            .first(conn)
            .optional()
            .with_context(|| format!("could not look up drs file {}_{:03}", night, run_id))
    }

    /// All available DRS files of `night` with the given `drs_step`, ordered
    /// by run.
    pub fn available_for_night(
        night: Night,
        drs_step: i32,
        conn: &mut SqliteConnection,
    ) -> Result<Vec<DrsFile>> {
        drs_files::table
            .filter(drs_files::night.eq(night))
            .filter(drs_files::available.eq(true))
            .filter(drs_files::drs_step.eq(drs_step))
            .order(drs_files::run_id)
            .load(conn)
            .with_context(|| format!("could not list drs files of {}", night))
    }

    /// Record whether this file is currently present on disk. Returns `false`
    /// if we don't know about this run.
    pub fn set_available(
        night: Night,
        run_id: i32,
        available: bool,
        conn: &mut SqliteConnection,
    ) -> Result<bool> {
        let updated = diesel::update(
            drs_files::table
                .filter(drs_files::night.eq(night))
                .filter(drs_files::run_id.eq(run_id)),
        )
        .set(drs_files::available.eq(available))
        .execute(conn)
        .with_context(|| format!("could not update availability of {}_{:03}", night, run_id))?;
        Ok(updated > 0)
    }

    /// The file name used by the raw data archive.
    pub fn basename(&self) -> String {
        format!("{}_{:03}.drs.fits.gz", self.night, self.run_id)
    }

    /// Generate a sample value for testing.
    pub fn factory(night: Night, run_id: i32) -> Self {
        DrsFile {
            id: 1,
            night,
            run_id,
            available: true,
            roi: 300,
            drs_step: 2,
        }
    }
}

/// Data required to create a new `DrsFile`.
#[derive(Clone, Debug, Insertable)]
#[diesel(table_name = drs_files)]
pub struct NewDrsFile {
    /// The night in which this run was recorded.
    pub night: Night,
    /// The run number within `night`.
    pub run_id: i32,
    /// Is the file present on disk?
    pub available: bool,
    /// The region of interest the digitizer was configured with.
    pub roi: i32,
    /// Which step of the DRS calibration sequence this run is.
    pub drs_step: i32,
}

impl NewDrsFile {
    /// Insert a single DRS file.
    pub fn insert(&self, conn: &mut SqliteConnection) -> Result<DrsFile> {
        diesel::insert_into(drs_files::table)
            .values(self)
            .get_result(conn)
            .with_context(|| format!("error inserting drs file {}_{:03}", self.night, self.run_id))
    }

    /// Insert every file we don't already know about, leaving existing rows
    /// alone. Returns the number of new rows.
    pub fn upsert_all(files: &[NewDrsFile], conn: &mut SqliteConnection) -> Result<usize> {
        conn.transaction(|conn| -> Result<usize> {
            let mut inserted = 0;
            for file in files {
                inserted += diesel::insert_or_ignore_into(drs_files::table)
                    .values(file)
                    .execute(conn)
                    .with_context(|| {
                        format!("error upserting drs file {}_{:03}", file.night, file.run_id)
                    })?;
            }
            Ok(inserted)
        })
    }
}
