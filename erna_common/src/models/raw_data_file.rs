use crate::prelude::*;
use crate::schema::*;

/// A raw data run recorded by the telescope.
#[derive(Clone, Debug, Identifiable, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = raw_data_files, check_for_backend(diesel::sqlite::Sqlite))]
pub struct RawDataFile {
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
    /// The run type key from the run catalog.
    pub run_type_key: i32,
    /// The human-readable run type from the run catalog.
    pub run_type_name: String,
}

impl RawDataFile {
    /// Find a raw data file by ID.
    pub fn find(id: i32, conn: &mut SqliteConnection) -> Result<RawDataFile> {
        raw_data_files::table
            .find(id)
            .first(conn)
            .with_context(|| format!("could not load raw data file {}", id))
    }

    /// Find a raw data file by its night and run, if we know about it.
    pub fn find_by_night_run(
        night: Night,
        run_id: i32,
        conn: &mut SqliteConnection,
    ) -> Result<Option<RawDataFile>> {
        raw_data_files::table
            .filter(raw_data_files::night.eq(night))
            .filter(raw_data_files::run_id.eq(run_id))
            .first(conn)
            .optional()
            .with_context(|| format!("could not look up raw data file {}_{:03}", night, run_id))
    }

    /// List the raw data files of a range of nights, oldest first.
    pub fn for_nights(
        first: Night,
        last: Night,
        conn: &mut SqliteConnection,
    ) -> Result<Vec<RawDataFile>> {
        raw_data_files::table
            .filter(raw_data_files::night.ge(first))
            .filter(raw_data_files::night.le(last))
            .order((raw_data_files::night, raw_data_files::run_id))
            .load(conn)
            .with_context(|| format!("could not list raw data files from {} to {}", first, last))
    }

    /// Record whether this file is currently present on disk. This is the only
    /// field we ever change after a file has been inserted. Returns `false` if
    /// we don't know about this run.
    pub fn set_available(
        night: Night,
        run_id: i32,
        available: bool,
        conn: &mut SqliteConnection,
    ) -> Result<bool> {
        let updated = diesel::update(
            raw_data_files::table
                .filter(raw_data_files::night.eq(night))
                .filter(raw_data_files::run_id.eq(run_id)),
        )
        .set(raw_data_files::available.eq(available))
        .execute(conn)
        .with_context(|| format!("could not update availability of {}_{:03}", night, run_id))?;
        Ok(updated > 0)
    }

    /// The file name used by the raw data archive.
    pub fn basename(&self) -> String {
        format!("{}_{:03}.fits.fz", self.night, self.run_id)
    }

    /// Generate a sample value for testing.
    pub fn factory(night: Night, run_id: i32) -> Self {
        RawDataFile {
            id: 1,
            night,
            run_id,
            available: true,
            roi: 300,
            run_type_key: 1,
            run_type_name: "data".to_owned(),
        }
    }
}

/// Data required to create a new `RawDataFile`.
#[derive(Clone, Debug, Insertable)]
#[diesel(table_name = raw_data_files)]
pub struct NewRawDataFile {
    /// The night in which this run was recorded.
    pub night: Night,
    /// The run number within `night`.
    pub run_id: i32,
    /// Is the file present on disk?
    pub available: bool,
    /// The region of interest the digitizer was configured with.
    pub roi: i32,
    /// The run type key from the run catalog.
    pub run_type_key: i32,
    /// The human-readable run type from the run catalog.
    pub run_type_name: String,
}

impl NewRawDataFile {
    /// Insert a single raw data file.
    pub fn insert(&self, conn: &mut SqliteConnection) -> Result<RawDataFile> {
        diesel::insert_into(raw_data_files::table)
            .values(self)
            .get_result(conn)
            .with_context(|| {
                format!(
                    "error inserting raw data file {}_{:03}",
                    self.night, self.run_id
                )
            })
    }

    /// Insert every file we don't already know about. Files already present
    /// (by night and run) are left untouched, so re-reading the same catalog
    /// is harmless. Returns the number of new rows.
    pub fn upsert_all(files: &[NewRawDataFile], conn: &mut SqliteConnection) -> Result<usize> {
        conn.transaction(|conn| -> Result<usize> {
            let mut inserted = 0;
            for file in files {
                inserted += diesel::insert_or_ignore_into(raw_data_files::table)
                    .values(file)
                    .execute(conn)
                    .with_context(|| {
                        format!("error upserting raw data file {}_{:03}", file.night, file.run_id)
                    })?;
            }
            Ok(inserted)
        })
    }
}
