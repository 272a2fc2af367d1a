//! The `runs` subcommand: keeping our copy of the run catalog up to date.

use erna_common::{
    config::Config,
    drs::{required_drs_step, SUPPORTED_ROIS},
    paths::{parse_archive_path, ArchiveFile, Layout},
    prelude::*,
};
use std::io::Read;

/// The `run_type_key` of physics data runs.
const DATA_RUN_TYPE_KEY: i32 = 1;

/// The `run_type_key` of DRS calibration runs.
const DRS_RUN_TYPE_KEY: i32 = 2;

/// `runs` options.
#[derive(Debug, clap::Subcommand)]
pub enum Opt {
    /// Add the runs of a catalog export to the store. Runs we already know
    /// about are left alone.
    Fill {
        /// A CSV file with the columns night, run_id, run_type_key,
        /// run_type_name, drs_step and roi.
        catalog: PathBuf,
    },

    /// Mark the runs present in the raw data archive as available.
    Scan {
        /// Only scan this year.
        #[arg(long)]
        year: Option<i32>,
        /// Only scan this month. Needs --year.
        #[arg(long, requires = "year")]
        month: Option<u32>,
        /// Only scan this day. Needs --month.
        #[arg(long, requires = "month")]
        day: Option<u32>,
    },
}

/// Run the `runs` subcommand.
pub fn run(opt: &Opt, config: &Config, store: &Store) -> Result<()> {
    let mut conn = store.conn()?;
    match opt {
        Opt::Fill { catalog } => {
            let f = File::open(catalog)
                .with_context(|| format!("could not open {}", catalog.display()))?;
            let (raws, drs) = read_catalog(f)
                .with_context(|| format!("could not read {}", catalog.display()))?;
            let new_raws = NewRawDataFile::upsert_all(&raws, &mut conn)?;
            let new_drs = NewDrsFile::upsert_all(&drs, &mut conn)?;
            println!(
                "added {} of {} raw data files and {} of {} drs files",
                new_raws,
                raws.len(),
                new_drs,
                drs.len(),
            );
        }
        Opt::Scan { year, month, day } => {
            let counts = scan(&config.paths, *year, *month, *day, &mut conn)?;
            println!(
                "marked {} raw data files and {} drs files as available, {} files not in the store",
                counts.raw, counts.drs, counts.unknown,
            );
        }
    }
    Ok(())
}

/// One row of the run catalog.
#[derive(Debug, Deserialize)]
struct CatalogRow {
    night: Night,
    run_id: i32,
    run_type_key: i32,
    run_type_name: String,
    drs_step: Option<i32>,
    roi: i32,
}

/// Split a run catalog into the raw data files and the DRS files we can use.
/// Everything else, including DRS runs of a step no ROI calls for, is
/// skipped.
fn read_catalog<R: Read>(rdr: R) -> Result<(Vec<NewRawDataFile>, Vec<NewDrsFile>)> {
    let mut raws = vec![];
    let mut drs = vec![];
    for row in csv::Reader::from_reader(rdr).deserialize() {
        let row: CatalogRow = row?;
        match (row.run_type_key, row.drs_step) {
            (DATA_RUN_TYPE_KEY, _) => raws.push(NewRawDataFile {
                night: row.night,
                run_id: row.run_id,
                available: false,
                roi: row.roi,
                run_type_key: row.run_type_key,
                run_type_name: row.run_type_name,
            }),
            (DRS_RUN_TYPE_KEY, Some(drs_step)) if is_usable_drs_step(drs_step) => {
                drs.push(NewDrsFile {
                    night: row.night,
                    run_id: row.run_id,
                    available: false,
                    roi: row.roi,
                    drs_step,
                })
            }
            _ => trace!(
                "skipping {} run {}_{:03}",
                row.run_type_name,
                row.night,
                row.run_id
            ),
        }
    }
    Ok((raws, drs))
}

/// Do we calibrate any ROI with DRS runs of `drs_step`?
fn is_usable_drs_step(drs_step: i32) -> bool {
    SUPPORTED_ROIS
        .iter()
        .any(|&roi| required_drs_step(roi) == Some(drs_step))
}

/// What a scan found.
#[derive(Debug, Default, PartialEq)]
struct ScanCounts {
    raw: usize,
    drs: usize,
    unknown: usize,
}

/// Look for archive files of the given year, month and day, and mark the
/// ones we know about as available.
fn scan(
    layout: &Layout,
    year: Option<i32>,
    month: Option<u32>,
    day: Option<u32>,
    conn: &mut SqliteConnection,
) -> Result<ScanCounts> {
    let pattern = format!(
        "{}/{}/{}/{}/*",
        glob::Pattern::escape(&layout.raw_dir.display().to_string()),
        year.map_or_else(|| "*".to_owned(), |y| format!("{:04}", y)),
        month.map_or_else(|| "*".to_owned(), |m| format!("{:02}", m)),
        day.map_or_else(|| "*".to_owned(), |d| format!("{:02}", d)),
    );
    debug!("scanning {}", pattern);

    let mut counts = ScanCounts::default();
    for path in glob::glob(&pattern).with_context(|| format!("bad scan pattern {}", pattern))? {
        let path = path.context("could not scan raw data archive")?;
        let known = match parse_archive_path(&path) {
            Some(ArchiveFile::Raw(night, run_id)) => {
                let known = RawDataFile::set_available(night, run_id, true, conn)?;
                counts.raw += usize::from(known);
                known
            }
            Some(ArchiveFile::Drs(night, run_id)) => {
                let known = DrsFile::set_available(night, run_id, true, conn)?;
                counts.drs += usize::from(known);
                known
            }
            None => {
                trace!("ignoring {}", path.display());
                continue;
            }
        };
        if !known {
            debug!("{} is not in the store", path.display());
            counts.unknown += 1;
        }
    }
    Ok(counts)
}
