//! Choosing the DRS calibration run for a raw data run.

use crate::errors::AdmissionError;
use crate::prelude::*;

/// The regions of interest we know how to calibrate.
pub const SUPPORTED_ROIS: [i32; 2] = [300, 1024];

/// The DRS step needed to calibrate data recorded with region of interest
/// `roi`.
pub fn required_drs_step(roi: i32) -> Option<i32> {
    match roi {
        300 => Some(2),
        1024 => Some(1),
        _ => None,
    }
}

/// Pick the DRS file for `raw` out of `candidates`, which must all belong to
/// the same night and be compatible with its region of interest.
///
/// With `prefer_closest`, the candidate with the smallest run distance wins,
/// and the smaller run wins a tie. Otherwise only runs taken before `raw`
/// qualify, and the last of those wins.
pub fn select_drs_file<'a>(
    raw: &RawDataFile,
    candidates: &'a [DrsFile],
    prefer_closest: bool,
) -> Option<&'a DrsFile> {
    if prefer_closest {
        candidates
            .iter()
            .min_by_key(|drs| ((drs.run_id - raw.run_id).abs(), drs.run_id))
    } else {
        candidates
            .iter()
            .filter(|drs| drs.run_id < raw.run_id)
            .max_by_key(|drs| drs.run_id)
    }
}

/// Find the DRS file to use for `raw` in the store.
#[instrument(skip_all, fields(night = %raw.night, run_id = raw.run_id), level = "trace")]
pub fn find_drs_file(
    raw: &RawDataFile,
    prefer_closest: bool,
    conn: &mut SqliteConnection,
) -> Result<DrsFile, AdmissionError> {
    let drs_step = required_drs_step(raw.roi).ok_or(AdmissionError::UnsupportedRoi {
        night: raw.night,
        run_id: raw.run_id,
        roi: raw.roi,
    })?;
    let candidates = DrsFile::available_for_night(raw.night, drs_step, conn)?;
    trace!("{} candidate drs files", candidates.len());
    select_drs_file(raw, &candidates, prefer_closest)
        .cloned()
        .ok_or(AdmissionError::NoDrsFile {
            night: raw.night,
            run_id: raw.run_id,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::testing::TestStore;

    fn night() -> Night {
        Night::from_int(20230101).unwrap()
    }

    fn candidates(runs: &[i32]) -> Vec<DrsFile> {
        runs.iter()
            .map(|&run_id| DrsFile::factory(night(), run_id))
            .collect()
    }

    #[test]
    fn closest_run_wins() {
        let drs = candidates(&[10, 15, 20]);
        let raw = RawDataFile::factory(night(), 17);
        assert_eq!(select_drs_file(&raw, &drs, true).unwrap().run_id, 15);
    }

    #[test]
    fn last_run_before_wins() {
        let drs = candidates(&[10, 15, 20]);
        let raw = RawDataFile::factory(night(), 17);
        assert_eq!(select_drs_file(&raw, &drs, false).unwrap().run_id, 15);

        let early = RawDataFile::factory(night(), 9);
        assert!(select_drs_file(&early, &drs, false).is_none());
        assert_eq!(select_drs_file(&early, &drs, true).unwrap().run_id, 10);
    }

    #[test]
    fn smaller_run_wins_a_tie() {
        let drs = candidates(&[20, 10]);
        let raw = RawDataFile::factory(night(), 15);
        assert_eq!(select_drs_file(&raw, &drs, true).unwrap().run_id, 10);
    }

    #[test]
    fn run_itself_is_not_before_itself() {
        let drs = candidates(&[15]);
        let raw = RawDataFile::factory(night(), 15);
        assert!(select_drs_file(&raw, &drs, false).is_none());
        assert_eq!(select_drs_file(&raw, &drs, true).unwrap().run_id, 15);
    }

    #[test]
    fn roi_decides_the_drs_step() {
        assert_eq!(required_drs_step(300), Some(2));
        assert_eq!(required_drs_step(1024), Some(1));
        assert_eq!(required_drs_step(512), None);
    }

    #[test]
    fn store_lookup_respects_availability_and_step() {
        let test = TestStore::new();
        let mut conn = test.conn();
        let files = [(10, true, 2), (15, false, 2), (16, true, 1), (20, true, 2)]
            .iter()
            .map(|&(run_id, available, drs_step)| NewDrsFile {
                night: night(),
                run_id,
                available,
                roi: 300,
                drs_step,
            })
            .collect::<Vec<_>>();
        NewDrsFile::upsert_all(&files, &mut conn).unwrap();

        let raw = RawDataFile::factory(night(), 17);
        let drs = find_drs_file(&raw, true, &mut conn).unwrap();
        assert_eq!(drs.run_id, 20);

        let other_night = RawDataFile::factory(Night::from_int(20230102).unwrap(), 17);
        assert!(matches!(
            find_drs_file(&other_night, true, &mut conn),
            Err(AdmissionError::NoDrsFile { .. })
        ));

        let odd_roi = RawDataFile { roi: 512, ..raw };
        assert!(matches!(
            find_drs_file(&odd_roi, true, &mut conn),
            Err(AdmissionError::UnsupportedRoi { roi: 512, .. })
        ));
    }
}
