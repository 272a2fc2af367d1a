//! Where things live on the shared file system.

use lazy_static::lazy_static;
use regex::Regex;
use std::fs;

use crate::prelude::*;

/// The directories we work with. All of them must be visible from the
/// compute nodes.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Layout {
    /// The raw data archive, organized as `YYYY/MM/DD`.
    pub raw_dir: PathBuf,
    /// The auxiliary data archive, organized as `YYYY/MM/DD`.
    pub aux_dir: PathBuf,
    /// Our own directory for jars, XMLs, logs and outputs.
    pub erna_dir: PathBuf,
}

impl Layout {
    /// Where the raw data archive keeps `raw`.
    pub fn raw_data_path(&self, raw: &RawDataFile) -> PathBuf {
        self.raw_dir
            .join(raw.night.directory())
            .join(raw.basename())
    }

    /// Where the raw data archive keeps `drs`.
    pub fn drs_path(&self, drs: &DrsFile) -> PathBuf {
        self.raw_dir
            .join(drs.night.directory())
            .join(drs.basename())
    }

    /// The auxiliary data of `night`.
    pub fn aux_dir(&self, night: Night) -> PathBuf {
        self.aux_dir.join(night.directory())
    }

    /// Where the outputs of `jar` and `xml` for `night` go.
    pub fn output_dir(&self, night: Night, jar: &Jar, xml: &Xml) -> PathBuf {
        self.erna_dir
            .join("fact-tools")
            .join(&jar.version)
            .join(&xml.name)
            .join(night.directory())
    }

    /// Where the scheduler writes the log of job `job_id`.
    pub fn log_path(&self, job_prefix: &str, job_id: i32) -> PathBuf {
        self.erna_dir
            .join("logs")
            .join(format!("{}_{:08}.log", job_prefix, job_id))
    }

    /// Where `jar` is materialized.
    pub fn jar_path(&self, jar: &Jar) -> PathBuf {
        self.erna_dir.join("jars").join(format!("{}.jar", jar.version))
    }

    /// Where `xml` is materialized.
    pub fn xml_path(&self, jar: &Jar, xml: &Xml) -> PathBuf {
        self.erna_dir
            .join("xmls")
            .join(&jar.version)
            .join(format!("{}.xml", xml.name))
    }

    /// Write `jar` to disk, unless it's already there.
    pub fn materialize_jar(&self, jar: &Jar, conn: &mut SqliteConnection) -> Result<PathBuf> {
        check_file_name("jar version", &jar.version)?;
        let path = self.jar_path(jar);
        if !path.exists() {
            let blob = jar.load_blob(conn)?;
            write_atomically(&path, &blob)?;
            info!("materialized jar {} at {}", jar.version, path.display());
        }
        Ok(path)
    }

    /// Write `xml` to disk, unless it's already there.
    pub fn materialize_xml(&self, jar: &Jar, xml: &Xml) -> Result<PathBuf> {
        check_file_name("jar version", &jar.version)?;
        check_file_name("xml name", &xml.name)?;
        let path = self.xml_path(jar, xml);
        if !path.exists() {
            write_atomically(&path, xml.content.as_bytes())?;
            info!("materialized xml {} at {}", xml.name, path.display());
        }
        Ok(path)
    }
}

/// Make sure `name` stays inside the directory we join it to. `what` names
/// the value in the error message.
pub fn check_file_name(what: &str, name: &str) -> Result<()> {
    let bad_char = |c: char| c == '/' || c == '\\' || c == '\0';
    if name.is_empty() || name.starts_with('.') || name.contains(bad_char) {
        return Err(format_err!("{} {:?} cannot be used as a file name", what, name));
    }
    Ok(())
}

/// The name shared by all outputs of one job, without extension.
pub fn output_basename(raw: &RawDataFile, jar: &Jar, xml: &Xml) -> String {
    format!("{}_{:03}_{}_{}", raw.night, raw.run_id, jar.version, xml.name)
}

/// Write `contents` to `path` through a temporary file in the same
/// directory, so concurrent readers never see a partial file.
fn write_atomically(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| format_err!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("could not create {}", dir.display()))?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("could not create temporary file in {}", dir.display()))?;
    tmp.write_all(contents)
        .with_context(|| format!("could not write {}", path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("could not move file into place at {}", path.display()))?;
    Ok(())
}

/// A file found in the raw data archive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArchiveFile {
    /// A raw data run.
    Raw(Night, i32),
    /// A DRS calibration run.
    Drs(Night, i32),
}

/// Recognize a file from the raw data archive by its name.
pub fn parse_archive_path(path: &Path) -> Option<ArchiveFile> {
    lazy_static! {
        static ref RE: Regex =
            Regex::new(r"^(?P<night>\d{8})_(?P<run>\d{3})\.(?P<ext>fits\.fz|drs\.fits\.gz)$")
                .expect("couldn't parse built-in regex");
    }

    let name = path.file_name()?.to_str()?;
    let caps = RE.captures(name)?;
    let night = Night::from_int(caps["night"].parse().ok()?).ok()?;
    let run_id = caps["run"].parse().ok()?;
    match &caps["ext"] {
        "fits.fz" => Some(ArchiveFile::Raw(night, run_id)),
        _ => Some(ArchiveFile::Drs(night, run_id)),
    }
}
