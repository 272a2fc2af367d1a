//! The `upload` subcommand.

use erna_common::{paths::check_file_name, prelude::*};
use std::fs;

/// `upload` options.
#[derive(Debug, clap::Subcommand)]
pub enum Opt {
    /// Store a version of the processing tool.
    Jar {
        /// The jar file.
        file: PathBuf,
        /// The tool version in this jar. Must be new.
        #[arg(long)]
        version: String,
    },

    /// Store a configuration for a stored tool version.
    Xml {
        /// The XML file.
        file: PathBuf,
        /// The tool version this XML is meant for.
        #[arg(long)]
        jar: String,
        /// The name to store it under. Must be new for this jar.
        #[arg(long)]
        name: String,
        /// A description of this configuration.
        #[arg(long, default_value = "")]
        comment: String,
    },
}

/// Run the `upload` subcommand.
pub fn run(opt: &Opt, store: &Store) -> Result<()> {
    let mut conn = store.conn()?;
    match opt {
        Opt::Jar { file, version } => {
            let jar = upload_jar(file, version, &mut conn)?;
            println!("stored jar {} as {}", jar.version, jar.id);
        }
        Opt::Xml {
            file,
            jar,
            name,
            comment,
        } => {
            let xml = upload_xml(file, jar, name, comment, &mut conn)?;
            println!("stored xml {} for jar {} as {}", xml.name, jar, xml.id);
        }
    }
    Ok(())
}

fn upload_jar(file: &Path, version: &str, conn: &mut SqliteConnection) -> Result<Jar> {
    // Jars and XMLs are written to directories named after these.
    check_file_name("jar version", version)?;
    let jar_file = fs::read(file).with_context(|| format!("could not read {}", file.display()))?;
    NewJar {
        version: version.to_owned(),
        jar_file,
    }
    .insert(conn)
}

fn upload_xml(
    file: &Path,
    jar: &str,
    name: &str,
    comment: &str,
    conn: &mut SqliteConnection,
) -> Result<Xml> {
    check_file_name("xml name", name)?;
    let content =
        fs::read_to_string(file).with_context(|| format!("could not read {}", file.display()))?;
    let jar = Jar::find_by_version(jar, conn)?;
    NewXml {
        name: name.to_owned(),
        content,
        comment: comment.to_owned(),
        jar_id: jar.id,
    }
    .insert(conn)
}
