use crate::prelude::*;
use crate::schema::*;

/// A version of the processing tool, stored as a jar. We only load the blob
/// itself when we need to write it out to disk.
#[derive(Clone, Debug, Identifiable, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(table_name = jars, check_for_backend(diesel::sqlite::Sqlite))]
pub struct Jar {
    /// The unique ID of this jar.
    pub id: i32,
    /// The tool version contained in this jar.
    pub version: String,
}

impl Jar {
    /// Find a jar by ID.
    pub fn find(id: i32, conn: &mut SqliteConnection) -> Result<Jar> {
        jars::table
            .find(id)
            .select(Jar::as_select())
            .first(conn)
            .with_context(|| format!("could not load jar {}", id))
    }

    /// Find a jar by its version.
    pub fn find_by_version(version: &str, conn: &mut SqliteConnection) -> Result<Jar> {
        jars::table
            .filter(jars::version.eq(version))
            .select(Jar::as_select())
            .first(conn)
            .with_context(|| format!("could not find jar with version {:?}", version))
    }

    /// Load the contents of the jar file.
    pub fn load_blob(&self, conn: &mut SqliteConnection) -> Result<Vec<u8>> {
        jars::table
            .find(self.id)
            .select(jars::jar_file)
            .first(conn)
            .with_context(|| format!("could not load contents of jar {}", self.version))
    }
}

/// Data required to create a new `Jar`.
#[derive(Debug, Insertable)]
#[diesel(table_name = jars)]
pub struct NewJar {
    /// The tool version contained in this jar.
    pub version: String,
    /// The contents of the jar file.
    pub jar_file: Vec<u8>,
}

impl NewJar {
    /// Insert a new jar into the database. Versions are unique, and a stored
    /// jar is never replaced.
    pub fn insert(&self, conn: &mut SqliteConnection) -> Result<Jar> {
        diesel::insert_into(jars::table)
            .values(self)
            .returning(Jar::as_returning())
            .get_result(conn)
            .with_context(|| format!("error inserting jar {:?}", self.version))
    }
}
