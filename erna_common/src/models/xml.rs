use crate::prelude::*;
use crate::schema::*;

/// A named processing configuration, written for one specific jar.
#[derive(Associations, Clone, Debug, Identifiable, PartialEq, Queryable, Selectable, Serialize)]
#[diesel(belongs_to(Jar), table_name = xmls, check_for_backend(diesel::sqlite::Sqlite))]
pub struct Xml {
    /// The unique ID of this XML.
    pub id: i32,
    /// The name of this configuration.
    pub name: String,
    /// The XML document itself.
    pub content: String,
    /// A free-form description.
    pub comment: String,
    /// The jar this configuration was written for.
    pub jar_id: i32,
}

impl Xml {
    /// Find an XML by ID.
    pub fn find(id: i32, conn: &mut SqliteConnection) -> Result<Xml> {
        xmls::table
            .find(id)
            .first(conn)
            .with_context(|| format!("could not load xml {}", id))
    }

    /// Find the XML called `name` which was uploaded for `jar`.
    pub fn find_by_name_and_jar(name: &str, jar: &Jar, conn: &mut SqliteConnection) -> Result<Xml> {
        Xml::belonging_to(jar)
            .filter(xmls::name.eq(name))
            .first(conn)
            .with_context(|| format!("could not find xml {:?} for jar {}", name, jar.version))
    }
}

/// Data required to create a new `Xml`.
#[derive(Debug, Insertable)]
#[diesel(table_name = xmls)]
pub struct NewXml {
    /// The name of this configuration.
    pub name: String,
    /// The XML document itself.
    pub content: String,
    /// A free-form description.
    pub comment: String,
    /// The jar this configuration was written for.
    pub jar_id: i32,
}

impl NewXml {
    /// Insert a new XML into the database. Names are unique per jar.
    pub fn insert(&self, conn: &mut SqliteConnection) -> Result<Xml> {
        diesel::insert_into(xmls::table)
            .values(self)
            .get_result(conn)
            .with_context(|| format!("error inserting xml {:?}", self.name))
    }
}
