//! Database utilities.
//!
//! All durable state lives in one SQLite database. Every component gets a
//! [`Store`] handed to it, and checks connections out of the shared pool as
//! needed; nobody holds a connection across a sleep.

use backoff::{self, ExponentialBackoffBuilder};
use diesel::{
    connection::SimpleConnection,
    r2d2::{self, ConnectionManager, CustomizeConnection},
    result::Error as DieselError,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::{env, time::Duration};

use crate::prelude::*;
use crate::schema::processing_states;

/// Embed our migrations directly into the executable.
pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// How long SQLite should wait for a competing writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// A pool of database connections.
pub type Pool = r2d2::Pool<ConnectionManager<SqliteConnection>>;

/// A pooled database connection.
pub type PooledConnection = r2d2::PooledConnection<ConnectionManager<SqliteConnection>>;

/// Get an appropriate database URL. The environment is checked first, so the
/// configured location can be overridden for testing.
pub fn database_url(configured: Option<&str>) -> Result<String> {
    if let Ok(database_url) = env::var("DATABASE_URL") {
        return Ok(database_url);
    }
    configured
        .map(|url| url.to_owned())
        .ok_or_else(|| format_err!("no database_url configured and DATABASE_URL is not set"))
}

/// Settings applied to every connection when it is checked out of the pool.
#[derive(Debug)]
struct ConnectionSettings;

impl CustomizeConnection<SqliteConnection, r2d2::Error> for ConnectionSettings {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
            BUSY_TIMEOUT.as_millis(),
        ))
        .map_err(r2d2::Error::QueryError)
    }
}

/// The job store: a handle to our database. Cloning it is cheap and shares
/// the underlying pool.
#[derive(Clone)]
pub struct Store {
    pool: Pool,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("connections", &self.pool.state().connections)
            .finish()
    }
}

impl Store {
    /// Open the store at `database_url`, run any pending migrations and make
    /// sure our processing states are present.
    pub fn open(database_url: &str) -> Result<Store> {
        Store::open_with_pool_size(database_url, 8)
    }

    /// Like [`Store::open`], but with an explicit connection pool size.
    #[instrument(level = "debug")]
    pub fn open_with_pool_size(database_url: &str, pool_size: u32) -> Result<Store> {
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = r2d2::Pool::builder()
            .max_size(pool_size)
            .connection_customizer(Box::new(ConnectionSettings))
            .build(manager)
            .with_context(|| format!("error connecting to {}", database_url))?;
        let store = Store { pool };

        let mut conn = store.conn()?;
        conn.batch_execute("PRAGMA journal_mode = WAL;")
            .context("could not enable write-ahead logging")?;
        run_pending_migrations(&mut conn)?;
        ProcessingState::seed(&mut conn)?;
        Ok(store)
    }

    /// Check a connection out of the pool.
    pub fn conn(&self) -> Result<PooledConnection> {
        self.pool
            .get()
            .context("could not get a database connection from the pool")
    }

    /// Run `f` with a fresh connection. If it fails with a transient error
    /// (no connection available, database busy), check out a new connection
    /// and try again, until `max_elapsed` has passed. Permanent errors are
    /// returned immediately.
    pub fn retry_transient<T, F>(&self, max_elapsed: Duration, mut f: F) -> Result<T>
    where
        F: FnMut(&mut SqliteConnection) -> Result<T>,
    {
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(100))
            .with_max_elapsed_time(Some(max_elapsed))
            .build();
        let operation = || -> Result<T, backoff::Error<Error>> {
            let mut conn = self.conn().map_err(backoff::Error::transient)?;
            f(&mut *conn).map_err(|err| {
                if is_transient(&err) {
                    backoff::Error::transient(err)
                } else {
                    backoff::Error::permanent(err)
                }
            })
        };
        let notify = |err: Error, wait: Duration| {
            warn!(
                "transient database error, retrying in {:?}: {}",
                wait,
                err.display_causes()
            );
        };
        backoff::retry_notify(backoff, operation, notify).map_err(|err| match err {
            backoff::Error::Permanent(err) => err,
            backoff::Error::Transient { err, .. } => err,
        })
    }
}

/// Is this an error which might go away if we try again?
pub fn is_transient(err: &Error) -> bool {
    err.chain().any(|cause| {
        if cause.downcast_ref::<r2d2::PoolError>().is_some() {
            return true;
        }
        match cause.downcast_ref::<DieselError>() {
            Some(DieselError::DatabaseError(_, info)) => {
                let message = info.message().to_ascii_lowercase();
                message.contains("locked") || message.contains("busy")
            }
            _ => false,
        }
    })
}

/// Did this fail because a row with the same unique key already exists?
pub fn is_unique_violation(err: &Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<DieselError>(),
            Some(DieselError::DatabaseError(
                diesel::result::DatabaseErrorKind::UniqueViolation,
                _
            ))
        )
    })
}

/// Run any pending migrations.
pub fn run_pending_migrations(conn: &mut SqliteConnection) -> Result<()> {
    debug!("running pending migrations");
    let applied = conn
        .run_pending_migrations(MIGRATIONS)
        .map_err(|err| format_err!("could not run migrations: {}", err))?;
    for version in applied {
        info!("applied migration {}", version);
    }
    Ok(())
}

impl ProcessingState {
    /// Insert our processing states if they are missing, and check that the
    /// ones already present agree with this build.
    pub fn seed(conn: &mut SqliteConnection) -> Result<()> {
        for state in ProcessingState::ALL {
            diesel::insert_or_ignore_into(processing_states::table)
                .values((
                    processing_states::id.eq(state.id()),
                    processing_states::description.eq(state.description()),
                ))
                .execute(conn)
                .with_context(|| format!("could not seed processing state {}", state))?;
        }
        let rows = processing_states::table
            .select((processing_states::id, processing_states::description))
            .order(processing_states::id)
            .load::<(i32, String)>(conn)
            .context("could not load processing states")?;
        for (id, description) in rows {
            let state = ProcessingState::from_id(id)?;
            if state.description() != description {
                return Err(format_err!(
                    "processing state {} is {:?} in the database, expected {:?}",
                    id,
                    description,
                    state.description(),
                ));
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::TestStore;
    use super::*;

    #[test]
    fn opening_twice_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let url = dir.path().join("erna.sqlite");
        let url = url.to_str().unwrap();
        Store::open(url).unwrap();
        let store = Store::open(url).unwrap();
        let count = processing_states::table
            .count()
            .get_result::<i64>(&mut store.conn().unwrap())
            .unwrap();
        assert_eq!(count, ProcessingState::ALL.len() as i64);
    }

    #[test]
    fn foreign_keys_are_enforced() {
        let test = TestStore::new();
        let mut conn = test.conn();
        let result = conn.batch_execute(
            "INSERT INTO xmls (name, content, comment, jar_id) VALUES ('std', '<xml/>', '', 42);",
        );
        assert!(result.is_err());
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let test = TestStore::new();
        let mut calls = 0;
        let result: Result<()> = test.store.retry_transient(Duration::from_secs(5), |_| {
            calls += 1;
            Err(format_err!("no such job"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn transient_errors_are_retried_until_they_clear() {
        let test = TestStore::new();
        let mut calls = 0;
        let result = test.store.retry_transient(Duration::from_secs(5), |_| {
            calls += 1;
            if calls == 1 {
                Err(DieselError::DatabaseError(
                    diesel::result::DatabaseErrorKind::Unknown,
                    Box::new("database is locked".to_owned()),
                )
                .into())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }
}
