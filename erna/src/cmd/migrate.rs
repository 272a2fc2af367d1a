//! The `migrate` subcommand.

use erna_common::{db, prelude::*};

/// Run the `migrate` subcommand.
pub fn run(store: &Store) -> Result<()> {
    let mut conn = store.conn()?;
    db::run_pending_migrations(&mut conn)?;
    println!("job store is up to date");
    Ok(())
}
