//! The `job reset-walltime` subcommand.

use erna_common::prelude::*;

/// Run the `job reset-walltime` subcommand.
pub fn run(factor: f64, conn: &mut SqliteConnection) -> Result<()> {
    let reset = Job::reset_walltime_exceeded(factor, conn)?;
    println!("reset {} jobs which ran out of time", reset);
    Ok(())
}
