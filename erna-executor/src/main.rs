use erna_common::{prelude::*, status::HttpReporter, tracing_support::initialize_tracing};
use std::{env, process, time::Instant};

mod executor;

use crate::executor::{Executor, JobParams, ToolInvocation};

/// Instructions on how to use this program.
const USAGE: &str = "Usage: erna-executor

Runs one ERNA job. Everything about the job is passed in environment
variables set by the submitter.";

/// Our main entry point.
#[tokio::main]
async fn main() -> Result<()> {
    let started = Instant::now();
    initialize_tracing("erna_executor=info,erna_common=info");

    // Parse our arguments (manually, since we only have two).
    let args = env::args().collect::<Vec<_>>();
    match args.get(1).map(|arg| arg.as_str()) {
        None => {}
        Some("--version") => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            process::exit(0);
        }
        Some("--help") => {
            println!("{}", USAGE);
            process::exit(0);
        }
        Some(_) => {
            eprintln!("{}", USAGE);
            process::exit(1);
        }
    }

    let params = JobParams::from_env()?;
    debug!("job parameters: {:?}", params);

    let reporter = HttpReporter::new(&params.monitor_host, params.monitor_port)?;
    let tool = ToolInvocation::java(params.java_bin.clone());
    let executor = Executor::new(reporter, tool, started);
    let status = executor
        .run(&params)
        .await
        .with_context(|| format!("could not report status of job {}", params.job_id))?;
    if status != ProcessingState::Success {
        process::exit(1);
    }
    Ok(())
}
