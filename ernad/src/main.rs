//! The ERNA orchestrator: submits pending jobs to the cluster and records
//! the status reports of the node executors.

use clap::Parser;
use crossbeam::channel;
use std::{net::TcpListener, sync::Arc};
use tokio::sync::oneshot;

use erna_common::{
    cluster::ClusterAdapter, config::Config, erna_common_version, prelude::*,
    tracing_support::initialize_tracing,
};

mod monitor;
mod submitter;
#[cfg(test)]
mod testing;

use submitter::{drain, Submitter};

/// Submit ERNA jobs to the cluster and keep track of them.
#[derive(Debug, Parser)]
#[command(name = "ernad", version)]
struct Opt {
    /// The config file to use. Defaults to $ERNA_CONFIG, then ./erna.yaml.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    initialize_tracing("ernad=info,erna_common=info");
    let opt = Opt::parse();
    info!("ernad {} starting", erna_common_version());

    let config = Config::load(opt.config.as_deref())?;
    let store = config.open_store()?;
    let adapter: Arc<dyn ClusterAdapter> = Arc::from(config.cluster.adapter()?);

    // The monitor runs first, so that executors of jobs queued by an
    // earlier run can reach us right away.
    let listener =
        TcpListener::bind((config.monitor.bind, config.monitor.port)).with_context(|| {
            format!(
                "could not bind to {}:{}",
                config.monitor.bind, config.monitor.port
            )
        })?;
    let (stop_monitor, monitor_stopped) = oneshot::channel::<()>();
    let mut monitor = tokio::spawn(monitor::serve(
        listener,
        store.clone(),
        config.monitor.retry_max_elapsed,
        async move {
            let _ = monitor_stopped.await;
        },
    ));

    let (stop_submitter, submitter_stopped) = channel::bounded::<()>(1);
    let submitter =
        Submitter::new(&config, store.clone(), adapter.clone()).start(submitter_stopped)?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("could not listen for ctrl-c")?;
            info!("shutting down");
        }
        result = &mut monitor => {
            // The monitor only stops on its own if it fails.
            drop(stop_submitter);
            let _ = tokio::task::spawn_blocking(move || submitter.join()).await;
            return match result.context("job monitor panicked")? {
                Ok(()) => Err(format_err!("job monitor stopped unexpectedly")),
                Err(err) => Err(err),
            };
        }
    }

    // Stop submitting before we cancel anything, or we'd be racing
    // ourselves. Keep the monitor up until the cluster is drained, so that
    // final reports still get recorded.
    drop(stop_submitter);
    let drained = tokio::task::spawn_blocking(move || -> Result<()> {
        submitter
            .join()
            .map_err(|_| format_err!("submitter thread panicked"))?;
        drain(&store, adapter.as_ref(), &config.cluster.job_prefix, &config.shutdown)
    })
    .await
    .context("shutdown panicked")?;
    if let Err(err) = &drained {
        error!("could not drain cluster jobs: {}", err.display_causes());
    }

    let _ = stop_monitor.send(());
    monitor.await.context("job monitor panicked")??;
    drained
}
