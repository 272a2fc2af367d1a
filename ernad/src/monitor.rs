//! The job monitor: receives status reports from node executors.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use std::{future::Future, net::TcpListener, time::Duration};

use erna_common::{
    errors::TransitionError,
    prelude::*,
    status::{StatusReport, STATUS_PATH},
    tracing,
};

/// What every request handler gets to see.
#[derive(Clone, Debug)]
struct MonitorState {
    store: Store,
    retry_max_elapsed: Duration,
}

/// Build our HTTP routes.
pub fn router(store: Store, retry_max_elapsed: Duration) -> Router {
    Router::new()
        .route(STATUS_PATH, post(post_status))
        .with_state(MonitorState {
            store,
            retry_max_elapsed,
        })
}

/// Serve status reports on `listener` until `shutdown` completes.
pub async fn serve<F>(
    listener: TcpListener,
    store: Store,
    retry_max_elapsed: Duration,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let addr = listener.local_addr().context("listener has no local address")?;
    info!("job monitor listening on {}", addr);
    axum::Server::from_tcp(listener)
        .with_context(|| format!("could not listen on {}", addr))?
        .serve(router(store, retry_max_elapsed).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("job monitor failed")?;
    info!("job monitor stopped");
    Ok(())
}

/// Apply a status report, and acknowledge it once it has been stored.
#[tracing::instrument(skip_all, level = "debug")]
async fn post_status(
    State(state): State<MonitorState>,
    Json(report): Json<StatusReport>,
) -> Result<Json<bool>, MonitorError> {
    report.validate().map_err(MonitorError::BadRequest)?;

    let job_report = report.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        state.store.retry_transient(state.retry_max_elapsed, |conn| {
            Job::apply_status_report(&job_report, conn)
        })
    })
    .await
    .context("status update panicked")??;

    match outcome {
        ReportOutcome::Applied => info!("job {} is now {}", report.job_id, report.status),
        ReportOutcome::AlreadyApplied => {
            debug!("job {} was already {}, ignoring replay", report.job_id, report.status)
        }
    }
    Ok(Json(true))
}

/// An error we return to an executor.
#[derive(Debug)]
enum MonitorError {
    /// The report itself is malformed.
    BadRequest(Error),
    /// We couldn't apply the report.
    Other(Error),
}

impl From<Error> for MonitorError {
    fn from(err: Error) -> Self {
        MonitorError::Other(err)
    }
}

impl IntoResponse for MonitorError {
    fn into_response(self) -> Response {
        let (status, err) = match self {
            MonitorError::BadRequest(err) => (StatusCode::BAD_REQUEST, err),
            MonitorError::Other(err) if err.downcast_ref::<TransitionError>().is_some() => {
                (StatusCode::CONFLICT, err)
            }
            MonitorError::Other(err) => (StatusCode::INTERNAL_SERVER_ERROR, err),
        };
        error!("rejecting status report: {}", err.display_causes());
        (status, err.display_causes().to_string()).into_response()
    }
}
