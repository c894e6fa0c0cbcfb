use std::future::pending;

use metrics::counter;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::error::TransportError;
use crate::metrics_consts::HANDLES_CLOSED;

/// Resolves at `deadline`, never if there is none
pub(crate) async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

/// Resolves when the caller's token fires, never if there is none
pub(crate) async fn cancelled_by(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => pending().await,
    }
}

/// Close a session on the blocking pool, tracked so shutdown can wait for it.
///
/// Close failures are logged and swallowed: shutdown must not fail.
pub(crate) fn close_in_background<F>(tasks: &TaskTracker, topic: &str, kind: &'static str, close: F)
where
    F: FnOnce() -> Result<(), TransportError> + Send + 'static,
{
    let topic = topic.to_string();
    let run = move || match close() {
        Ok(()) => {
            counter!(HANDLES_CLOSED, "topic" => topic.clone(), "kind" => kind).increment(1);
            debug!(topic = %topic, kind, "handle closed");
        }
        Err(e) => {
            error!(topic = %topic, kind, error = %e, "err during handle closing");
        }
    };

    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            tasks.spawn_blocking_on(run, &runtime);
        }
        // Dropped outside any runtime, nothing to hand the work to
        Err(_) => run(),
    }
}
