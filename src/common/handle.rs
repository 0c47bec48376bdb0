use std::{fmt::Debug, time::Duration};

use async_trait::async_trait;
use futures::{future::try_join_all, Future};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// How long shutdown waits for tasks to drain before abandoning them.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// A long-lived component run until its cancellation token fires.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    async fn run(self: Box<Self>, shutdown_token: CancellationToken) -> anyhow::Result<()>;
}

/// Spawns the given tasks and runs them until either one exits on its own
/// (treated as a fault) or the shutdown signal resolves. In both cases every
/// task is cancelled and given a bounded window to drain before the function
/// returns.
pub async fn spawn_tasks_with_shutdown<S, E>(
    tasks: impl IntoIterator<Item = Box<dyn Task>>,
    signal: S,
) where
    S: Future<Output = Result<(), E>> + Send + 'static,
    E: Debug,
{
    let shutdown_token = CancellationToken::new();
    let (shutdown_scope, mut shutdown_wait) = mpsc::channel::<()>(1);
    let mut shutdown_scope = Some(shutdown_scope);

    let handles = tasks
        .into_iter()
        .map(|task| {
            let st = shutdown_token.clone();
            let ss = shutdown_scope.clone();
            tokio::spawn(async move {
                let ret = task.run(st).await;
                drop(ss);
                ret
            })
        })
        .collect::<Vec<_>>();

    tokio::select! {
        res = try_join_all(handles) => {
            error!("Task exited unexpectedly: {res:?}");
        }
        res = signal => {
            match res {
                Ok(_) => info!("Received signal, shutting down"),
                Err(err) => error!("Error while waiting for signal: {err:?}"),
            }
        }
    }

    shutdown_token.cancel();
    shutdown_scope.take();
    if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, shutdown_wait.recv())
        .await
        .is_err()
    {
        error!("Timed out waiting for tasks to shut down");
    }
}
