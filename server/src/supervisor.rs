//! Restart-on-panic wrapper for the server's long-lived tasks

use log::{error, warn};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const RESTART_BACKOFF: Duration = Duration::from_millis(500);

/// Spawns the future built by `factory` and rebuilds it whenever it panics
///
/// A task that returns normally is not restarted. Nothing is restarted once
/// `shutdown` is cancelled. Restarts wait `RESTART_BACKOFF` plus up to half of
/// it again in random jitter.
pub fn spawn_supervised<F, Fut>(
    name: &'static str,
    shutdown: CancellationToken,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    spawn_supervised_with_backoff(name, shutdown, RESTART_BACKOFF, factory)
}

pub fn spawn_supervised_with_backoff<F, Fut>(
    name: &'static str,
    shutdown: CancellationToken,
    backoff: Duration,
    factory: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match tokio::spawn(factory()).await {
                Ok(()) => break,
                Err(e) if e.is_panic() => error!("{} task panicked, restarting", name),
                Err(e) => {
                    warn!("{} task was cancelled: {}", name, e);
                    break;
                }
            }

            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(backoff + Duration::from_millis(jitter)) => {}
            }
        }
    })
}
