//! Cooperative shutdown shared by every listener.
//!
//! The server owns a `watch::Sender<bool>`; each listener holds a receiver
//! and stops accepting once it flips to `true` (or the sender is dropped).
//! Per-connection tasks live in a [`JoinSet`] so the listener can give them
//! a bounded grace period and then abort whatever is left.

use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Receiver side of the shutdown signal.
pub type ShutdownRx = watch::Receiver<bool>;

/// How long in-flight connections may run after shutdown is signalled.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Resolve once shutdown has been requested.
///
/// A dropped sender counts as a shutdown request.
pub async fn signalled(rx: &mut ShutdownRx) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Wait up to `grace` for `tasks` to finish, then abort the rest.
pub async fn drain(tasks: &mut JoinSet<()>, grace: Duration, what: &str) {
    if tasks.is_empty() {
        return;
    }
    debug!("Waiting for {} {} connection(s) to finish", tasks.len(), what);

    let finished = tokio::time::timeout(grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;

    if finished.is_err() {
        warn!(
            "Aborting {} {} connection(s) still running after {:?}",
            tasks.len(),
            what,
            grace
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signalled_on_send() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { signalled(&mut rx).await });
        tx.send(true).unwrap();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_signalled_on_drop() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        signalled(&mut rx).await;
    }

    #[tokio::test]
    async fn test_drain_aborts_stragglers() {
        let mut tasks = JoinSet::new();
        tasks.spawn(async {});
        tasks.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let started = std::time::Instant::now();
        drain(&mut tasks, Duration::from_millis(50), "test").await;
        assert!(tasks.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
