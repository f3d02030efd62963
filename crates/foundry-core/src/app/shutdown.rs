//! Shutdown signal helpers.
//!
//! The signal is a `watch::Receiver<bool>`. `true` means stop; a dropped
//! sender means the same thing.

use tokio::sync::watch;

/// Non-blocking check.
pub(crate) fn requested(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}

/// Resolves once shutdown is requested.
pub(crate) async fn wait(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn dropped_sender_counts_as_shutdown() {
        let (tx, mut rx) = watch::channel(false);
        assert!(!requested(&rx));
        drop(tx);
        assert!(requested(&rx));
        tokio::time::timeout(Duration::from_secs(1), wait(&mut rx))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn true_wakes_waiter() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
