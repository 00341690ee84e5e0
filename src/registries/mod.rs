//! Default implementations of [crate::registry::Discovery]

pub mod dns;
pub mod memory;

use crate::join::join_worker;
use crate::registry::{Error, ServiceInstance, Watcher};

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// All instances of a service at a point in time.
pub(crate) type Snapshot = Arc<Vec<ServiceInstance>>;

/// Resolves once `stopped` becomes true, or its sender goes away.
pub(crate) async fn wait_until_stopped(mut stopped: watch::Receiver<bool>) {
    let _ = stopped.wait_for(|stopped| *stopped).await.map(|_| ());
}

// A background task feeding a [SnapshotWatcher].
struct Feeder {
    handle: JoinHandle<()>,
    terminate_tx: oneshot::Sender<()>,
}

/// A [Watcher] following a watch channel of snapshots.
///
/// Each call to [Watcher::next] waits for the channel to change, and returns
/// the latest snapshot; intermediate snapshots may be skipped.
pub(crate) struct SnapshotWatcher {
    rx: tokio::sync::Mutex<watch::Receiver<Snapshot>>,
    stopped: watch::Sender<bool>,
    feeder: Mutex<Option<Feeder>>,
}

impl SnapshotWatcher {
    pub(crate) fn new(rx: watch::Receiver<Snapshot>) -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            rx: tokio::sync::Mutex::new(rx),
            stopped,
            feeder: Mutex::new(None),
        }
    }

    /// Ties the lifetime of a background task to this watcher.
    pub(crate) fn with_feeder(
        mut self,
        handle: JoinHandle<()>,
        terminate_tx: oneshot::Sender<()>,
    ) -> Self {
        self.feeder = Mutex::new(Some(Feeder {
            handle,
            terminate_tx,
        }));
        self
    }
}

#[async_trait]
impl Watcher for SnapshotWatcher {
    async fn next(&self) -> Result<Vec<ServiceInstance>, Error> {
        let stopped = wait_until_stopped(self.stopped.subscribe());
        let mut rx = self.rx.lock().await;

        tokio::select! {
            biased;
            _ = stopped => return Err(Error::Cancelled),
            changed = rx.changed() => changed.map_err(|_| Error::Cancelled)?,
        }
        let snapshot = rx.borrow_and_update().clone();
        Ok(snapshot.as_ref().clone())
    }

    async fn stop(&self) -> Result<(), Error> {
        self.stopped.send_replace(true);

        let feeder = self.feeder.lock().unwrap().take();
        if let Some(Feeder {
            handle,
            terminate_tx,
        }) = feeder
        {
            let _send_result = terminate_tx.send(());
            join_worker(handle).await;
        }
        Ok(())
    }
}

impl Drop for SnapshotWatcher {
    fn drop(&mut self) {
        let Ok(feeder) = self.feeder.get_mut() else {
            return;
        };
        if let Some(feeder) = feeder.take() {
            feeder.handle.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::http_instance;
    use std::time::Duration;

    #[tokio::test]
    async fn test_next_returns_latest_snapshot() {
        let (tx, rx) = watch::channel(Arc::new(vec![]));
        let watcher = SnapshotWatcher::new(rx);

        tx.send_replace(Arc::new(vec![http_instance("aaa", 8000)]));
        tx.send_replace(Arc::new(vec![http_instance("bbb", 8001)]));

        let instances = watcher.next().await.unwrap();
        assert_eq!(instances, vec![http_instance("bbb", 8001)]);
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_next() {
        let (_tx, rx) = watch::channel(Arc::new(vec![]));
        let watcher = Arc::new(SnapshotWatcher::new(rx));

        let pending = tokio::task::spawn({
            let watcher = watcher.clone();
            async move { watcher.next().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        watcher.stop().await.unwrap();
        assert!(pending.await.unwrap().unwrap_err().is_cancelled());

        // Stopping is idempotent, and later calls are cancelled too.
        watcher.stop().await.unwrap();
        assert!(watcher.next().await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_closed_channel_cancels() {
        let (tx, rx) = watch::channel(Arc::new(vec![]));
        let watcher = SnapshotWatcher::new(rx);
        drop(tx);
        assert!(watcher.next().await.unwrap_err().is_cancelled());
    }
}
