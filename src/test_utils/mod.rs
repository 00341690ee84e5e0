//! Utilities to help with testing tether

use crate::registries::wait_until_stopped;
use crate::registry::{Discovery, Error, ServiceInstance, Watcher};
use crate::resolver::{Nodes, Updater};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

pub fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    // Many tests share a process; only the first one installs the subscriber.
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// An instance of "helloworld" reachable over plaintext HTTP on localhost.
pub fn http_instance(id: impl ToString, port: u16) -> ServiceInstance {
    ServiceInstance::new(id, "helloworld").with_endpoint(format!("http://127.0.0.1:{port}"))
}

/// An instance of "helloworld" which only exposes a gRPC endpoint.
pub fn grpc_instance(id: impl ToString, port: u16) -> ServiceInstance {
    ServiceInstance::new(id, "helloworld").with_endpoint(format!("grpc://127.0.0.1:{port}"))
}

/// An [Updater] which remembers every node set it was handed.
#[derive(Default)]
pub struct RecordingUpdater {
    updates: Mutex<Vec<Nodes>>,
}

impl RecordingUpdater {
    pub fn updates(&self) -> Vec<Nodes> {
        self.updates.lock().unwrap().clone()
    }
}

impl Updater for RecordingUpdater {
    fn update(&self, nodes: Nodes) {
        assert!(!nodes.is_empty(), "Updaters should never see an empty set");
        self.updates.lock().unwrap().push(nodes);
    }
}

type Batch = Result<Vec<ServiceInstance>, Error>;

struct Script {
    tx: mpsc::UnboundedSender<Batch>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Batch>>>,
    watched: Mutex<Vec<String>>,
    stop_count: AtomicUsize,
    fail_watch: AtomicBool,
    fail_stop: AtomicBool,
}

/// A test-only registry whose watchers return pre-scripted results.
///
/// Results are handed out in the order they were pushed, one per call to
/// [Watcher::next]. With nothing queued, `next` waits until a result is
/// pushed or the watcher is stopped.
#[derive(Clone)]
pub struct ScriptedDiscovery {
    script: Arc<Script>,
}

impl ScriptedDiscovery {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            script: Arc::new(Script {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
                watched: Mutex::new(vec![]),
                stop_count: AtomicUsize::new(0),
                fail_watch: AtomicBool::new(false),
                fail_stop: AtomicBool::new(false),
            }),
        }
    }

    /// Returns a watcher over the script, without going through
    /// [Discovery::watch].
    pub fn watcher(&self) -> ScriptedWatcher {
        let (stopped, _) = watch::channel(false);
        ScriptedWatcher {
            script: self.script.clone(),
            stopped,
        }
    }

    pub fn push_instances(&self, instances: Vec<ServiceInstance>) {
        let _ = self.script.tx.send(Ok(instances));
    }

    pub fn push_error(&self, err: Error) {
        let _ = self.script.tx.send(Err(err));
    }

    /// Number of calls to [Watcher::stop], across all watchers.
    pub fn stop_count(&self) -> usize {
        self.script.stop_count.load(Ordering::SeqCst)
    }

    /// Makes every later call to [Discovery::watch] fail.
    pub fn fail_watch(&self) {
        self.script.fail_watch.store(true, Ordering::SeqCst);
    }

    /// Makes every later call to [Watcher::stop] fail.
    pub fn fail_stop(&self) {
        self.script.fail_stop.store(true, Ordering::SeqCst);
    }

    pub fn watched_services(&self) -> Vec<String> {
        self.script.watched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Discovery for ScriptedDiscovery {
    async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>, Error> {
        Err(Error::NotFound(service_name.to_string()))
    }

    async fn watch(&self, service_name: &str) -> Result<Box<dyn Watcher>, Error> {
        self.script
            .watched
            .lock()
            .unwrap()
            .push(service_name.to_string());
        if self.script.fail_watch.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("watch refused".to_string()));
        }
        Ok(Box::new(self.watcher()))
    }
}

pub struct ScriptedWatcher {
    script: Arc<Script>,
    stopped: watch::Sender<bool>,
}

#[async_trait]
impl Watcher for ScriptedWatcher {
    async fn next(&self) -> Result<Vec<ServiceInstance>, Error> {
        let stopped = wait_until_stopped(self.stopped.subscribe());
        let mut rx = self.script.rx.lock().await;

        tokio::select! {
            biased;
            _ = stopped => Err(Error::Cancelled),
            batch = rx.recv() => batch.unwrap_or(Err(Error::Cancelled)),
        }
    }

    async fn stop(&self) -> Result<(), Error> {
        self.script.stop_count.fetch_add(1, Ordering::SeqCst);
        self.stopped.send_replace(true);
        if self.script.fail_stop.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("stop refused".to_string()));
        }
        Ok(())
    }
}
