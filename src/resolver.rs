//! Resolves a [Target] into a live set of service instances.

use crate::endpoint;
use crate::join::join_worker;
use crate::registry::{self, Discovery, ServiceInstance, Watcher};
use crate::target::Target;

use debug_ignore::DebugIgnore;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::instrument::WithSubscriber;
use tracing::{event, instrument, Instrument, Level, Span};

/// The set of instances a resolver considers usable.
///
/// Each update replaces the whole set; it is never modified in place.
pub type Nodes = Arc<Vec<ServiceInstance>>;

/// Receives every non-empty node set produced by a [Resolver].
///
/// Updaters are invoked from a background task without any resolver lock
/// held. They may take time, but block the next registry update while they
/// run.
pub trait Updater: Send + Sync {
    fn update(&self, nodes: Nodes);
}

impl<F> Updater for F
where
    F: Fn(Nodes) + Send + Sync,
{
    fn update(&self, nodes: Nodes) {
        self(nodes)
    }
}

pub type SharedUpdater = Arc<dyn Updater>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Failed to watch service {service:?}")]
    Watch {
        service: String,
        #[source]
        source: registry::Error,
    },

    #[error("Service {service:?} did not resolve before the deadline")]
    DeadlineExceeded { service: String },

    #[error("Failed to stop watching service")]
    Stop(#[source] registry::Error),

    #[error("Resolver closed")]
    Closed,
}

/// The transport scheme instances must advertise to be usable.
pub const ENDPOINT_SCHEME: &str = "http";

/// How long the background task waits before watching again after the
/// registry returns an error.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Controls whether [Resolver::new] waits for the service to resolve.
#[derive(Clone, Debug, Default)]
pub enum ResolutionStrategy {
    /// Return immediately; nodes appear once the registry reports them.
    #[default]
    Lazy,
    /// Wait until at least one usable instance is found.
    ///
    /// Fails with [Error::DeadlineExceeded] if this takes longer than
    /// `timeout`.
    Blocking { timeout: Duration },
}

/// Configuration options to tweak resolution behavior.
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    /// Should plaintext endpoints be selected instead of TLS ones?
    ///
    /// Default: false
    pub insecure: bool,

    /// Default: [ResolutionStrategy::Lazy]
    pub resolution_strategy: ResolutionStrategy,

    /// Default: [DEFAULT_RETRY_INTERVAL]
    pub retry_interval: Duration,

    /// The span all resolver events are recorded under.
    ///
    /// Default: None, an `info` span named "resolver" is created
    pub span: Option<Span>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            insecure: false,
            resolution_strategy: ResolutionStrategy::Lazy,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            span: None,
        }
    }
}

// Applies registry snapshots to the resolver's state.
//
// During blocking construction this is driven by the caller; afterwards it
// is moved into the background task. Either way there is a single writer.
struct ResolverWorker {
    target: Target,
    watcher: Arc<dyn Watcher>,
    updater: SharedUpdater,
    nodes_tx: watch::Sender<Nodes>,
    insecure: bool,
    retry_interval: Duration,
}

impl ResolverWorker {
    // Filters a snapshot down to usable instances and publishes it.
    //
    // Returns false if nothing survived, in which case neither the updater
    // nor the node set is touched.
    #[instrument(skip_all, fields(count = instances.len()), name = "ResolverWorker::update")]
    fn update(&self, instances: Vec<ServiceInstance>) -> bool {
        let mut nodes = Vec::with_capacity(instances.len());
        for instance in instances {
            match endpoint::parse_endpoint(&instance.endpoints, ENDPOINT_SCHEME, !self.insecure) {
                Ok(Some(_)) => nodes.push(instance),
                Ok(None) => {
                    event!(
                        Level::DEBUG,
                        id = %instance.id,
                        endpoints = ?instance.endpoints,
                        "No usable endpoint, skipping instance"
                    );
                }
                Err(err) => {
                    event!(
                        Level::ERROR,
                        id = %instance.id,
                        endpoints = ?instance.endpoints,
                        ?err,
                        "Failed to parse discovery endpoint"
                    );
                }
            }
        }

        if nodes.is_empty() {
            event!(
                Level::WARN,
                service = %self.target.endpoint,
                "Zero endpoints found, refusing to update"
            );
            return false;
        }

        let nodes = Arc::new(nodes);
        self.updater.update(nodes.clone());
        self.nodes_tx.send_replace(nodes);
        true
    }

    fn has_nodes(&self) -> bool {
        !self.nodes_tx.borrow().is_empty()
    }

    // Applies snapshots until at least one usable instance is known.
    async fn resolve_initial(&self) -> Result<(), registry::Error> {
        loop {
            let instances = self.watcher.next().await?;
            self.update(instances);
            if self.has_nodes() {
                return Ok(());
            }
        }
    }

    // Waits for the first usable instance, tearing down the watcher if that
    // does not happen in time.
    //
    // On timeout the in-flight `next` call is dropped rather than awaited.
    async fn resolve_initial_with_timeout(&self, timeout: Duration) -> Result<(), Error> {
        let service = &self.target.endpoint;
        let err = match tokio::time::timeout(timeout, self.resolve_initial()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(source)) => {
                event!(Level::ERROR, %service, err = ?source, "Watching service failed");
                Error::Watch {
                    service: service.clone(),
                    source,
                }
            }
            Err(_) => {
                event!(Level::ERROR, %service, ?timeout, "Reached deadline resolving service");
                Error::DeadlineExceeded {
                    service: service.clone(),
                }
            }
        };

        if let Err(stop_err) = self.watcher.stop().await {
            event!(Level::ERROR, %service, ?stop_err, "Failed to stop watcher");
        }
        Err(err)
    }

    async fn run(self, mut terminate_rx: oneshot::Receiver<()>) {
        loop {
            let result = tokio::select! {
                _ = &mut terminate_rx => return,
                result = self.watcher.next() => result,
            };

            match result {
                Ok(instances) => {
                    self.update(instances);
                }
                Err(err) if err.is_cancelled() => return,
                Err(err) => {
                    event!(
                        Level::ERROR,
                        service = %self.target.endpoint,
                        ?err,
                        retry_in = ?self.retry_interval,
                        "Unexpected error watching service"
                    );
                    tokio::select! {
                        _ = &mut terminate_rx => return,
                        _ = tokio::time::sleep(self.retry_interval) => {},
                    }
                }
            }
        }
    }
}

/// Keeps the instances of a registry service up to date.
///
/// A background task follows the registry's [Watcher], and forwards every
/// non-empty set of usable instances to an [Updater]. Registry errors are
/// retried forever; snapshots without any usable instance are ignored, so
/// the last good node set is retained.
///
/// Call [Resolver::close] to stop watching. Dropping the resolver aborts the
/// background task, but leaves the watcher to its own cleanup.
#[derive(Debug)]
pub struct Resolver {
    target: Target,
    watcher: DebugIgnore<Arc<dyn Watcher>>,
    nodes_rx: watch::Receiver<Nodes>,
    handle: Option<JoinHandle<()>>,
    terminate_tx: Option<oneshot::Sender<()>>,
}

impl Resolver {
    /// Starts resolving `target` through `discovery`.
    ///
    /// - `target`: Its [Target::endpoint] names the service to watch.
    /// - `updater`: Receives each new node set.
    /// - `config`: Additional tweakable configuration options.
    ///
    /// Fails if the watch cannot be opened, or if a blocking
    /// [ResolutionStrategy] does not see a usable instance in time.
    pub async fn new(
        discovery: &dyn Discovery,
        target: Target,
        updater: SharedUpdater,
        config: ResolverConfig,
    ) -> Result<Self, Error> {
        let span = config
            .span
            .unwrap_or_else(|| tracing::info_span!("resolver", address = %target));

        let watcher: Arc<dyn Watcher> = discovery
            .watch(&target.endpoint)
            .instrument(span.clone())
            .await
            .map_err(|source| Error::Watch {
                service: target.endpoint.clone(),
                source,
            })?
            .into();

        let (nodes_tx, nodes_rx) = watch::channel(Arc::new(Vec::new()));
        let worker = ResolverWorker {
            target: target.clone(),
            watcher: watcher.clone(),
            updater,
            nodes_tx,
            insecure: config.insecure,
            retry_interval: config.retry_interval,
        };

        if let ResolutionStrategy::Blocking { timeout } = config.resolution_strategy {
            worker
                .resolve_initial_with_timeout(timeout)
                .instrument(span.clone())
                .await?;
        }

        let (terminate_tx, terminate_rx) = oneshot::channel();
        let handle = tokio::task::spawn(
            worker
                .run(terminate_rx)
                .instrument(span)
                .with_current_subscriber(),
        );

        Ok(Self {
            target,
            watcher: DebugIgnore(watcher),
            nodes_rx,
            handle: Some(handle),
            terminate_tx: Some(terminate_tx),
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Returns the most recent node set.
    ///
    /// Empty until the first usable snapshot arrives.
    pub fn nodes(&self) -> Nodes {
        self.nodes_rx.borrow().clone()
    }

    /// Returns a receiver to track the node set as it changes.
    pub fn monitor(&self) -> watch::Receiver<Nodes> {
        self.nodes_rx.clone()
    }

    /// Returns a stream yielding each node set published after this call.
    pub fn updates(&self) -> WatchStream<Nodes> {
        WatchStream::from_changes(self.nodes_rx.clone())
    }

    /// Stops the watcher and waits for the background task to exit.
    ///
    /// Returns the watcher's stop error, if any. Subsequent calls return
    /// [Error::Closed].
    pub async fn close(&mut self) -> Result<(), Error> {
        let (Some(handle), Some(terminate_tx)) = (self.handle.take(), self.terminate_tx.take())
        else {
            return Err(Error::Closed);
        };

        let result = self.watcher.stop().await.map_err(Error::Stop);
        let _send_result = terminate_tx.send(());
        join_worker(handle).await;
        result
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        handle.abort();
    }
}
