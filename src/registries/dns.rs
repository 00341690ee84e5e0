//! Implementation of [Discovery] for DNS

use super::{Snapshot, SnapshotWatcher};
use crate::registry::{Discovery, Error, ServiceInstance, Watcher};

use async_trait::async_trait;
use hickory_resolver::config::LookupIpStrategy;
use hickory_resolver::config::NameServerConfig;
use hickory_resolver::config::Protocol;
use hickory_resolver::config::ResolverConfig;
use hickory_resolver::config::ResolverOpts;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use std::net::SocketAddr;
use std::net::SocketAddrV6;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{event, instrument, Instrument, Level};

/// Metadata key recording which SRV target an instance was found through.
pub const SRV_TARGET_METADATA_KEY: &str = "srv_target";

#[derive(Clone)]
struct Client {
    resolver: TokioAsyncResolver,
    config: Arc<DnsDiscoveryConfig>,
}

impl Client {
    fn new(bootstrap_servers: Vec<SocketAddr>, config: DnsDiscoveryConfig) -> Self {
        let mut rc = ResolverConfig::new();
        for address in bootstrap_servers {
            rc.add_name_server(NameServerConfig {
                socket_addr: address,
                protocol: Protocol::Udp,
                tls_dns_name: None,
                trust_negative_responses: false,
                bind_addr: None,
            });
        }
        let mut opts = ResolverOpts::default();
        opts.use_hosts_file = false;
        opts.ip_strategy = LookupIpStrategy::Ipv6Only;
        opts.negative_max_ttl = Some(Duration::from_secs(15));
        opts.timeout = config.query_timeout;
        opts.edns0 = true;
        Self {
            resolver: TokioAsyncResolver::tokio(rc, opts),
            config: Arc::new(config),
        }
    }

    fn instance(&self, service: &str, target: &str, address: SocketAddr) -> ServiceInstance {
        let query = if self.config.secure {
            "?isSecure=true"
        } else {
            ""
        };
        ServiceInstance::new(address, service)
            .with_endpoint(format!("{}://{address}{query}", self.config.scheme))
            .with_metadata(SRV_TARGET_METADATA_KEY, target)
    }

    // Looks up the SRV records of `service`, and the AAAA records of each
    // of their targets.
    //
    // Targets whose AAAA lookup fails are left out.
    #[instrument(skip(self), name = "Client::lookup")]
    async fn lookup(&self, service: &str) -> Result<Vec<ServiceInstance>, ResolveError> {
        let srv = self.resolver.srv_lookup(service).await?;
        event!(Level::DEBUG, ?srv, "Successfully looked up SRV record");

        let futures = std::iter::repeat(self.resolver.clone())
            .zip(srv.into_iter())
            .map(|(resolver, srv)| async move {
                let target = srv.target();
                let port = srv.port();
                resolver
                    .ipv6_lookup(target.clone())
                    .await
                    .map(|aaaa| (target.to_utf8(), aaaa, port))
                    .map_err(|err| (target.to_utf8(), err))
            });

        let mut instances: Vec<ServiceInstance> = futures::future::join_all(futures)
            .await
            .into_iter()
            .flat_map(|result| match result {
                Ok((target, aaaa, port)) => {
                    event!(Level::DEBUG, ?aaaa, "Successfully looked up AAAA record");
                    aaaa.into_iter()
                        .map(|ip| {
                            let address = SocketAddr::V6(SocketAddrV6::new(*ip, port, 0, 0));
                            self.instance(service, &target, address)
                        })
                        .collect::<Vec<_>>()
                }
                Err((target, err)) => {
                    event!(Level::WARN, %target, ?err, "AAAA lookup failed");
                    vec![]
                }
            })
            .collect();

        // Keep snapshots comparable across queries
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }
}

// Periodically queries DNS for one service, publishing changes.
struct DnsWatchWorker {
    client: Client,
    service: String,
    watch_tx: watch::Sender<Snapshot>,
}

impl DnsWatchWorker {
    async fn tick_and_query_dns(&self, query_interval: &mut tokio::time::Interval) {
        // If we are cancelled partway through "query_dns", resume
        // immediately the next time around; otherwise respect the interval.
        query_interval.tick().await;
        query_interval.reset_immediately();

        if self.query_dns().await {
            query_interval.reset();
        } else {
            query_interval.reset_after(self.client.config.query_retry_if_no_records_found);
        }
    }

    async fn run(self, mut terminate_rx: oneshot::Receiver<()>) {
        let mut query_interval = tokio::time::interval(self.client.config.query_interval);
        loop {
            tokio::select! {
                _ = &mut terminate_rx => return,
                _ = self.tick_and_query_dns(&mut query_interval) => {},
            }
        }
    }

    // Queries DNS and updates the published set of instances.
    //
    // Returns true if any instances were found.
    async fn query_dns(&self) -> bool {
        let instances = match self.client.lookup(&self.service).await {
            Ok(instances) => instances,
            Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                event!(Level::DEBUG, service = %self.service, "No records found");
                vec![]
            }
            Err(err) => {
                event!(Level::ERROR, service = %self.service, ?err, "DNS request failed");
                return false;
            }
        };

        let found = !instances.is_empty();
        self.watch_tx.send_if_modified(|current| {
            if **current == instances {
                return false;
            }
            *current = Arc::new(instances);
            true
        });
        found
    }
}

/// Implements [Discovery] via UDP DNS lookup.
///
/// Each service name is resolved through its SRV records, and each SRV
/// target through its AAAA records. Every address found becomes one
/// [ServiceInstance], advertising a single endpoint built from
/// [DnsDiscoveryConfig::scheme] and [DnsDiscoveryConfig::secure].
///
/// Currently only supports Ipv6 addresses.
#[derive(Clone)]
pub struct DnsDiscovery {
    client: Client,
}

impl DnsDiscovery {
    /// Creates a new DNS discovery.
    ///
    /// - `bootstrap_servers`: The DNS servers to query.
    /// - `config`: Additional tweakable configuration options.
    pub fn new(bootstrap_servers: Vec<SocketAddr>, config: DnsDiscoveryConfig) -> Self {
        Self {
            client: Client::new(bootstrap_servers, config),
        }
    }
}

#[async_trait]
impl Discovery for DnsDiscovery {
    async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>, Error> {
        match self.client.lookup(service_name).await {
            Ok(instances) if !instances.is_empty() => Ok(instances),
            Ok(_) => Err(Error::NotFound(service_name.to_string())),
            Err(err) if matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. }) => {
                Err(Error::NotFound(service_name.to_string()))
            }
            Err(err) => Err(Error::Other(err.into())),
        }
    }

    /// Starts querying DNS for `service_name` in the background.
    ///
    /// The returned watcher yields a snapshot whenever the set of instances
    /// changes. Stopping the watcher stops the queries.
    async fn watch(&self, service_name: &str) -> Result<Box<dyn Watcher>, Error> {
        let (watch_tx, watch_rx) = watch::channel(Arc::new(Vec::new()));
        let worker = DnsWatchWorker {
            client: self.client.clone(),
            service: service_name.to_string(),
            watch_tx,
        };
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let span = tracing::info_span!("dns_watch", service = %service_name);
        let handle = tokio::task::spawn(worker.run(terminate_rx).instrument(span));

        Ok(Box::new(
            SnapshotWatcher::new(watch_rx).with_feeder(handle, terminate_tx),
        ))
    }
}

// How often do we want to query the DNS servers for updates on the set of
// available instances?
pub const DEFAULT_QUERY_INTERVAL: Duration = Duration::from_secs(60);

// How often will we re-query DNS servers if they reported no instances?
pub const DEFAULT_QUERY_RETRY: Duration = Duration::from_secs(10);

// How long do we expect a healthy DNS server to take to respond?
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration options to tweak DNS discovery.
#[derive(Clone, Debug)]
pub struct DnsDiscoveryConfig {
    /// How long should we wait before re-querying DNS servers, if we found
    /// at least one instance?
    ///
    /// Default: 60 seconds
    pub query_interval: Duration,

    /// How long should we wait before re-querying DNS servers, if we found
    /// no instances?
    ///
    /// Default: 10 seconds
    pub query_retry_if_no_records_found: Duration,

    /// After starting to query a DNS server, how long until we timeout?
    ///
    /// Default: 10 seconds
    pub query_timeout: Duration,

    /// The scheme of the endpoint advertised by each instance.
    ///
    /// Default: "http"
    pub scheme: String,

    /// Should instances advertise their endpoint as `isSecure`?
    ///
    /// Default: false
    pub secure: bool,
}

impl Default for DnsDiscoveryConfig {
    fn default() -> Self {
        Self {
            query_interval: DEFAULT_QUERY_INTERVAL,
            query_retry_if_no_records_found: DEFAULT_QUERY_RETRY,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
            scheme: "http".to_string(),
            secure: false,
        }
    }
}
