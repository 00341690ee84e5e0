//! The interface for the service registry, which tracks live instances.

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The watcher was stopped, or the registry behind it went away.
    #[error("Watch cancelled")]
    Cancelled,

    #[error("Service not found: {0}")]
    NotFound(String),

    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Other(anyhow::Error),
}

impl Error {
    /// Returns true if this error signals a deliberate shutdown, rather than
    /// a (possibly transient) registry failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// A single running replica of a service, as reported by the registry.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceInstance {
    /// Unique identifier of this replica.
    pub id: String,
    /// Name of the service provided by this replica.
    pub name: String,
    pub version: String,
    pub metadata: BTreeMap<String, String>,
    /// Endpoint URIs, e.g. `http://10.0.0.1:8000?isSecure=false`.
    pub endpoints: Vec<String>,
}

impl ServiceInstance {
    pub fn new(id: impl ToString, name: impl ToString) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl ToString) -> Self {
        self.endpoints.push(endpoint.to_string());
        self
    }

    pub fn with_version(mut self, version: impl ToString) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_metadata(mut self, key: impl ToString, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// Announces service instances to a registry.
#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(&self, instance: ServiceInstance) -> Result<(), Error>;

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), Error>;
}

/// Finds service instances within a registry.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Returns the instances currently registered under `service_name`.
    async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>, Error>;

    /// Opens a subscription to changes of `service_name`.
    async fn watch(&self, service_name: &str) -> Result<Box<dyn Watcher>, Error>;
}

/// A long-lived subscription yielding successive snapshots of a service.
#[async_trait]
pub trait Watcher: Send + Sync {
    /// Waits for the next change and returns the full set of instances.
    ///
    /// Once [Watcher::stop] has been called this returns
    /// [Error::Cancelled]. Any other error is considered transient.
    async fn next(&self) -> Result<Vec<ServiceInstance>, Error>;

    /// Stops delivery. Calling this more than once is harmless.
    async fn stop(&self) -> Result<(), Error>;
}
