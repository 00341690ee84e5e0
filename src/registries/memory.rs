//! Implementation of [Discovery] backed by an in-process table.

use super::{Snapshot, SnapshotWatcher};
use crate::registry::{Discovery, Error, Registrar, ServiceInstance, Watcher};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{event, Level};

/// A registry holding instances in memory.
///
/// Useful for tests, and for wiring up services which live in the same
/// process. Watchers receive the current set of instances right away, and
/// every change after that.
#[derive(Default)]
pub struct MemoryRegistry {
    services: Mutex<BTreeMap<String, watch::Sender<Snapshot>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Runs `f` on the channel for `name`, creating it if needed.
    fn with_service<T>(&self, name: &str, f: impl FnOnce(&watch::Sender<Snapshot>) -> T) -> T {
        let mut services = self.services.lock().unwrap();
        let tx = services
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(Arc::new(Vec::new())).0);
        f(tx)
    }
}

#[async_trait]
impl Registrar for MemoryRegistry {
    async fn register(&self, instance: ServiceInstance) -> Result<(), Error> {
        event!(Level::INFO, service = %instance.name, id = %instance.id, "Registering instance");
        self.with_service(&instance.name.clone(), |tx| {
            tx.send_modify(|instances| {
                let instances = Arc::make_mut(instances);
                match instances.iter_mut().find(|existing| existing.id == instance.id) {
                    Some(existing) => *existing = instance,
                    None => instances.push(instance),
                }
            });
        });
        Ok(())
    }

    async fn deregister(&self, instance: &ServiceInstance) -> Result<(), Error> {
        event!(Level::INFO, service = %instance.name, id = %instance.id, "Deregistering instance");
        self.with_service(&instance.name, |tx| {
            tx.send_if_modified(|instances| {
                let Some(index) = instances.iter().position(|existing| existing.id == instance.id)
                else {
                    return false;
                };
                Arc::make_mut(instances).remove(index);
                true
            });
        });
        Ok(())
    }
}

#[async_trait]
impl Discovery for MemoryRegistry {
    async fn get_service(&self, service_name: &str) -> Result<Vec<ServiceInstance>, Error> {
        let snapshot = self
            .services
            .lock()
            .unwrap()
            .get(service_name)
            .map(|tx| tx.borrow().clone());
        match snapshot {
            Some(instances) if !instances.is_empty() => Ok(instances.as_ref().clone()),
            _ => Err(Error::NotFound(service_name.to_string())),
        }
    }

    async fn watch(&self, service_name: &str) -> Result<Box<dyn Watcher>, Error> {
        let mut rx = self.with_service(service_name, |tx| tx.subscribe());
        rx.mark_changed();
        Ok(Box::new(SnapshotWatcher::new(rx)))
    }
}
