//! tether is a client-side service endpoint resolver.
//!
//! tether subscribes to a service registry, and keeps a live set of usable
//! endpoints for a single service, pushing every change to a consumer such
//! as a load-balancing HTTP client.
//!
//! It uses the following terminology:
//! * A [target::Target] names the service being resolved, parsed from a
//!   user-supplied address like `discovery:///helloworld`.
//! * Service instances ([registry::ServiceInstance]) are the records a
//!   registry hands out. Each instance advertises a list of endpoint URLs.
//! * Nodes ([resolver::Nodes]) are the instances which expose an endpoint
//!   for the transport the resolver was asked for.
//!
//! # Usage
//!
//! * The main interface for this crate is [resolver::Resolver].
//! * To construct a resolver, you must supply a [registry::Discovery] and a
//!   [resolver::Updater]. These specify "where to find instances" and "who
//!   is told about them", respectively.
//! * Two registries are provided out of the box: an in-process
//!   [registries::memory::MemoryRegistry], and a DNS-backed
//!   [registries::dns::DnsDiscovery].
//!
//! # Logging
//!
//! All logging goes through [tracing]. Background work is run within the
//! span supplied in [resolver::ResolverConfig], or a `resolver` span naming
//! the target if none is given.

// Public API
pub mod endpoint;
pub mod registry;
pub mod resolver;
pub mod target;

// Necessary for implementation
mod join;
#[cfg(test)]
mod test_utils;

// Default implementations of generic interfaces
pub mod registries;
