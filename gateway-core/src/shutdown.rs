//! Uniform shutdown trait dispatch.
//!
//! The router's shutdown sequence (stop reconciliation, disconnect hubs,
//! quit bus, clear auth) is one loop over components implementing these
//! traits rather than bespoke per-component teardown code.

use std::future::Future;

/// Components that can shut down immediately without awaiting anything.
pub trait SyncShutdown {
    type Result;
    fn shutdown(&mut self) -> Self::Result;
}

/// Components whose shutdown needs to await something (draining a queue,
/// sending a disconnect frame, releasing a lock).
pub trait AsyncShutdown {
    type Result;
    fn shutdown(&mut self) -> impl Future<Output = Self::Result> + Send;
}

/// Marker signalling that a graceful shutdown has been requested.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Shutdown;
