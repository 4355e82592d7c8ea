//! Collaborator interface for pluggable byte filters. The core relay never
//! interprets a filter's output beyond presenting bytes to it in arrival
//! order and writing back whatever it returns; no built-in filters ship
//! with this crate.

use std::net::SocketAddr;

/// Transforms the bytes flowing in one direction of a pair or datagram
/// flow. Implementors may inspect, mutate, delay-and-reorder (within a
/// single call), or drop data; this crate does not constrain the
/// transform beyond the trait signature.
pub trait ByteFilter: Send + 'static {
    fn filter(&mut self, data: &mut Vec<u8>);
}

/// Looks up the filters registered for a given local/remote endpoint pair.
/// A collaborator-interface stub: neither crusher wires this in today, but
/// the trait is here for whatever owns the filter registry to implement
/// against.
pub trait FilterRepository: Send + Sync + 'static {
    fn filters_for(&self, local: SocketAddr, remote: SocketAddr) -> Vec<Box<dyn ByteFilter>>;
}

/// A repository with no registered filters; the default when a crusher is
/// not configured with one.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFilters;

impl FilterRepository for NoFilters {
    fn filters_for(&self, _local: SocketAddr, _remote: SocketAddr) -> Vec<Box<dyn ByteFilter>> {
        Vec::new()
    }
}
