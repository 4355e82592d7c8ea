//! Builder-style configuration for [`TcpCrusher`](super::TcpCrusher).
//! Fluent setters accumulate onto a single record; `build()` validates it
//! once and produces an immutable [`TcpCrusherConfig`].

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{CrusherError, Result};
use crate::reactor::ReactorHandle;
use crate::tcp::pair::PairInfo;

pub const DEFAULT_BUFFER_COUNT: usize = 16;
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
pub const DEFAULT_BACKLOG: i32 = 128;

/// A listener invoked on the reactor thread exactly once per pair. Must be
/// `Send` so it can be moved from the builder's thread into the reactor
/// thread at `open()` time.
pub type PairListener = Box<dyn Fn(&PairInfo) + Send + 'static>;

pub struct TcpCrusherConfig {
    pub local_address: SocketAddr,
    pub remote_address: SocketAddr,
    pub reactor: ReactorHandle,
    pub backlog: i32,
    pub keep_alive: Option<bool>,
    pub tcp_no_delay: Option<bool>,
    pub rcv_buffer_size: Option<usize>,
    pub snd_buffer_size: Option<usize>,
    pub connection_timeout: Duration,
    pub buffer_count: usize,
    pub buffer_size: usize,
    pub creation_listener: Option<PairListener>,
    pub deletion_listener: Option<PairListener>,
}

#[derive(Default)]
pub struct TcpCrusherBuilder {
    local_address: Option<SocketAddr>,
    remote_address: Option<SocketAddr>,
    reactor: Option<ReactorHandle>,
    backlog: Option<i32>,
    keep_alive: Option<bool>,
    tcp_no_delay: Option<bool>,
    rcv_buffer_size: Option<usize>,
    snd_buffer_size: Option<usize>,
    connection_timeout: Option<Duration>,
    buffer_count: Option<usize>,
    buffer_size: Option<usize>,
    creation_listener: Option<PairListener>,
    deletion_listener: Option<PairListener>,
}

impl TcpCrusherBuilder {
    pub fn new() -> Self {
        TcpCrusherBuilder::default()
    }

    pub fn local_address(mut self, addr: SocketAddr) -> Self {
        self.local_address = Some(addr);
        self
    }

    pub fn remote_address(mut self, addr: SocketAddr) -> Self {
        self.remote_address = Some(addr);
        self
    }

    pub fn reactor(mut self, reactor: ReactorHandle) -> Self {
        self.reactor = Some(reactor);
        self
    }

    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    pub fn tcp_no_delay(mut self, no_delay: bool) -> Self {
        self.tcp_no_delay = Some(no_delay);
        self
    }

    pub fn rcv_buffer_size(mut self, size: usize) -> Self {
        self.rcv_buffer_size = Some(size);
        self
    }

    pub fn snd_buffer_size(mut self, size: usize) -> Self {
        self.snd_buffer_size = Some(size);
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    pub fn buffer_count(mut self, count: usize) -> Self {
        self.buffer_count = Some(count);
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    pub fn creation_listener<F>(mut self, f: F) -> Self
    where
        F: Fn(&PairInfo) + Send + 'static,
    {
        self.creation_listener = Some(Box::new(f));
        self
    }

    pub fn deletion_listener<F>(mut self, f: F) -> Self
    where
        F: Fn(&PairInfo) + Send + 'static,
    {
        self.deletion_listener = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Result<TcpCrusherConfig> {
        let local_address = self
            .local_address
            .ok_or_else(|| CrusherError::Configuration("localAddress is required".into()))?;
        let remote_address = self
            .remote_address
            .ok_or_else(|| CrusherError::Configuration("remoteAddress is required".into()))?;
        let reactor = self
            .reactor
            .ok_or_else(|| CrusherError::Configuration("reactor is required".into()))?;
        let buffer_count = self.buffer_count.unwrap_or(DEFAULT_BUFFER_COUNT);
        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        if buffer_count == 0 {
            return Err(CrusherError::Configuration("bufferCount must be > 0".into()));
        }
        if buffer_size == 0 {
            return Err(CrusherError::Configuration("bufferSize must be > 0".into()));
        }
        Ok(TcpCrusherConfig {
            local_address,
            remote_address,
            reactor,
            backlog: self.backlog.unwrap_or(DEFAULT_BACKLOG),
            keep_alive: self.keep_alive,
            tcp_no_delay: self.tcp_no_delay,
            rcv_buffer_size: self.rcv_buffer_size,
            snd_buffer_size: self.snd_buffer_size,
            connection_timeout: self.connection_timeout.unwrap_or(Duration::from_secs(0)),
            buffer_count,
            buffer_size,
            creation_listener: self.creation_listener,
            deletion_listener: self.deletion_listener,
        })
    }
}
