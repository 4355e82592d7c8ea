//! Builder-style configuration for [`UdpCrusher`](super::UdpCrusher).

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{CrusherError, Result};
use crate::reactor::ReactorHandle;

pub struct UdpCrusherConfig {
    pub local_address: SocketAddr,
    pub remote_address: SocketAddr,
    pub reactor: ReactorHandle,
    pub rcv_buffer_size: Option<usize>,
    pub snd_buffer_size: Option<usize>,
    /// Zero means idle Outers are never swept.
    pub max_idle_duration: Duration,
}

#[derive(Default)]
pub struct UdpCrusherBuilder {
    local_address: Option<SocketAddr>,
    remote_address: Option<SocketAddr>,
    reactor: Option<ReactorHandle>,
    rcv_buffer_size: Option<usize>,
    snd_buffer_size: Option<usize>,
    max_idle_duration: Option<Duration>,
}

impl UdpCrusherBuilder {
    pub fn new() -> Self {
        UdpCrusherBuilder::default()
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

    pub fn rcv_buffer_size(mut self, size: usize) -> Self {
        self.rcv_buffer_size = Some(size);
        self
    }

    pub fn snd_buffer_size(mut self, size: usize) -> Self {
        self.snd_buffer_size = Some(size);
        self
    }

    pub fn max_idle_duration(mut self, duration: Duration) -> Self {
        self.max_idle_duration = Some(duration);
        self
    }

    pub fn build(self) -> Result<UdpCrusherConfig> {
        let local_address = self
            .local_address
            .ok_or_else(|| CrusherError::Configuration("localAddress is required".into()))?;
        let remote_address = self
            .remote_address
            .ok_or_else(|| CrusherError::Configuration("remoteAddress is required".into()))?;
        let reactor = self
            .reactor
            .ok_or_else(|| CrusherError::Configuration("reactor is required".into()))?;
        Ok(UdpCrusherConfig {
            local_address,
            remote_address,
            reactor,
            rcv_buffer_size: self.rcv_buffer_size,
            snd_buffer_size: self.snd_buffer_size,
            max_idle_duration: self.max_idle_duration.unwrap_or(Duration::from_secs(0)),
        })
    }
}
