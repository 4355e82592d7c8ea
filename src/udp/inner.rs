//! Owns the single local ("inner") UDP socket shared by every source
//! address, and the set of per-source ("outer") upstream sockets it
//! demultiplexes onto. Stored in a `ReactorCore`'s `user_state`, keyed by
//! the crusher's id, exactly like [`TcpReactorState`](crate::tcp::acceptor::TcpReactorState).

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::AsRawFd;
use std::time::Instant;

use log::{trace, warn};

use crate::reactor::{Interest, ReactorCore, Token};
use crate::socket::{self, UdpOptions};

use super::config::UdpCrusherConfig;
use super::outer::DatagramOuter;
use super::sweeper;

pub struct UdpReactorState {
    pub config: UdpCrusherConfig,
    pub socket: Option<UdpSocket>,
    pub socket_token: Option<Token>,
    pub outers: HashMap<SocketAddr, DatagramOuter>,
    /// Payloads read from any outer, queued to send back through the
    /// shared local socket to the source address they arrived for.
    pub pending_to_clients: VecDeque<(SocketAddr, Vec<u8>)>,
    pub frozen: bool,
}

impl UdpReactorState {
    pub fn new(config: UdpCrusherConfig) -> UdpReactorState {
        UdpReactorState {
            config,
            socket: None,
            socket_token: None,
            outers: HashMap::new(),
            pending_to_clients: VecDeque::new(),
            frozen: false,
        }
    }

    fn udp_options(&self) -> UdpOptions {
        UdpOptions {
            recv_buffer_size: self.config.rcv_buffer_size,
            send_buffer_size: self.config.snd_buffer_size,
        }
    }
}

/// Binds the local socket and registers it for READ readiness.
pub fn start(core: &mut ReactorCore, id: u64) -> io::Result<()> {
    let (local_address, opts) = {
        let state = core.state_mut::<UdpReactorState>(id).expect("udp state missing");
        (state.config.local_address, state.udp_options())
    };
    let socket = socket::udp_bind(local_address, &opts)?;
    let fd = socket.as_raw_fd();
    let token = core.register(fd, Interest::READ, move |core, _token, fired| {
        if fired.contains(Interest::READ) {
            inner_read_ready(core, id);
        }
        if fired.contains(Interest::WRITE) {
            inner_write_ready(core, id);
        }
    });
    let state = core.state_mut::<UdpReactorState>(id).expect("udp state missing");
    state.socket = Some(socket);
    state.socket_token = Some(token);
    Ok(())
}

/// Tears down the local socket and every outer channel.
pub fn stop(core: &mut ReactorCore, id: u64) {
    let state = match core.state_mut::<UdpReactorState>(id) {
        Some(s) => s,
        None => return,
    };
    if let Some(token) = state.socket_token.take() {
        core.cancel(token);
    }
    state.socket = None;
    let outer_tokens: Vec<Token> = {
        let state = core.state_mut::<UdpReactorState>(id).unwrap();
        let tokens = state.outers.values().map(|o| o.token).collect();
        state.outers.clear();
        state.pending_to_clients.clear();
        tokens
    };
    for token in outer_tokens {
        core.cancel(token);
    }
}

fn inner_read_ready(core: &mut ReactorCore, id: u64) {
    let mut scratch = [0u8; 65_536];
    loop {
        let recv_result = {
            let state = match core.state_mut::<UdpReactorState>(id) {
                Some(s) => s,
                None => return,
            };
            let socket = match &state.socket {
                Some(s) => s,
                None => return,
            };
            socket.recv_from(&mut scratch)
        };
        match recv_result {
            Ok((n, source)) => handle_client_datagram(core, id, source, scratch[..n].to_vec()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("udp recv error: {}", e);
                return;
            }
        }
    }
}

fn inner_write_ready(core: &mut ReactorCore, id: u64) {
    loop {
        let next = {
            let state = match core.state_mut::<UdpReactorState>(id) {
                Some(s) => s,
                None => return,
            };
            match state.pending_to_clients.front() {
                Some(v) => v.clone(),
                None => {
                    core.clear_interest(state.socket_token.unwrap(), Interest::WRITE);
                    return;
                }
            }
        };
        let (dest, payload) = next;
        let send_result = {
            let state = core.state_mut::<UdpReactorState>(id).unwrap();
            match &state.socket {
                Some(s) => s.send_to(&payload, dest),
                None => return,
            }
        };
        match send_result {
            Ok(_) => {
                let state = core.state_mut::<UdpReactorState>(id).unwrap();
                state.pending_to_clients.pop_front();
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("{}: udp send error: {}", dest, e);
                let state = core.state_mut::<UdpReactorState>(id).unwrap();
                state.pending_to_clients.pop_front();
            }
        }
    }
}

fn handle_client_datagram(core: &mut ReactorCore, id: u64, source: SocketAddr, payload: Vec<u8>) {
    let has_outer = core
        .state_mut::<UdpReactorState>(id)
        .map(|s| s.outers.contains_key(&source))
        .unwrap_or(false);

    if !has_outer {
        sweeper::sweep(core, id);
        if let Err(e) = create_outer(core, id, source) {
            warn!("{}: udp outer channel setup failed: {}", source, e);
            return;
        }
    }

    let state = match core.state_mut::<UdpReactorState>(id) {
        Some(s) => s,
        None => return,
    };
    let frozen = state.frozen;
    let outer = match state.outers.get_mut(&source) {
        Some(o) => o,
        None => return,
    };
    if !outer.enqueue(payload) {
        warn!("{}: udp pending-to-upstream queue full, dropping datagram", source);
        return;
    }
    let token = outer.token;
    if !frozen {
        core.set_interest(token, Interest::WRITE);
    }
}

fn create_outer(core: &mut ReactorCore, id: u64, source: SocketAddr) -> io::Result<()> {
    let (remote_address, opts, frozen) = {
        let state = core.state_mut::<UdpReactorState>(id).unwrap();
        (state.config.remote_address, state.udp_options(), state.frozen)
    };
    let upstream = socket::udp_unbound(remote_address, &opts)?;
    upstream.connect(remote_address)?;
    let fd = upstream.as_raw_fd();
    let token = core.register(fd, Interest::READ, move |core, _token, fired| {
        if fired.contains(Interest::READ) {
            outer_read_ready(core, id, source);
        }
        if fired.contains(Interest::WRITE) {
            outer_write_ready(core, id, source);
        }
    });
    if frozen {
        core.clear_interest(token, Interest::READ);
    }
    let now = Instant::now();
    let state = core.state_mut::<UdpReactorState>(id).unwrap();
    state.outers.insert(source, DatagramOuter::new(source, upstream, token, now));
    trace!("{}: udp outer channel created", source);
    Ok(())
}

fn outer_read_ready(core: &mut ReactorCore, id: u64, source: SocketAddr) {
    let mut scratch = [0u8; 65_536];
    loop {
        let recv_result = {
            let state = match core.state_mut::<UdpReactorState>(id) {
                Some(s) => s,
                None => return,
            };
            match state.outers.get(&source) {
                Some(outer) => outer.upstream.recv(&mut scratch),
                None => return,
            }
        };
        match recv_result {
            Ok(n) => {
                let state = core.state_mut::<UdpReactorState>(id).unwrap();
                if let Some(outer) = state.outers.get_mut(&source) {
                    outer.last_op = Instant::now();
                }
                if state.pending_to_clients.len() >= super::outer::PENDING_LIMIT {
                    warn!("{}: udp pending-to-client queue full, dropping datagram", source);
                } else {
                    state.pending_to_clients.push_back((source, scratch[..n].to_vec()));
                    if let Some(token) = state.socket_token {
                        if !state.frozen {
                            core.set_interest(token, Interest::WRITE);
                        }
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                trace!("{}: udp outer recv error: {}", source, e);
                return;
            }
        }
    }
}

fn outer_write_ready(core: &mut ReactorCore, id: u64, source: SocketAddr) {
    loop {
        let next = {
            let state = match core.state_mut::<UdpReactorState>(id) {
                Some(s) => s,
                None => return,
            };
            match state.outers.get(&source) {
                Some(outer) => outer.pending_to_upstream.front().cloned(),
                None => return,
            }
        };
        let payload = match next {
            Some(p) => p,
            None => {
                let state = core.state_mut::<UdpReactorState>(id).unwrap();
                if let Some(outer) = state.outers.get(&source) {
                    core.clear_interest(outer.token, Interest::WRITE);
                }
                return;
            }
        };
        let send_result = {
            let state = core.state_mut::<UdpReactorState>(id).unwrap();
            match state.outers.get(&source) {
                Some(outer) => outer.upstream.send(&payload),
                None => return,
            }
        };
        match send_result {
            Ok(_) => {
                let state = core.state_mut::<UdpReactorState>(id).unwrap();
                if let Some(outer) = state.outers.get_mut(&source) {
                    outer.pending_to_upstream.pop_front();
                    outer.last_op = Instant::now();
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("{}: udp outer send error: {}", source, e);
                let state = core.state_mut::<UdpReactorState>(id).unwrap();
                if let Some(outer) = state.outers.get_mut(&source) {
                    outer.pending_to_upstream.pop_front();
                }
            }
        }
    }
}
