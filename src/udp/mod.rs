//! A controllable UDP proxy: a single local socket fans datagrams out to
//! per-source upstream channels, demultiplexing replies back by source
//! address. See [`inner`] for the demultiplexing core.

pub mod config;
pub mod inner;
pub mod outer;
pub mod sweeper;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;

use crate::error::{CrusherError, Result};
use crate::reactor::{ReactorCore, ReactorHandle};

pub use config::{UdpCrusherBuilder, UdpCrusherConfig};

use inner::UdpReactorState;

/// A controllable UDP proxy. Cheap to clone; every clone shares the same
/// reactor-resident state and lifecycle flags.
#[derive(Clone)]
pub struct UdpCrusher {
    id: u64,
    local_address: SocketAddr,
    remote_address: SocketAddr,
    reactor: ReactorHandle,
    open: Arc<AtomicBool>,
    frozen: Arc<AtomicBool>,
}

impl UdpCrusher {
    pub fn new(config: UdpCrusherConfig) -> UdpCrusher {
        let reactor = config.reactor.clone();
        let id = reactor.next_id();
        let local_address = config.local_address;
        let remote_address = config.remote_address;
        reactor.execute(move |core| {
            core.insert_state(id, UdpReactorState::new(config));
        });
        UdpCrusher {
            id,
            local_address,
            remote_address,
            reactor,
            open: Arc::new(AtomicBool::new(false)),
            frozen: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Binds the local socket and starts demultiplexing. An error if
    /// already open, or if the initial bind fails.
    pub fn open(&self) -> Result<()> {
        if self.open.swap(true, Ordering::SeqCst) {
            return Err(CrusherError::LifecycleState("already open"));
        }
        let id = self.id;
        let (tx, rx) = std::sync::mpsc::channel();
        self.reactor.execute(move |core| {
            let _ = tx.send(inner::start(core, id));
        });
        match rx.recv() {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.open.store(false, Ordering::SeqCst);
                Err(CrusherError::Io(e))
            }
            Err(_) => {
                self.open.store(false, Ordering::SeqCst);
                Err(CrusherError::LifecycleState("reactor is gone"))
            }
        }
    }

    /// Closes the local socket and every outer channel. Idempotent.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.frozen.store(false, Ordering::SeqCst);
        let id = self.id;
        self.reactor.execute(move |core| inner::stop(core, id));
    }

    /// Closes every channel and rebinds, preserving configuration. An
    /// error if not open.
    pub fn crush(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(CrusherError::LifecycleState("not open"));
        }
        self.frozen.store(false, Ordering::SeqCst);
        let id = self.id;
        self.reactor.execute(move |core| {
            inner::stop(core, id);
            if let Some(state) = core.state_mut::<UdpReactorState>(id) {
                state.frozen = false;
            }
            if let Err(e) = inner::start(core, id) {
                warn!("udp crush: reopen failed: {}", e);
            }
        });
        Ok(())
    }

    /// Suspends I/O on the local socket and every outer channel, leaving
    /// buffered datagrams in place. Idempotent. An error if not open.
    pub fn freeze(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(CrusherError::LifecycleState("not open"));
        }
        self.frozen.store(true, Ordering::SeqCst);
        let id = self.id;
        self.reactor.execute(move |core| freeze_all(core, id));
        Ok(())
    }

    /// Resumes I/O. Idempotent. An error if not open.
    pub fn unfreeze(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(CrusherError::LifecycleState("not open"));
        }
        self.frozen.store(false, Ordering::SeqCst);
        let id = self.id;
        self.reactor.execute(move |core| unfreeze_all(core, id));
        Ok(())
    }

    /// The number of live outer (per-source) channels, as of whenever the
    /// reactor last processed a task.
    pub fn outer_count(&self) -> usize {
        let (tx, rx) = std::sync::mpsc::channel();
        let id = self.id;
        self.reactor.execute(move |core| {
            let n = core
                .state_mut::<UdpReactorState>(id)
                .map(|s| s.outers.len())
                .unwrap_or(0);
            let _ = tx.send(n);
        });
        rx.recv().unwrap_or(0)
    }
}

fn freeze_all(core: &mut ReactorCore, id: u64) {
    use crate::reactor::Interest;
    let tokens: Vec<_> = {
        let state = match core.state_mut::<UdpReactorState>(id) {
            Some(s) => s,
            None => return,
        };
        state.frozen = true;
        let mut tokens: Vec<_> = state.outers.values().map(|o| o.token).collect();
        if let Some(t) = state.socket_token {
            tokens.push(t);
        }
        tokens
    };
    for token in tokens {
        core.clear_interest(token, Interest::READ | Interest::WRITE);
    }
}

fn unfreeze_all(core: &mut ReactorCore, id: u64) {
    use crate::reactor::Interest;
    let state = match core.state_mut::<UdpReactorState>(id) {
        Some(s) => s,
        None => return,
    };
    state.frozen = false;
    let has_pending_to_clients = !state.pending_to_clients.is_empty();
    let socket_token = state.socket_token;
    let outer_tokens: Vec<_> = state
        .outers
        .values()
        .map(|o| (o.token, !o.pending_to_upstream.is_empty()))
        .collect();

    if let Some(t) = socket_token {
        core.set_interest(t, Interest::READ);
        if has_pending_to_clients {
            core.set_interest(t, Interest::WRITE);
        }
    }
    for (token, has_pending) in outer_tokens {
        core.set_interest(token, Interest::READ);
        if has_pending {
            core.set_interest(token, Interest::WRITE);
        }
    }
}
