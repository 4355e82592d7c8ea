//! A controllable TCP proxy: accepts connections on a local address and
//! bridges each one to a remote address through the reactor, with
//! freeze/unfreeze/crush control from any thread.

pub mod acceptor;
pub mod config;
pub mod pair;
pub mod transfer;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;

use crate::error::{CrusherError, Result};
use crate::reactor::{ReactorCore, ReactorHandle};

pub use config::{TcpCrusherBuilder, TcpCrusherConfig};
pub use pair::PairInfo;

use acceptor::TcpReactorState;
use pair::SharedPair;

/// A controllable TCP proxy. Cheap to clone; every clone shares the same
/// reactor-resident state and lifecycle flags.
#[derive(Clone)]
pub struct TcpCrusher {
    id: u64,
    local_address: SocketAddr,
    remote_address: SocketAddr,
    reactor: ReactorHandle,
    open: Arc<AtomicBool>,
    frozen: Arc<AtomicBool>,
}

impl TcpCrusher {
    /// Builds the reactor-resident state from `config` but does not start
    /// accepting connections; call [`open`](TcpCrusher::open) for that.
    pub fn new(config: TcpCrusherConfig) -> TcpCrusher {
        let reactor = config.reactor.clone();
        let id = reactor.next_id();
        let local_address = config.local_address;
        let remote_address = config.remote_address;
        reactor.execute(move |core| {
            core.insert_state(id, TcpReactorState::new(config));
        });
        TcpCrusher {
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

    /// Starts listening and accepting connections. An error if already
    /// open, or if the initial bind fails.
    pub fn open(&self) -> Result<()> {
        if self.open.swap(true, Ordering::SeqCst) {
            return Err(CrusherError::LifecycleState("already open"));
        }
        let id = self.id;
        let (tx, rx) = std::sync::mpsc::channel();
        self.reactor.execute(move |core| {
            let _ = tx.send(acceptor::start_listening(core, id));
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

    /// Stops listening and closes every live pair. Idempotent: a no-op on
    /// an already-closed proxy.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        self.frozen.store(false, Ordering::SeqCst);
        let id = self.id;
        self.reactor.execute(move |core| {
            acceptor::stop_listening(core, id);
            close_all_pairs(core, id);
        });
    }

    /// Closes every live pair and reopens the listener, preserving
    /// configuration. An error if not open.
    pub fn crush(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(CrusherError::LifecycleState("not open"));
        }
        self.frozen.store(false, Ordering::SeqCst);
        let id = self.id;
        self.reactor.execute(move |core| {
            acceptor::stop_listening(core, id);
            close_all_pairs(core, id);
            if let Some(state) = core.state_mut::<TcpReactorState>(id) {
                state.frozen = false;
            }
            if let Err(e) = acceptor::start_listening(core, id) {
                warn!("tcp crush: reopen failed: {}", e);
            }
        });
        Ok(())
    }

    /// Suspends I/O on every live pair (and every pair accepted while
    /// still frozen), leaving buffered bytes in place. Idempotent. An
    /// error if not open.
    pub fn freeze(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(CrusherError::LifecycleState("not open"));
        }
        self.frozen.store(true, Ordering::SeqCst);
        let id = self.id;
        self.reactor.execute(move |core| {
            if let Some(state) = core.state_mut::<TcpReactorState>(id) {
                state.frozen = true;
            }
            for pair in snapshot_pairs(core, id) {
                pair.borrow_mut().freeze(core);
            }
        });
        Ok(())
    }

    /// Resumes I/O on every live pair. Idempotent. An error if not open.
    pub fn unfreeze(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(CrusherError::LifecycleState("not open"));
        }
        self.frozen.store(false, Ordering::SeqCst);
        let id = self.id;
        self.reactor.execute(move |core| {
            if let Some(state) = core.state_mut::<TcpReactorState>(id) {
                state.frozen = false;
            }
            for pair in snapshot_pairs(core, id) {
                pair.borrow_mut().unfreeze(core);
            }
        });
        Ok(())
    }

    /// The number of pairs currently live, as of whenever the reactor last
    /// processed a task — a snapshot, not a live count, since the caller
    /// may be on a different thread than the one mutating it.
    pub fn pair_count(&self) -> usize {
        let (tx, rx) = std::sync::mpsc::channel();
        let id = self.id;
        self.reactor.execute(move |core| {
            let n = core
                .state_mut::<TcpReactorState>(id)
                .map(|s| s.pairs.len())
                .unwrap_or(0);
            let _ = tx.send(n);
        });
        rx.recv().unwrap_or(0)
    }
}

fn snapshot_pairs(core: &mut ReactorCore, id: u64) -> Vec<SharedPair> {
    core.state_mut::<TcpReactorState>(id)
        .map(|s| s.pairs.values().cloned().collect())
        .unwrap_or_default()
}

fn close_all_pairs(core: &mut ReactorCore, id: u64) {
    for pair in snapshot_pairs(core, id) {
        pair.borrow_mut().close(core);
    }
    if let Some(state) = core.state_mut::<TcpReactorState>(id) {
        state.pairs.clear();
    }
}
