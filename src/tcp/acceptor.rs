//! Owns the listening socket: accepts one local connection, initiates a
//! nonblocking outbound connect, waits for completion (with timeout), and
//! constructs a pair on success.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;

use log::{debug, warn};

use crate::reactor::{Interest, ReactorCore, ScheduledTask, Token};
use crate::socket::{self, TcpOptions};

use super::config::TcpCrusherConfig;
use super::pair::{CreationListener, DeletionListener, PairInfo, SharedPair, TcpPair};

/// Per-crusher reactor-resident state: the listener, its live pairs, and
/// any outbound connects still in flight. Stored in a `ReactorCore`'s
/// `user_state`, keyed by the crusher's id.
pub struct TcpReactorState {
    pub config: TcpCrusherConfig,
    pub listener: Option<TcpListener>,
    pub listener_token: Option<Token>,
    pub pairs: HashMap<SocketAddr, SharedPair>,
    /// Mirrors `TcpCrusher`'s frozen flag; consulted when a new pair is
    /// constructed so connections accepted while frozen start frozen too.
    pub frozen: bool,
    creation_listener: Option<CreationListener>,
    deletion_listener: Option<DeletionListener>,
    connecting: HashMap<Token, Connecting>,
}

struct Connecting {
    inner: TcpStream,
    outer: TcpStream,
    client_addr: SocketAddr,
    timeout: Option<ScheduledTask>,
}

impl TcpReactorState {
    pub fn new(mut config: TcpCrusherConfig) -> TcpReactorState {
        // The builder's listeners are `Send` so they can cross from
        // whatever thread called `build()` into this task; converted once
        // here into the `Rc`s every pair on this reactor thread shares.
        let creation_listener = config.creation_listener.take().map(|b| {
            let b: Box<dyn Fn(&PairInfo)> = b;
            Rc::from(b) as CreationListener
        });
        let deletion_listener = config.deletion_listener.take().map(|b| {
            let b: Box<dyn Fn(&PairInfo)> = b;
            Rc::from(b) as DeletionListener
        });
        TcpReactorState {
            listener: None,
            listener_token: None,
            pairs: HashMap::new(),
            frozen: false,
            creation_listener,
            deletion_listener,
            connecting: HashMap::new(),
            config,
        }
    }

    fn tcp_options(&self) -> TcpOptions {
        TcpOptions {
            no_delay: self.config.tcp_no_delay,
            keep_alive: self.config.keep_alive,
            recv_buffer_size: self.config.rcv_buffer_size,
            send_buffer_size: self.config.snd_buffer_size,
        }
    }
}

/// Binds the listener and registers it for ACCEPT readiness. Called on the
/// reactor thread at `open()`/`crush()` time.
pub fn start_listening(core: &mut ReactorCore, id: u64) -> io::Result<()> {
    let (local_address, backlog, opts) = {
        let state = core.state_mut::<TcpReactorState>(id).expect("tcp state missing");
        (state.config.local_address, state.config.backlog, state.tcp_options())
    };
    let listener = socket::tcp_listen(local_address, backlog, &opts)?;
    let fd = listener.as_raw_fd();
    let token = core.register(fd, Interest::ACCEPT, move |core, _token, fired| {
        if fired.contains(Interest::ACCEPT) {
            accept_ready(core, id);
        }
    });
    let state = core.state_mut::<TcpReactorState>(id).expect("tcp state missing");
    state.listener = Some(listener);
    state.listener_token = Some(token);
    Ok(())
}

/// Stops accepting, drops the listener, and abandons every outbound
/// connect still in flight (without touching already-completed pairs).
/// Used by `close()`; `crush()` follows it with another `start_listening`.
pub fn stop_listening(core: &mut ReactorCore, id: u64) {
    let (token, listener, connecting) = {
        let state = match core.state_mut::<TcpReactorState>(id) {
            Some(s) => s,
            None => return,
        };
        let connecting: Vec<Token> = state.connecting.keys().copied().collect();
        (state.listener_token.take(), state.listener.take(), connecting)
    };
    if let Some(token) = token {
        core.cancel(token);
    }
    drop(listener);

    for token in connecting {
        core.cancel(token);
        let state = match core.state_mut::<TcpReactorState>(id) {
            Some(s) => s,
            None => continue,
        };
        if let Some(connecting) = state.connecting.remove(&token) {
            if let Some(t) = &connecting.timeout {
                t.cancel();
            }
            // `connecting.inner`/`connecting.outer` drop here, closing
            // both half-built sockets.
        }
    }
}

fn accept_ready(core: &mut ReactorCore, id: u64) {
    loop {
        let accept_result = {
            let state = match core.state_mut::<TcpReactorState>(id) {
                Some(s) => s,
                None => return,
            };
            let listener = match &state.listener {
                Some(l) => l,
                None => return,
            };
            listener.accept()
        };
        match accept_result {
            Ok((inner, client_addr)) => begin_connect(core, id, inner, client_addr),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                // Accept failure is transient I/O: logged, the crusher stays open.
                warn!("tcp accept error: {}", e);
                return;
            }
        }
    }
}

fn begin_connect(core: &mut ReactorCore, id: u64, inner: TcpStream, client_addr: SocketAddr) {
    let (opts, remote_address, timeout, reactor_handle) = {
        let state = core.state_mut::<TcpReactorState>(id).unwrap();
        (
            state.tcp_options(),
            state.config.remote_address,
            state.config.connection_timeout,
            state.config.reactor.clone(),
        )
    };
    if let Err(e) = socket::configure_stream(&inner, &opts) {
        warn!("{}: configuring accepted socket failed: {}", client_addr, e);
        return;
    }
    let (outer, completed) = match socket::tcp_connect_nonblocking(remote_address, &opts) {
        Ok(v) => v,
        Err(e) => {
            warn!("{}: outbound connect failed: {}", client_addr, e);
            return;
        }
    };
    if completed {
        finish_connect(core, id, inner, outer, client_addr);
        return;
    }

    let outer_fd = outer.as_raw_fd();
    let self_token: Rc<RefCell<Option<Token>>> = Rc::new(RefCell::new(None));
    let token_for_cb = self_token.clone();
    let token = core.register(outer_fd, Interest::CONNECT, move |core, _token, fired| {
        if fired.contains(Interest::CONNECT) {
            if let Some(t) = *token_for_cb.borrow() {
                connect_ready(core, id, t);
            }
        }
    });
    *self_token.borrow_mut() = Some(token);

    let timeout_task = socket::as_nonzero(timeout).map(|timeout| {
        reactor_handle.schedule(timeout, move |core| {
            connect_timed_out(core, id, token);
        })
    });

    let state = core.state_mut::<TcpReactorState>(id).unwrap();
    state.connecting.insert(
        token,
        Connecting {
            inner,
            outer,
            client_addr,
            timeout: timeout_task,
        },
    );
}

fn connect_ready(core: &mut ReactorCore, id: u64, token: Token) {
    core.cancel(token);
    let connecting = {
        let state = match core.state_mut::<TcpReactorState>(id) {
            Some(s) => s,
            None => return,
        };
        match state.connecting.remove(&token) {
            Some(c) => c,
            None => return,
        }
    };
    if let Some(t) = &connecting.timeout {
        t.cancel();
    }
    match socket::take_connect_error(&connecting.outer) {
        Ok(None) => {
            finish_connect(core, id, connecting.inner, connecting.outer, connecting.client_addr)
        }
        Ok(Some(e)) => {
            warn!("{}: outbound connect failed: {}", connecting.client_addr, e);
        }
        Err(e) => {
            warn!("{}: SO_ERROR lookup failed: {}", connecting.client_addr, e);
        }
    }
}

fn connect_timed_out(core: &mut ReactorCore, id: u64, token: Token) {
    let connecting = {
        let state = match core.state_mut::<TcpReactorState>(id) {
            Some(s) => s,
            None => return,
        };
        match state.connecting.remove(&token) {
            Some(c) => c,
            None => return,
        }
    };
    warn!("{}: outbound connect timed out", connecting.client_addr);
    core.cancel(token);
    // `connecting.inner`/`connecting.outer` drop here, closing both sockets.
}

fn finish_connect(
    core: &mut ReactorCore,
    id: u64,
    inner: TcpStream,
    outer: TcpStream,
    client_addr: SocketAddr,
) {
    let (buffer_count, buffer_size, creation_listener, deletion_listener, frozen) = {
        let state = core.state_mut::<TcpReactorState>(id).unwrap();
        (
            state.config.buffer_count,
            state.config.buffer_size,
            state.creation_listener.clone(),
            state.deletion_listener.clone(),
            state.frozen,
        )
    };

    let inner_local = match inner.local_addr() {
        Ok(a) => a,
        Err(e) => {
            warn!("{}: inner local_addr failed: {}", client_addr, e);
            return;
        }
    };
    let outer_local = match outer.local_addr() {
        Ok(a) => a,
        Err(e) => {
            warn!("{}: outer local_addr failed: {}", client_addr, e);
            return;
        }
    };
    let outer_remote = match outer.peer_addr() {
        Ok(a) => a,
        Err(e) => {
            warn!("{}: outer peer_addr failed: {}", client_addr, e);
            return;
        }
    };

    let info = PairInfo {
        key: client_addr,
        inner_local,
        inner_remote: client_addr,
        outer_local,
        outer_remote,
    };

    // The pair must exist before either registration, since both
    // callbacks capture the same `Rc<RefCell<TcpPair>>`; see the pair
    // module's cyclic-ownership design note.
    let inner_fd = inner.as_raw_fd();
    let outer_fd = outer.as_raw_fd();

    let pair = Rc::new(RefCell::new(TcpPair::new(
        info.clone(),
        inner,
        outer,
        buffer_count,
        buffer_size,
        deletion_listener,
    )));

    let pair_for_inner = pair.clone();
    let inner_token = core.register(inner_fd, Interest::READ, move |core, _token, fired| {
        pair_for_inner.borrow_mut().on_inner_event(core, fired);
        reap_if_closed(core, id, &pair_for_inner);
    });

    let pair_for_outer = pair.clone();
    let outer_token = core.register(outer_fd, Interest::READ, move |core, _token, fired| {
        pair_for_outer.borrow_mut().on_outer_event(core, fired);
        reap_if_closed(core, id, &pair_for_outer);
    });

    pair.borrow_mut().set_tokens(inner_token, outer_token);
    if frozen {
        pair.borrow_mut().freeze(core);
    }

    debug!("{}: pair created", client_addr);
    if let Some(listener) = &creation_listener {
        listener(&info);
    }

    let state = core.state_mut::<TcpReactorState>(id).unwrap();
    state.pairs.insert(client_addr, pair);
}

/// Removes a pair from the map once it has torn itself down. The pair's
/// own `close()` already cancelled its registrations and fired the
/// deletion listener; this just completes the "removes itself from the
/// Crusher's map" half of that contract, which the pair itself has no
/// access to (it doesn't know about `TcpReactorState`).
fn reap_if_closed(core: &mut ReactorCore, id: u64, pair: &SharedPair) {
    if !pair.borrow().is_closed() {
        return;
    }
    let key = pair.borrow().key();
    if let Some(state) = core.state_mut::<TcpReactorState>(id) {
        state.pairs.remove(&key);
    }
}
