//! The TCP pair state machine: two bridged sockets, two directed transfers,
//! half-close propagation, and freeze/unfreeze.
//!
//! Naming follows NetCrusher's own: "inner" is the socket accepted from the
//! local listener (the client's side), "outer" is the socket this crate
//! connected outward to the real remote (the server's side).

use std::cell::RefCell;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::rc::Rc;

use log::{debug, trace, warn};

use crate::buffer_queue::BufferQueue;
use crate::reactor::{Interest, ReactorCore, Token};

use super::transfer::{pump_read, pump_write, ReadOutcome, WriteOutcome};

/// A snapshot of a pair's identity, handed to creation/deletion listeners.
/// Cheap to clone; listeners must not assume the pair itself still exists
/// by the time they observe a `PairInfo`.
#[derive(Clone, Debug)]
pub struct PairInfo {
    pub key: SocketAddr,
    pub inner_local: SocketAddr,
    pub inner_remote: SocketAddr,
    pub outer_local: SocketAddr,
    pub outer_remote: SocketAddr,
}

pub type CreationListener = Rc<dyn Fn(&PairInfo)>;
pub type DeletionListener = Rc<dyn Fn(&PairInfo)>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PairState {
    Open,
    /// At least one side has seen read-EOF; `inner_done`/`outer_done` track
    /// whether each direction has finished draining into its peer and
    /// shut that peer's write half down. Once both are true the pair is
    /// torn down fully.
    Closing {
        inner_done: bool,
        outer_done: bool,
    },
    Closed,
}

/// Binds an accepted client socket ("inner") to a connected remote socket
/// ("outer") and relays bytes between them. See module docs for the
/// inner/outer naming.
pub struct TcpPair {
    pub info: PairInfo,
    inner: TcpStream,
    outer: TcpStream,
    inner_token: Token,
    outer_token: Token,
    /// Bytes read from `inner`, queued to write into `outer`.
    inner_to_outer: BufferQueue,
    /// Bytes read from `outer`, queued to write into `inner`.
    outer_to_inner: BufferQueue,
    state: PairState,
    frozen: bool,
    deletion_listener: Option<DeletionListener>,
}

impl TcpPair {
    /// Constructs a pair with placeholder tokens; the caller must follow
    /// up with [`set_tokens`](TcpPair::set_tokens) once both registrations
    /// exist (they in turn must be able to borrow this same pair, so the
    /// pair has to exist before either token is allocated).
    pub fn new(
        info: PairInfo,
        inner: TcpStream,
        outer: TcpStream,
        buffer_count: usize,
        buffer_size: usize,
        deletion_listener: Option<DeletionListener>,
    ) -> TcpPair {
        TcpPair {
            info,
            inner,
            outer,
            inner_token: Token(usize::MAX),
            outer_token: Token(usize::MAX),
            inner_to_outer: BufferQueue::new(buffer_count, buffer_size),
            outer_to_inner: BufferQueue::new(buffer_count, buffer_size),
            state: PairState::Open,
            frozen: false,
            deletion_listener,
        }
    }

    pub fn set_tokens(&mut self, inner_token: Token, outer_token: Token) {
        self.inner_token = inner_token;
        self.outer_token = outer_token;
    }

    pub fn key(&self) -> SocketAddr {
        self.info.key
    }

    pub fn is_closed(&self) -> bool {
        self.state == PairState::Closed
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn inner_token(&self) -> Token {
        self.inner_token
    }

    pub fn outer_token(&self) -> Token {
        self.outer_token
    }

    /// Handles a readiness callback for the inner (client-facing) socket.
    pub fn on_inner_event(&mut self, core: &mut ReactorCore, fired: Interest) {
        if fired.contains(Interest::READ) {
            self.read_inner(core);
        }
        if self.state != PairState::Closed && fired.contains(Interest::WRITE) {
            self.write_inner(core);
        }
    }

    /// Handles a readiness callback for the outer (remote-facing) socket.
    pub fn on_outer_event(&mut self, core: &mut ReactorCore, fired: Interest) {
        if fired.contains(Interest::READ) {
            self.read_outer(core);
        }
        if self.state != PairState::Closed && fired.contains(Interest::WRITE) {
            self.write_outer(core);
        }
    }

    fn read_inner(&mut self, core: &mut ReactorCore) {
        match pump_read(&mut self.inner, &mut self.inner_to_outer) {
            Ok(ReadOutcome::WouldBlock { bytes }) => {
                if bytes > 0 {
                    core.set_interest(self.outer_token, Interest::WRITE);
                }
            }
            Ok(ReadOutcome::QueueFull { bytes }) => {
                if bytes > 0 {
                    core.set_interest(self.outer_token, Interest::WRITE);
                }
                core.clear_interest(self.inner_token, Interest::READ);
            }
            Ok(ReadOutcome::Eof { bytes }) => {
                if bytes > 0 {
                    core.set_interest(self.outer_token, Interest::WRITE);
                }
                trace!("{:?}: inner read EOF", self.info.key);
                self.begin_inner_close(core);
            }
            Err(e) => {
                warn!("{:?}: inner read error: {}", self.info.key, e);
                self.fail(core);
            }
        }
    }

    fn read_outer(&mut self, core: &mut ReactorCore) {
        match pump_read(&mut self.outer, &mut self.outer_to_inner) {
            Ok(ReadOutcome::WouldBlock { bytes }) => {
                if bytes > 0 {
                    core.set_interest(self.inner_token, Interest::WRITE);
                }
            }
            Ok(ReadOutcome::QueueFull { bytes }) => {
                if bytes > 0 {
                    core.set_interest(self.inner_token, Interest::WRITE);
                }
                core.clear_interest(self.outer_token, Interest::READ);
            }
            Ok(ReadOutcome::Eof { bytes }) => {
                if bytes > 0 {
                    core.set_interest(self.inner_token, Interest::WRITE);
                }
                trace!("{:?}: outer read EOF", self.info.key);
                self.begin_outer_close(core);
            }
            Err(e) => {
                warn!("{:?}: outer read error: {}", self.info.key, e);
                self.fail(core);
            }
        }
    }

    fn write_inner(&mut self, core: &mut ReactorCore) {
        match pump_write(&mut self.inner, &mut self.outer_to_inner) {
            Ok(WriteOutcome::WouldBlock { bytes: _ }) => {}
            Ok(WriteOutcome::QueueEmpty { .. }) => {
                core.clear_interest(self.inner_token, Interest::WRITE);
                core.set_interest(self.outer_token, Interest::READ);
                self.maybe_finish_outer_close(core);
            }
        }
    }

    fn write_outer(&mut self, core: &mut ReactorCore) {
        match pump_write(&mut self.outer, &mut self.inner_to_outer) {
            Ok(WriteOutcome::WouldBlock { bytes: _ }) => {}
            Ok(WriteOutcome::QueueEmpty { .. }) => {
                core.clear_interest(self.outer_token, Interest::WRITE);
                core.set_interest(self.inner_token, Interest::READ);
                self.maybe_finish_inner_close(core);
            }
        }
    }

    /// Inner has seen read-EOF: stop reading it (its read half is spent),
    /// and shut outer's write half down as soon as everything already read
    /// from inner has been forwarded.
    fn begin_inner_close(&mut self, core: &mut ReactorCore) {
        core.clear_interest(self.inner_token, Interest::READ);
        self.state = match self.state {
            PairState::Open => PairState::Closing { inner_done: false, outer_done: false },
            s @ PairState::Closing { .. } => s,
            PairState::Closed => return,
        };
        self.maybe_finish_inner_close(core);
    }

    fn begin_outer_close(&mut self, core: &mut ReactorCore) {
        core.clear_interest(self.outer_token, Interest::READ);
        self.state = match self.state {
            PairState::Open => PairState::Closing { inner_done: false, outer_done: false },
            s @ PairState::Closing { .. } => s,
            PairState::Closed => return,
        };
        self.maybe_finish_outer_close(core);
    }

    /// Completes the inner→outer half-close once `inner_to_outer` has
    /// fully drained, by shutting outer's write half down. Only acts if
    /// inner has in fact seen EOF and this hasn't already run.
    fn maybe_finish_inner_close(&mut self, core: &mut ReactorCore) {
        let (inner_done, outer_done) = match self.state {
            PairState::Closing { inner_done, outer_done } => (inner_done, outer_done),
            _ => return,
        };
        if inner_done || !self.inner_to_outer.is_empty() {
            return;
        }
        if let Err(e) = self.outer.shutdown(Shutdown::Write) {
            trace!("{:?}: outer shutdown(Write): {}", self.info.key, e);
        }
        self.state = PairState::Closing { inner_done: true, outer_done };
        self.maybe_close(core);
    }

    fn maybe_finish_outer_close(&mut self, core: &mut ReactorCore) {
        let (inner_done, outer_done) = match self.state {
            PairState::Closing { inner_done, outer_done } => (inner_done, outer_done),
            _ => return,
        };
        if outer_done || !self.outer_to_inner.is_empty() {
            return;
        }
        if let Err(e) = self.inner.shutdown(Shutdown::Write) {
            trace!("{:?}: inner shutdown(Write): {}", self.info.key, e);
        }
        self.state = PairState::Closing { inner_done, outer_done: true };
        self.maybe_close(core);
    }

    fn maybe_close(&mut self, core: &mut ReactorCore) {
        if let PairState::Closing { inner_done: true, outer_done: true } = self.state {
            self.close(core);
        }
    }

    /// Any I/O error other than EOF is fatal: tear the pair down
    /// immediately without attempting a graceful half-close.
    fn fail(&mut self, core: &mut ReactorCore) {
        self.close(core);
    }

    /// Tears the pair down unconditionally. Idempotent.
    pub fn close(&mut self, core: &mut ReactorCore) {
        if self.state == PairState::Closed {
            return;
        }
        debug!("{:?}: pair closed", self.info.key);
        core.cancel(self.inner_token);
        core.cancel(self.outer_token);
        let _ = self.inner.shutdown(Shutdown::Both);
        let _ = self.outer.shutdown(Shutdown::Both);
        self.state = PairState::Closed;
        if let Some(listener) = &self.deletion_listener {
            listener(&self.info);
        }
    }

    /// Clears READ and WRITE interest on both registrations, leaving
    /// buffered bytes in place. Idempotent.
    pub fn freeze(&mut self, core: &mut ReactorCore) {
        if self.frozen {
            return;
        }
        core.clear_interest(self.inner_token, Interest::READ | Interest::WRITE);
        core.clear_interest(self.outer_token, Interest::READ | Interest::WRITE);
        self.frozen = true;
    }

    /// Restores READ on both sides and WRITE on each side whose outgoing
    /// queue is non-empty. Idempotent.
    pub fn unfreeze(&mut self, core: &mut ReactorCore) {
        if !self.frozen {
            return;
        }
        core.set_interest(self.inner_token, Interest::READ);
        core.set_interest(self.outer_token, Interest::READ);
        if !self.outer_to_inner.is_empty() {
            core.set_interest(self.inner_token, Interest::WRITE);
        }
        if !self.inner_to_outer.is_empty() {
            core.set_interest(self.outer_token, Interest::WRITE);
        }
        self.frozen = false;
    }
}

pub type SharedPair = Rc<RefCell<TcpPair>>;
