//! The single-threaded, event-driven core that every flow in this crate is
//! built on: one thread owns an `mio::Poll` and drives readiness callbacks
//! and posted tasks to completion. Nothing here knows about TCP pairs or
//! UDP demultiplexing; it only knows about raw file descriptors, interest
//! bitmasks, and closures.

mod interest;

pub use interest::Interest;
pub use mio::Token;

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, trace, warn};
use mio::unix::SourceFd;
use mio::{Events, Poll, Waker};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// A unit of work posted onto the reactor thread from any thread. Must not
/// capture anything that isn't `Send`; the actual `!Send` object graph
/// (sockets, buffer queues, `Rc<RefCell<_>>` pairs) is only ever touched
/// from inside the closure body, which only ever runs on the reactor
/// thread.
pub type Task = Box<dyn FnOnce(&mut ReactorCore) + Send>;

type Callback = Rc<RefCell<dyn FnMut(&mut ReactorCore, Token, Interest)>>;

/// The readiness multiplexer plus bookkeeping for every live registration.
/// Lives exclusively on the reactor thread; never crosses a thread
/// boundary.
pub struct ReactorCore {
    poll: Poll,
    next_token: usize,
    raw_fds: HashMap<Token, RawFd>,
    interests: HashMap<Token, Interest>,
    active: HashMap<Token, bool>,
    callbacks: HashMap<Token, Callback>,
    user_state: HashMap<u64, Box<dyn std::any::Any>>,
    shutdown: bool,
}

impl ReactorCore {
    fn new(poll: Poll) -> Self {
        ReactorCore {
            poll,
            next_token: 0,
            raw_fds: HashMap::new(),
            interests: HashMap::new(),
            active: HashMap::new(),
            callbacks: HashMap::new(),
            user_state: HashMap::new(),
            shutdown: false,
        }
    }

    /// Stores a crusher's reactor-resident state, keyed by the id it was
    /// allocated via [`ReactorHandle::next_id`]. `TcpCrusher`/`UdpCrusher`
    /// use this instead of holding the `!Send` state directly, since the
    /// facade itself must remain callable from any thread.
    pub fn insert_state<T: 'static>(&mut self, id: u64, state: T) {
        self.user_state.insert(id, Box::new(state));
    }

    pub fn state_mut<T: 'static>(&mut self, id: u64) -> Option<&mut T> {
        self.user_state.get_mut(&id).and_then(|b| b.downcast_mut::<T>())
    }

    pub fn remove_state<T: 'static>(&mut self, id: u64) -> Option<Box<T>> {
        self.user_state
            .remove(&id)
            .and_then(|b| b.downcast::<T>().ok())
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    /// Registers a raw file descriptor for the given initial interest,
    /// invoking `callback` with its own token and the fired interest
    /// subset whenever it becomes ready. Must be called from the reactor
    /// thread (i.e. from inside a callback or a posted task).
    pub fn register<F>(&mut self, fd: RawFd, interest: Interest, callback: F) -> Token
    where
        F: FnMut(&mut ReactorCore, Token, Interest) + 'static,
    {
        let token = self.alloc_token();
        self.raw_fds.insert(token, fd);
        self.interests.insert(token, Interest::empty());
        self.active.insert(token, false);
        self.callbacks.insert(token, Rc::new(RefCell::new(callback)));
        if !interest.is_empty() {
            if let Err(e) = self.apply_interest(token, interest) {
                warn!("register: initial interest application failed: {}", e);
            }
        }
        token
    }

    /// Adds `bits` to the registration's interest set, reactivating the
    /// registration with the OS poller if it was dormant (e.g. after
    /// `freeze()`).
    pub fn set_interest(&mut self, token: Token, bits: Interest) {
        let cur = self.interests.get(&token).copied().unwrap_or(Interest::empty());
        let new = cur | bits;
        if new != cur {
            if let Err(e) = self.apply_interest(token, new) {
                warn!("set_interest({:?}, {:?}) failed: {}", token, bits, e);
            }
        }
    }

    /// Removes `bits` from the registration's interest set, deregistering
    /// from the OS poller entirely if the result is empty.
    pub fn clear_interest(&mut self, token: Token, bits: Interest) {
        let cur = self.interests.get(&token).copied().unwrap_or(Interest::empty());
        let new = cur & !bits;
        if new != cur {
            if let Err(e) = self.apply_interest(token, new) {
                warn!("clear_interest({:?}, {:?}) failed: {}", token, bits, e);
            }
        }
    }

    /// The interest currently requested for `token`, if still registered.
    pub fn current_interest(&self, token: Token) -> Interest {
        self.interests.get(&token).copied().unwrap_or(Interest::empty())
    }

    fn apply_interest(&mut self, token: Token, new: Interest) -> io::Result<()> {
        let fd = *self
            .raw_fds
            .get(&token)
            .expect("apply_interest on an unknown token");
        let was_active = self.active.get(&token).copied().unwrap_or(false);
        if new.is_empty() {
            if was_active {
                self.poll.registry().deregister(&mut SourceFd(&fd))?;
                self.active.insert(token, false);
            }
        } else if was_active {
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), token, new.to_mio())?;
        } else {
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), token, new.to_mio())?;
            self.active.insert(token, true);
        }
        self.interests.insert(token, new);
        Ok(())
    }

    /// Destroys a registration: deregisters it from the poller (if still
    /// active) and drops its callback. Idempotent.
    pub fn cancel(&mut self, token: Token) {
        if let Some(fd) = self.raw_fds.remove(&token) {
            if self.active.remove(&token).unwrap_or(false) {
                if let Err(e) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
                    trace!("cancel({:?}): deregister: {}", token, e);
                }
            }
            self.interests.remove(&token);
            self.callbacks.remove(&token);
        }
    }

    /// Translates a fired `mio::event::Event` into the semantic interest
    /// bits the registration actually asked for (so ACCEPT/CONNECT are
    /// reported instead of the underlying READABLE/WRITABLE).
    fn fired_interest(&self, token: Token, event: &mio::event::Event) -> Interest {
        let requested = self.current_interest(token);
        let mut fired = Interest::empty();
        if event.is_readable() {
            fired |= requested & (Interest::READ | Interest::ACCEPT);
        }
        if event.is_writable() {
            fired |= requested & (Interest::WRITE | Interest::CONNECT);
        }
        if event.is_read_closed() || event.is_error() {
            fired |= requested & Interest::READ;
        }
        fired
    }
}

/// A cross-thread-safe capability to run work on the reactor thread.
///
/// Cloning is cheap; every clone posts to the same underlying task queue
/// and wakes the same poller.
#[derive(Clone)]
pub struct ReactorHandle {
    tasks: crossbeam_channel::Sender<Task>,
    waker: Arc<Waker>,
    ids: Arc<AtomicU64>,
}

impl ReactorHandle {
    /// Allocates a process-wide unique id. `TcpCrusher`/`UdpCrusher` use
    /// this to key their reactor-resident state (see
    /// [`ReactorCore::insert_state`]) without exposing it directly, since
    /// that state is `!Send` and the facade must remain callable from any
    /// thread.
    pub fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Runs `f` on the reactor thread, FIFO with respect to other posted
    /// tasks. Safe to call from any thread, including the reactor thread
    /// itself (where it simply enqueues for the next loop iteration).
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce(&mut ReactorCore) + Send + 'static,
    {
        if self.tasks.send(Box::new(f)).is_err() {
            trace!("execute: reactor thread is gone");
            return;
        }
        if let Err(e) = self.waker.wake() {
            trace!("execute: wakeup failed: {}", e);
        }
    }

    /// Forces the poller out of its blocking wait without posting any
    /// work, e.g. after directly mutating state the reactor thread must
    /// notice.
    pub fn wakeup(&self) {
        let _ = self.waker.wake();
    }

    /// Schedules `f` to run once, after `delay`, on the reactor thread.
    /// Implemented as a dedicated timer thread that sleeps and then hands
    /// the task off through the normal posted-task path, matching the
    /// "cooperating timer thread" option in the reactor's contract.
    /// Returns a handle that cancels the timer idempotently; cancellation
    /// after the timer has already fired is a no-op.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> ScheduledTask
    where
        F: FnOnce(&mut ReactorCore) + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let handle = self.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            if !flag.load(Ordering::SeqCst) {
                handle.execute(move |core| {
                    if !flag.load(Ordering::SeqCst) {
                        f(core);
                    }
                });
            }
        });
        ScheduledTask { cancelled }
    }
}

/// A handle to a one-shot task scheduled via [`ReactorHandle::schedule`].
#[derive(Clone)]
pub struct ScheduledTask {
    cancelled: Arc<AtomicBool>,
}

impl ScheduledTask {
    /// Cancels the pending task. Idempotent; a no-op if it already fired.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Owns the reactor thread. Dropping this stops the loop and joins the
/// thread.
pub struct Reactor {
    handle: ReactorHandle,
    join: Option<JoinHandle<()>>,
}

impl Reactor {
    /// Spawns the reactor thread and returns a controller for it. One
    /// `Reactor` multiplexes every flow in a test process; `TcpCrusher` and
    /// `UdpCrusher` instances share a `ReactorHandle` clone.
    pub fn spawn() -> io::Result<Reactor> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (tx, rx) = crossbeam_channel::unbounded::<Task>();
        let handle = ReactorHandle {
            tasks: tx,
            waker: waker.clone(),
            ids: Arc::new(AtomicU64::new(1)),
        };
        let join = thread::Builder::new()
            .name("crusher-reactor".into())
            .spawn(move || run(poll, rx))?;
        Ok(Reactor {
            handle,
            join: Some(join),
        })
    }

    /// A cloneable, `Send` capability for posting work to this reactor.
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.handle.execute(|core| core.shutdown = true);
        self.handle.wakeup();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run(poll: Poll, tasks: crossbeam_channel::Receiver<Task>) {
    let mut core = ReactorCore::new(poll);
    let mut events = Events::with_capacity(1024);
    loop {
        if core.shutdown {
            break;
        }
        match core.poll.poll(&mut events, None) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("reactor: poll failed, stopping: {}", e);
                break;
            }
        }

        while let Ok(task) = tasks.try_recv() {
            task(&mut core);
        }
        if core.shutdown {
            break;
        }

        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                continue;
            }
            let fired = core.fired_interest(token, event);
            if fired.is_empty() {
                continue;
            }
            let cb = core.callbacks.get(&token).cloned();
            if let Some(cb) = cb {
                cb.borrow_mut()(&mut core, token, fired);
            }
        }
    }
}
