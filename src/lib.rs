//! A controllable TCP/UDP proxy for fault-injection testing: accepts local
//! connections/datagrams and bridges them to a remote endpoint, with
//! runtime control to freeze, crush, or close flows, modelled after
//! NetCrusher.
//!
//! [`Reactor`] is the single-threaded event loop every [`TcpCrusher`] and
//! [`UdpCrusher`] runs on. Build one, spawn a reactor, open it:
//!
//! ```no_run
//! use crusher::{Reactor, TcpCrusherBuilder};
//!
//! let reactor = Reactor::spawn().unwrap();
//! let crusher = TcpCrusherBuilder::new()
//!     .local_address("127.0.0.1:10000".parse().unwrap())
//!     .remote_address("127.0.0.1:10001".parse().unwrap())
//!     .reactor(reactor.handle())
//!     .build()
//!     .map(crusher::TcpCrusher::new)
//!     .unwrap();
//! crusher.open().unwrap();
//! ```

pub mod buffer_queue;
pub mod error;
pub mod filter;
pub mod reactor;
pub mod socket;
pub mod tcp;
pub mod udp;

pub use error::{CrusherError, Result};
pub use filter::{ByteFilter, FilterRepository, NoFilters};
pub use reactor::{Reactor, ReactorHandle};
pub use tcp::{PairInfo, TcpCrusher, TcpCrusherBuilder, TcpCrusherConfig};
pub use udp::{UdpCrusher, UdpCrusherBuilder, UdpCrusherConfig};
