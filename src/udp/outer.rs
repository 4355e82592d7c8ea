//! The upstream half of a datagram flow: one per source address seen on the
//! local socket, connected to the real remote so that replies arrive
//! pre-filtered by the kernel to just that remote.

use std::collections::VecDeque;
use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use crate::reactor::Token;

/// Payloads queued per-direction beyond which new datagrams are dropped
/// rather than buffered indefinitely. NetCrusher-style UDP proxies are
/// fire-and-forget; an unbounded queue behind a slow or gone peer would
/// grow forever.
pub const PENDING_LIMIT: usize = 4096;

pub struct DatagramOuter {
    pub source_address: SocketAddr,
    pub upstream: UdpSocket,
    pub token: Token,
    /// Payloads from the client, queued to send upstream on `upstream`.
    pub pending_to_upstream: VecDeque<Vec<u8>>,
    pub last_op: Instant,
}

impl DatagramOuter {
    pub fn new(source_address: SocketAddr, upstream: UdpSocket, token: Token, now: Instant) -> DatagramOuter {
        DatagramOuter {
            source_address,
            upstream,
            token,
            pending_to_upstream: VecDeque::new(),
            last_op: now,
        }
    }

    /// Queues a payload to forward upstream on the next WRITE-ready
    /// callback. Drops and reports `false` if already at capacity.
    pub fn enqueue(&mut self, payload: Vec<u8>) -> bool {
        if self.pending_to_upstream.len() >= PENDING_LIMIT {
            return false;
        }
        self.pending_to_upstream.push_back(payload);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Token;
    use std::net::UdpSocket;

    fn make_outer() -> DatagramOuter {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        DatagramOuter::new(
            "127.0.0.1:1".parse().unwrap(),
            socket,
            Token(0),
            Instant::now(),
        )
    }

    #[test]
    fn enqueue_accepts_until_the_pending_limit_then_drops() {
        let mut outer = make_outer();
        for _ in 0..PENDING_LIMIT {
            assert!(outer.enqueue(vec![0u8]));
        }
        assert_eq!(outer.pending_to_upstream.len(), PENDING_LIMIT);
        assert!(!outer.enqueue(vec![0u8]));
        assert_eq!(outer.pending_to_upstream.len(), PENDING_LIMIT);
    }
}
