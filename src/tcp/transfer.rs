//! One direction of a [`TcpPair`](super::pair::TcpPair): "read this socket
//! into a queue" and "drain a queue into this socket". Deliberately owns
//! nothing — no socket, no queue, no registration handle — so the cyclic
//! reference a pair's two directions would otherwise need (each must
//! toggle the other's interest) never exists. [`TcpPair`](super::pair::TcpPair)
//! owns both sockets, both queues and both registrations; these functions
//! just operate on borrows of them, one reactor callback at a time.

use std::io::{self, Read, Write};
use std::net::TcpStream;

use log::trace;

use crate::buffer_queue::BufferQueue;

/// Outcome of pumping bytes from a socket into a queue.
pub enum ReadOutcome {
    /// The socket would block; `n` bytes were moved into the queue first.
    WouldBlock { bytes: usize },
    /// The queue filled before the socket ran dry; `n` bytes were moved.
    QueueFull { bytes: usize },
    /// The peer closed its write half; `n` bytes were moved before EOF.
    Eof { bytes: usize },
}

/// Outcome of pumping bytes from a queue into a socket.
pub enum WriteOutcome {
    /// The socket would block; `n` bytes were drained first.
    WouldBlock { bytes: usize },
    /// The queue emptied; `n` bytes were drained.
    QueueEmpty { bytes: usize },
}

/// Reads `socket` into `queue` until it would block, the queue fills, or
/// EOF is observed. Never blocks.
pub fn pump_read(socket: &mut TcpStream, queue: &mut BufferQueue) -> io::Result<ReadOutcome> {
    let mut total = 0usize;
    loop {
        let buf = match queue.reserve_for_write() {
            Some(buf) => buf,
            None => return Ok(ReadOutcome::QueueFull { bytes: total }),
        };
        let spare = buf.spare_mut();
        if spare.is_empty() {
            // the reserved buffer is already full; queue.reserve_for_write
            // only hands back a full tail when capacity is exhausted, which
            // is reported as QueueFull above, so this should not happen.
            return Ok(ReadOutcome::QueueFull { bytes: total });
        }
        match socket.read(spare) {
            Ok(0) => {
                trace!("pump_read: eof after {} bytes", total);
                return Ok(ReadOutcome::Eof { bytes: total });
            }
            Ok(n) => {
                buf.commit_written(n);
                total += n;
                trace!("pump_read: {} bytes", n);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(ReadOutcome::WouldBlock { bytes: total });
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Drains `queue` into `socket` until it would block or the queue empties.
/// Never blocks.
pub fn pump_write(socket: &mut TcpStream, queue: &mut BufferQueue) -> io::Result<WriteOutcome> {
    let mut total = 0usize;
    loop {
        let buf = match queue.head_for_drain() {
            Some(buf) => buf,
            None => return Ok(WriteOutcome::QueueEmpty { bytes: total }),
        };
        match socket.write(buf.filled()) {
            Ok(0) => return Ok(WriteOutcome::WouldBlock { bytes: total }),
            Ok(n) => {
                buf.consume(n);
                total += n;
                trace!("pump_write: {} bytes", n);
                if buf.is_empty() {
                    queue.advance_head();
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(WriteOutcome::WouldBlock { bytes: total });
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream as StdTcpStream};

    fn connected_pair() -> (StdTcpStream, StdTcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server)
    }

    #[test]
    fn pump_read_moves_available_bytes_then_would_block() {
        let (mut a, mut b) = connected_pair();
        b.write_all(b"hello").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut queue = BufferQueue::new(4, 64);
        match pump_read(&mut a, &mut queue).unwrap() {
            ReadOutcome::WouldBlock { bytes } => assert_eq!(bytes, 5),
            _ => panic!("expected WouldBlock"),
        }
        assert_eq!(queue.pending_bytes(), 5);
    }

    #[test]
    fn pump_read_reports_eof() {
        let (a, mut b) = connected_pair();
        drop(a);
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut queue = BufferQueue::new(4, 64);
        match pump_read(&mut b, &mut queue).unwrap() {
            ReadOutcome::Eof { bytes } => assert_eq!(bytes, 0),
            _ => panic!("expected Eof"),
        }
    }

    #[test]
    fn pump_write_drains_queue_into_socket() {
        let (mut a, mut b) = connected_pair();
        let mut queue = BufferQueue::new(4, 64);
        {
            let buf = queue.reserve_for_write().unwrap();
            buf.spare_mut()[..3].copy_from_slice(b"abc");
            buf.commit_written(3);
        }
        match pump_write(&mut a, &mut queue).unwrap() {
            WriteOutcome::QueueEmpty { bytes } => assert_eq!(bytes, 3),
            _ => panic!("expected QueueEmpty"),
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut received = [0u8; 3];
        b.read_exact(&mut received).unwrap();
        assert_eq!(&received, b"abc");
    }
}
