//! End-to-end UDP flows: a real loopback datagram echo server stands in
//! for "the real server"; multiple client sockets exercise the fan-in
//! demultiplexing and the idle sweep.

use std::net::UdpSocket;
use std::thread;
use std::time::Duration;

use crusher::{Reactor, UdpCrusherBuilder};

fn echo_server() -> (UdpSocket, std::net::SocketAddr) {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind echo server");
    let addr = socket.local_addr().unwrap();
    let server = socket.try_clone().unwrap();
    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        loop {
            match server.recv_from(&mut buf) {
                Ok((n, from)) => {
                    let _ = server.send_to(&buf[..n], from);
                }
                Err(_) => return,
            }
        }
    });
    (socket, addr)
}

fn wait_until<F: Fn() -> bool>(f: F, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    f()
}

#[test]
fn round_trips_a_datagram_through_the_proxy() {
    let _ = pretty_env_logger::try_init();
    let (_server, server_addr) = echo_server();
    let reactor = Reactor::spawn().expect("spawn reactor");

    let config = UdpCrusherBuilder::new()
        .local_address("127.0.0.1:0".parse().unwrap())
        .remote_address(server_addr)
        .reactor(reactor.handle())
        .build()
        .unwrap();
    let crusher = crusher::UdpCrusher::new(config);
    crusher.open().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.send_to(b"ping", crusher.local_address()).unwrap();

    let mut buf = [0u8; 32];
    let (n, _) = client.recv_from(&mut buf).expect("read echoed datagram");
    assert_eq!(&buf[..n], b"ping");

    crusher.close();
}

#[test]
fn fans_in_multiple_client_sources_to_distinct_outer_channels() {
    let _ = pretty_env_logger::try_init();
    let (_server, server_addr) = echo_server();
    let reactor = Reactor::spawn().expect("spawn reactor");

    let config = UdpCrusherBuilder::new()
        .local_address("127.0.0.1:0".parse().unwrap())
        .remote_address(server_addr)
        .reactor(reactor.handle())
        .build()
        .unwrap();
    let crusher = crusher::UdpCrusher::new(config);
    crusher.open().unwrap();

    let clients: Vec<_> = (0..3)
        .map(|_| {
            let s = UdpSocket::bind("127.0.0.1:0").unwrap();
            s.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            s
        })
        .collect();

    for (i, client) in clients.iter().enumerate() {
        let msg = format!("client-{}", i);
        client.send_to(msg.as_bytes(), crusher.local_address()).unwrap();
    }

    for (i, client) in clients.iter().enumerate() {
        let mut buf = [0u8; 32];
        let (n, _) = client.recv_from(&mut buf).expect("read echoed datagram");
        assert_eq!(&buf[..n], format!("client-{}", i).as_bytes());
    }

    assert!(wait_until(|| crusher.outer_count() == 3, Duration::from_secs(1)));

    crusher.close();
}

#[test]
fn idle_outer_channels_are_swept_on_the_next_new_source() {
    let _ = pretty_env_logger::try_init();
    let (_server, server_addr) = echo_server();
    let reactor = Reactor::spawn().expect("spawn reactor");

    let config = UdpCrusherBuilder::new()
        .local_address("127.0.0.1:0".parse().unwrap())
        .remote_address(server_addr)
        .reactor(reactor.handle())
        .max_idle_duration(Duration::from_millis(50))
        .build()
        .unwrap();
    let crusher = crusher::UdpCrusher::new(config);
    crusher.open().unwrap();

    let first = UdpSocket::bind("127.0.0.1:0").unwrap();
    first.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    first.send_to(b"first", crusher.local_address()).unwrap();
    let mut buf = [0u8; 32];
    first.recv_from(&mut buf).unwrap();

    assert!(wait_until(|| crusher.outer_count() == 1, Duration::from_secs(1)));

    // Let the one outer channel go idle past the configured threshold.
    thread::sleep(Duration::from_millis(150));

    // The sweep only runs when a *new* source arrives, so the idle
    // channel is still counted until this second client shows up.
    let second = UdpSocket::bind("127.0.0.1:0").unwrap();
    second.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    second.send_to(b"second", crusher.local_address()).unwrap();
    second.recv_from(&mut buf).unwrap();

    assert!(wait_until(|| crusher.outer_count() == 1, Duration::from_secs(1)));

    crusher.close();
}

#[test]
fn freeze_suspends_udp_io_without_dropping_outer_channels() {
    let _ = pretty_env_logger::try_init();
    let (_server, server_addr) = echo_server();
    let reactor = Reactor::spawn().expect("spawn reactor");

    let config = UdpCrusherBuilder::new()
        .local_address("127.0.0.1:0".parse().unwrap())
        .remote_address(server_addr)
        .reactor(reactor.handle())
        .build()
        .unwrap();
    let crusher = crusher::UdpCrusher::new(config);
    crusher.open().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.send_to(b"warm up", crusher.local_address()).unwrap();
    let mut buf = [0u8; 32];
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    client.recv_from(&mut buf).unwrap();

    crusher.freeze().unwrap();
    client.send_to(b"frozen", crusher.local_address()).unwrap();
    client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    let err = client.recv_from(&mut buf).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);

    crusher.unfreeze().unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let (n, _) = client.recv_from(&mut buf).expect("reply delivered after unfreeze");
    assert_eq!(&buf[..n], b"frozen");

    crusher.close();
}
