//! End-to-end tunnel tests: both proxies pumped on threads, joined by a
//! socketpair standing in for the virtio-serial link, with real TCP
//! upstreams behind the host side.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use vioduct::config::Limits;
use vioduct::endpoint::Endpoint;
use vioduct::guest::GuestProxy;
use vioduct::host::HostProxy;
use vioduct::transport::LoopState;

const CLIENT_TIMEOUT: Duration = Duration::from_secs(5);

struct Tunnel {
    socks_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    guest: Option<thread::JoinHandle<()>>,
    host: Option<thread::JoinHandle<()>>,
}

fn start_tunnel(limits: Limits) -> Tunnel {
    let (guest_end, host_end) = UnixStream::pair().expect("failed to create transport pair");
    let mut guest =
        GuestProxy::new("127.0.0.1:0".parse().unwrap(), Endpoint::from(guest_end), limits)
            .expect("failed to start guest proxy");
    let socks_addr = guest.local_addr().expect("failed to fetch socks addr");
    let mut host =
        HostProxy::new(Endpoint::from(host_end), limits).expect("failed to start host proxy");

    let stop = Arc::new(AtomicBool::new(false));
    let guest_stop = Arc::clone(&stop);
    let host_stop = Arc::clone(&stop);
    let guest = thread::spawn(move || {
        while !guest_stop.load(Ordering::Relaxed) {
            match guest.poll_once(Some(Duration::from_millis(2))) {
                Ok(LoopState::Running) => {}
                Ok(LoopState::TransportClosed) | Err(_) => break,
            }
        }
    });
    let host = thread::spawn(move || {
        while !host_stop.load(Ordering::Relaxed) {
            match host.poll_once(Some(Duration::from_millis(2))) {
                Ok(LoopState::Running) => {}
                Ok(LoopState::TransportClosed) | Err(_) => break,
            }
        }
    });

    Tunnel { socks_addr, stop, guest: Some(guest), host: Some(host) }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.guest.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.host.take() {
            let _ = handle.join();
        }
    }
}

fn socks_client(addr: SocketAddr) -> TcpStream {
    let stream = TcpStream::connect(addr).expect("failed to reach socks listener");
    stream.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
    stream.set_nodelay(true).unwrap();
    stream
}

fn negotiate(stream: &mut TcpStream) {
    stream.write_all(&[0x05, 0x01, 0x00]).unwrap();
    let mut reply = [0_u8; 2];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [0x05, 0x00]);
}

fn expect_success_reply(stream: &mut TcpStream) {
    let mut reply = [0_u8; 10];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
}

fn connect_ipv4(stream: &mut TcpStream, target: SocketAddr) {
    let SocketAddr::V4(v4) = target else {
        panic!("ipv4 target expected");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    stream.write_all(&request).unwrap();
    expect_success_reply(stream);
}

/// One-shot upstream that expects `expect`, answers `answer`, then waits
/// for client EOF.
fn spawn_scripted_upstream(
    expect: &'static [u8],
    answer: &'static [u8],
) -> (SocketAddr, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind upstream");
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("upstream accept");
        stream.set_read_timeout(Some(CLIENT_TIMEOUT)).unwrap();
        let mut buf = vec![0_u8; expect.len()];
        stream.read_exact(&mut buf).expect("upstream read");
        assert_eq!(buf, expect);
        stream.write_all(answer).expect("upstream write");
        let _ = stream.read(&mut [0_u8; 1]);
    });
    (addr, handle)
}

#[test]
fn ipv4_connect_relays_both_directions() {
    let tunnel = start_tunnel(Limits::default());
    let (upstream_addr, upstream) = spawn_scripted_upstream(b"PING", b"PONG");

    let mut client = socks_client(tunnel.socks_addr);
    negotiate(&mut client);
    connect_ipv4(&mut client, upstream_addr);

    client.write_all(b"PING").unwrap();
    let mut answer = [0_u8; 4];
    client.read_exact(&mut answer).unwrap();
    assert_eq!(&answer, b"PONG");

    drop(client);
    upstream.join().expect("upstream thread panicked");
}

#[test]
fn domain_connect_resolves_and_relays() {
    let tunnel = start_tunnel(Limits::default());
    let (upstream_addr, upstream) = spawn_scripted_upstream(b"GET", b"OK!");

    let mut client = socks_client(tunnel.socks_addr);
    negotiate(&mut client);
    let mut request = vec![0x05, 0x01, 0x00, 0x03, 0x09];
    request.extend_from_slice(b"localhost");
    request.extend_from_slice(&upstream_addr.port().to_be_bytes());
    client.write_all(&request).unwrap();
    expect_success_reply(&mut client);

    client.write_all(b"GET").unwrap();
    let mut answer = [0_u8; 3];
    client.read_exact(&mut answer).unwrap();
    assert_eq!(&answer, b"OK!");

    drop(client);
    upstream.join().expect("upstream thread panicked");
}

#[test]
fn upstream_half_close_reaches_the_client() {
    let tunnel = start_tunnel(Limits::default());
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let upstream = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"ten__bytes").unwrap();
    });

    let mut client = socks_client(tunnel.socks_addr);
    negotiate(&mut client);
    connect_ipv4(&mut client, addr);

    let mut got = Vec::new();
    client.read_to_end(&mut got).unwrap();
    assert_eq!(got, b"ten__bytes");
    upstream.join().unwrap();

    // The slot is free again: a fresh stream through the same tunnel works.
    let (echo_addr, echo) = spawn_scripted_upstream(b"again", b"still");
    let mut second = socks_client(tunnel.socks_addr);
    negotiate(&mut second);
    connect_ipv4(&mut second, echo_addr);
    second.write_all(b"again").unwrap();
    let mut answer = [0_u8; 5];
    second.read_exact(&mut answer).unwrap();
    assert_eq!(&answer, b"still");
    drop(second);
    echo.join().unwrap();
}

#[test]
fn bind_command_is_refused() {
    let tunnel = start_tunnel(Limits::default());
    let mut client = socks_client(tunnel.socks_addr);
    negotiate(&mut client);

    client.write_all(&[0x05, 0x02, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50]).unwrap();
    let mut reply = [0_u8; 10];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(reply[..2], [0x05, 0x07]);

    // Nothing follows the refusal: the proxy closes the client.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn auth_without_no_auth_method_is_refused() {
    let tunnel = start_tunnel(Limits::default());
    let mut client = socks_client(tunnel.socks_addr);

    client.write_all(&[0x05, 0x01, 0x02]).unwrap();
    let mut reply = [0_u8; 2];
    client.read_exact(&mut reply).unwrap();
    assert_eq!(reply, [0x05, 0xff]);

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn table_exhaustion_drops_the_extra_client() {
    let limits = Limits { max_streams: 2, ..Limits::default() };
    let tunnel = start_tunnel(limits);

    let mut held: Vec<TcpStream> = (0..2).map(|_| socks_client(tunnel.socks_addr)).collect();
    // Let both accepts land before the extra client arrives.
    thread::sleep(Duration::from_millis(100));

    let mut extra = socks_client(tunnel.socks_addr);
    extra.write_all(&[0x05, 0x01, 0x00]).unwrap();
    let mut buf = [0_u8; 2];
    match extra.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("expected no socks reply, got {n} bytes"),
        Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
        Err(e) => panic!("expected the connection to drop, got {e}"),
    }

    // The held clients still negotiate fine.
    for client in &mut held {
        negotiate(client);
    }
}

#[test]
fn unreachable_upstream_closes_the_stream() {
    let tunnel = start_tunnel(Limits::default());
    // A port with nothing listening behind it.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let mut client = socks_client(tunnel.socks_addr);
    negotiate(&mut client);
    connect_ipv4(&mut client, addr);

    // The refusal arrives as EOF once the far side fails to connect.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn two_streams_interleave_independently() {
    let tunnel = start_tunnel(Limits::default());
    let (addr_a, up_a) = spawn_scripted_upstream(b"alpha", b"AAAAA");
    let (addr_b, up_b) = spawn_scripted_upstream(b"bravo", b"BBBBB");

    let mut a = socks_client(tunnel.socks_addr);
    negotiate(&mut a);
    connect_ipv4(&mut a, addr_a);
    let mut b = socks_client(tunnel.socks_addr);
    negotiate(&mut b);
    connect_ipv4(&mut b, addr_b);

    b.write_all(b"bravo").unwrap();
    a.write_all(b"alpha").unwrap();

    let mut ra = [0_u8; 5];
    a.read_exact(&mut ra).unwrap();
    assert_eq!(&ra, b"AAAAA");
    let mut rb = [0_u8; 5];
    b.read_exact(&mut rb).unwrap();
    assert_eq!(&rb, b"BBBBB");

    drop(a);
    drop(b);
    up_a.join().unwrap();
    up_b.join().unwrap();
}

#[test]
fn bulk_transfer_survives_chunking() {
    let tunnel = start_tunnel(Limits::default());
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let payload: Vec<u8> = (0..256 * 1024_u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let upstream = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut got = vec![0_u8; expected.len()];
        stream.read_exact(&mut got).unwrap();
        assert_eq!(got, expected);
        stream.write_all(&got).unwrap();
    });

    let mut client = socks_client(tunnel.socks_addr);
    negotiate(&mut client);
    connect_ipv4(&mut client, addr);

    client.write_all(&payload).unwrap();
    let mut back = vec![0_u8; payload.len()];
    client.read_exact(&mut back).unwrap();
    assert_eq!(back, payload);
    upstream.join().expect("upstream thread panicked");
}
