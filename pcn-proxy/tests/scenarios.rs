//! End-to-end runs: a real proxy, nodes attached through `PcnLink`, and real
//! TCP peers on the host side.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use pcn_core::{LinkConfig, PcnError, PcnLink, PlSocket};
use pcn_proxy::{Config, Proxy};

fn fabric_dir(label: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("pcn-scenario-{}-{}", label, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn start_proxy(label: &str, ncpu: usize) -> (Arc<Proxy>, PathBuf) {
    start_proxy_with(label, ncpu, Config::default())
}

fn start_proxy_with(label: &str, ncpu: usize, base: Config) -> (Arc<Proxy>, PathBuf) {
    let dir = fabric_dir(label);
    let cfg = Config {
        port: 40000,
        ncpu,
        qsize: 256 * 1024,
        reap_threshold: 64 * 1024,
        bind_addr: Ipv4Addr::LOCALHOST.into(),
        max_stalls: 2,
        stall_timeout_ms: 1000,
        pin_cpus: false,
        fabric_dir: dir.clone(),
        ..base
    };
    (Proxy::start(cfg).unwrap(), dir)
}

fn node_config(node_id: u32, dir: &PathBuf) -> LinkConfig {
    LinkConfig {
        node_id,
        local_port: 25000,
        qsize: 256 * 1024,
        reap_threshold: 64 * 1024,
        fabric_dir: dir.clone(),
        ..LinkConfig::default()
    }
}

/// Attach a node over a socket pair, the proxy end served on its own thread.
fn try_attach(proxy: &Arc<Proxy>, cfg: LinkConfig) -> Result<PcnLink, PcnError> {
    let (node_end, proxy_end) = UnixStream::pair().unwrap();
    let p = proxy.clone();
    thread::spawn(move || {
        let _ = p.serve_link(proxy_end);
    });
    PcnLink::attach(node_end, cfg)
}

fn attach(proxy: &Arc<Proxy>, node_id: u32, dir: &PathBuf) -> PcnLink {
    try_attach(proxy, node_config(node_id, dir)).unwrap()
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}

fn tcp_socket(pl: &PcnLink) -> PlSocket {
    pl.socket(libc::AF_INET, libc::SOCK_STREAM, 0).unwrap()
}

/// Accept on a non-blocking listener, failing after five seconds.
fn accept_soon(listener: &PlSocket) -> PlSocket {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok((child, _)) = listener.accept() {
            return child;
        }
        assert!(Instant::now() < deadline, "connection never delivered");
        thread::sleep(Duration::from_millis(1));
    }
}

fn recv_exact(sock: &PlSocket, want: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 64];
    while out.len() < want {
        let n = sock.recv(&mut buf).unwrap();
        assert!(n > 0, "early end of stream after {} bytes", out.len());
        out.extend_from_slice(&buf[..n]);
    }
    out
}

#[test]
fn listen_accept_and_send() {
    let (proxy, dir) = start_proxy("basic", 2);
    let pl = attach(&proxy, 1, &dir);
    assert_eq!(pl.num_channels(), 2);
    assert_eq!(proxy.link_count(), 1);

    let listener = tcp_socket(&pl);
    assert_ne!(listener.sockid(), 0);
    let port = free_port();
    listener.bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();
    listener.listen(64).unwrap();

    let client = thread::spawn(move || {
        let mut c = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).unwrap();
        let mut got = [0u8; 13];
        c.read_exact(&mut got).unwrap();
        c.write_all(b"pong").unwrap();
        got
    });

    let (child, peer) = listener.accept().unwrap();
    assert_eq!(*peer.ip(), Ipv4Addr::LOCALHOST);
    assert_eq!(child.send(b"hello world!\0").unwrap(), 13);
    assert_eq!(&client.join().unwrap(), b"hello world!\0");

    assert_eq!(recv_exact(&child, 4), b"pong");
    let mut buf = [0u8; 8];
    assert_eq!(child.recv(&mut buf).unwrap(), 0);
    child.close().unwrap();
    listener.close().unwrap();
}

#[test]
fn burst_of_connections_is_fully_accepted() {
    let (proxy, dir) = start_proxy("burst", 1);
    let read_budget = proxy.config().read_budget;
    let pl = attach(&proxy, 1, &dir);
    let listener = tcp_socket(&pl);
    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, free_port());
    listener.bind(addr).unwrap();
    listener.listen(128).unwrap();
    listener.set_nonblocking(true);

    let burst = read_budget * 2 + 4;
    let clients: Vec<TcpStream> = (0..burst).map(|_| TcpStream::connect(addr).unwrap()).collect();
    let children: Vec<PlSocket> = (0..burst).map(|_| accept_soon(&listener)).collect();
    assert_eq!(children.len(), clients.len());

    // The listener keeps working after the burst.
    let mut late = TcpStream::connect(addr).unwrap();
    let child = accept_soon(&listener);
    assert_eq!(child.send(b"late").unwrap(), 4);
    let mut got = [0u8; 4];
    late.read_exact(&mut got).unwrap();
    assert_eq!(&got, b"late");
}

#[test]
fn connect_to_host_server() {
    let (proxy, dir) = start_proxy("connect", 2);
    let pl = attach(&proxy, 1, &dir);

    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = match server.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => unreachable!(),
    };
    let echo = thread::spawn(move || {
        let (mut s, _) = server.accept().unwrap();
        let mut buf = [0u8; 4];
        s.read_exact(&mut buf).unwrap();
        s.write_all(&buf).unwrap();
    });

    let sock = tcp_socket(&pl);
    sock.connect(addr).unwrap();
    assert_eq!(sock.send(b"ping").unwrap(), 4);
    assert_eq!(recv_exact(&sock, 4), b"ping");
    echo.join().unwrap();

    let closed = SocketAddrV4::new(Ipv4Addr::LOCALHOST, free_port());
    let refused = tcp_socket(&pl);
    match refused.connect(closed) {
        Err(e) => assert_eq!(e.errno(), libc::ECONNREFUSED),
        Ok(()) => panic!("connect to a closed port succeeded"),
    }
}

#[test]
fn shared_listener_alternates_between_nodes() {
    let (proxy, dir) = start_proxy("shared", 2);
    let nodes = [attach(&proxy, 1, &dir), attach(&proxy, 2, &dir)];
    let port = free_port();
    let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
    let listeners: Vec<PlSocket> = nodes
        .iter()
        .map(|pl| {
            let l = tcp_socket(pl);
            l.bind(addr).unwrap();
            l.listen(64).unwrap();
            l.set_nonblocking(true);
            l
        })
        .collect();

    let mut order = Vec::new();
    let mut clients = Vec::new();
    let mut children = Vec::new();
    for _ in 0..10 {
        clients.push(TcpStream::connect(addr).unwrap());
        let deadline = Instant::now() + Duration::from_secs(5);
        let winner = loop {
            let hit = listeners
                .iter()
                .enumerate()
                .find_map(|(i, l)| l.accept().ok().map(|(child, _)| (i, child)));
            if let Some(hit) = hit {
                break hit;
            }
            assert!(Instant::now() < deadline, "connection never delivered");
            thread::sleep(Duration::from_millis(1));
        };
        order.push(nodes[winner.0].node_id());
        children.push(winner.1);
    }
    assert_eq!(order, vec![1, 2, 1, 2, 1, 2, 1, 2, 1, 2]);
    assert_eq!(children.len(), clients.len());
}

#[test]
fn stalled_socket_is_reset() {
    let (proxy, dir) = start_proxy("stall", 1);
    let pl = attach(&proxy, 1, &dir);
    let listener = tcp_socket(&pl);
    let port = free_port();
    listener.bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();
    listener.listen(8).unwrap();

    // A peer that never reads, with a small receive window.
    let client = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None).unwrap();
    client.set_recv_buffer_size(4096).unwrap();
    let target = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
    client.connect(&target.into()).unwrap();

    let (child, _) = listener.accept().unwrap();
    let chunk = vec![0xa5u8; 16 * 1024];
    let mut sent = 0usize;
    let err = loop {
        match child.send(&chunk) {
            Ok(n) => sent += n,
            Err(e) => break e,
        }
        assert!(sent < 512 << 20, "peer never stalled");
    };
    assert_eq!(err.errno(), libc::ECONNRESET);

    let mut buf = [0u8; 16];
    assert_eq!(child.recv(&mut buf).unwrap(), 0);
    match child.send(b"more") {
        Err(e) => assert_eq!(e.errno(), libc::ECONNRESET),
        Ok(n) => panic!("send after reset took {} bytes", n),
    }
    child.close().unwrap();
}

#[test]
fn slow_reader_is_not_reset() {
    let (proxy, dir) = start_proxy("slow", 1);
    let pl = attach(&proxy, 1, &dir);
    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = match server.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => unreachable!(),
    };
    const TOTAL: usize = 8 << 20;
    let reader = thread::spawn(move || {
        let (mut s, _) = server.accept().unwrap();
        thread::sleep(Duration::from_millis(300));
        let mut got = vec![0u8; TOTAL];
        s.read_exact(&mut got).unwrap();
        got.iter().all(|&b| b == 0x3c)
    });

    let sock = tcp_socket(&pl);
    sock.connect(addr).unwrap();
    let data = vec![0x3cu8; TOTAL];
    let mut sent = 0;
    while sent < TOTAL {
        match sock.send(&data[sent..]) {
            Ok(n) => sent += n,
            Err(e) => panic!("send failed after {} bytes: {}", sent, e),
        }
    }
    assert!(reader.join().unwrap());
}

#[test]
fn pending_connect_does_not_hold_up_the_context() {
    let base = Config {
        connect_timeout_ms: 3000,
        ..Config::default()
    };
    let (proxy, dir) = start_proxy_with("pending", 1, base);
    let pl = attach(&proxy, 1, &dir);

    let server = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = match server.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        SocketAddr::V6(_) => unreachable!(),
    };
    let echo = thread::spawn(move || {
        let (mut s, _) = server.accept().unwrap();
        let mut buf = [0u8; 4];
        for _ in 0..20 {
            s.read_exact(&mut buf).unwrap();
            s.write_all(&buf).unwrap();
        }
    });

    // A private address that normally drops the SYN, so the connect
    // stays in flight until it times out or the route is refused.
    let blackhole = SocketAddrV4::new(Ipv4Addr::new(10, 255, 255, 1), 9);
    let stuck = tcp_socket(&pl);
    let live = tcp_socket(&pl);
    thread::scope(|scope| {
        let pending = scope.spawn(|| stuck.connect(blackhole));
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        live.connect(addr).unwrap();
        for _ in 0..20 {
            assert_eq!(live.send(b"ping").unwrap(), 4);
            assert_eq!(recv_exact(&live, 4), b"ping");
        }
        assert!(
            started.elapsed() < Duration::from_millis(1500),
            "traffic waited {:?} behind a pending connect",
            started.elapsed()
        );
        assert!(pending.join().unwrap().is_err());
    });
    echo.join().unwrap();
}

#[test]
fn detach_releases_the_node() {
    let (proxy, dir) = start_proxy("detach", 2);
    let pl = attach(&proxy, 3, &dir);
    let sock = tcp_socket(&pl);
    sock.bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
    assert_eq!(proxy.link_count(), 1);
    drop(sock);
    pl.down().unwrap();
    wait_until("link count to drop", || proxy.link_count() == 0);

    // The same node may attach again.
    let again = attach(&proxy, 3, &dir);
    assert!(!again.is_down());
}

#[test]
fn duplicate_and_bad_node_ids_are_refused() {
    let (proxy, dir) = start_proxy("refuse", 2);
    let _first = attach(&proxy, 1, &dir);

    // Distinct queue ports so the refused attempt cannot touch the live link.
    let dup = LinkConfig {
        local_port: 26000,
        ..node_config(1, &dir)
    };
    match try_attach(&proxy, dup) {
        Err(PcnError::Refused(rc)) => assert_eq!(rc, -libc::EEXIST),
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("duplicate node attached"),
    }

    let out_of_range = LinkConfig {
        local_port: 27000,
        ..node_config(9, &dir)
    };
    match try_attach(&proxy, out_of_range) {
        Err(PcnError::Refused(rc)) => assert_eq!(rc, -libc::EINVAL),
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("node 9 attached"),
    }
    assert_eq!(proxy.link_count(), 1);
}

#[test]
fn attach_over_tcp_control_port() {
    let dir = fabric_dir("tcp");
    let cfg = Config {
        port: 0,
        ncpu: 2,
        qsize: 256 * 1024,
        bind_addr: Ipv4Addr::LOCALHOST.into(),
        pin_cpus: false,
        fabric_dir: dir.clone(),
        ..Config::default()
    };
    let proxy = Proxy::start(cfg).unwrap();
    let rt = tokio::runtime::Runtime::new().unwrap();
    let listener = rt.block_on(proxy.listen()).unwrap();
    let addr = listener.local_addr().unwrap();
    rt.spawn(proxy.clone().serve(listener));

    let pl = PcnLink::up(LinkConfig {
        server_addr: addr,
        ..node_config(1, &dir)
    })
    .unwrap();
    assert_eq!(pl.num_channels(), 2);
    wait_until("link to register", || proxy.link_count() == 1);

    let sock = tcp_socket(&pl);
    sock.bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
    drop(sock);
    pl.down().unwrap();
    wait_until("link to detach", || proxy.link_count() == 0);
    proxy.shutdown();
}
