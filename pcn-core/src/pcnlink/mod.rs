//! Accelerator-side socket layer.
//!
//! [`PcnLink`] attaches this node to the proxy and owns the resulting
//! [`Link`] plus one drain worker thread. Every socket lives on one Channel
//! and is known by its event tag. Each call it makes takes a fresh call tag,
//! registers a one-shot waiter under it and blocks until the drain worker
//! hands over the response carrying that tag. Events (`E_ACCEPT`,
//! `E_RECVDATA`) carry the socket's event tag and land in its event queue.

mod config;
mod epoll;
mod socket;

pub use config::{
    parse_size, ChannelPolicy, LinkConfig, ParseSizeError, DEFAULT_LOCAL_PORT, DEFAULT_NODE_ID,
    DEFAULT_QSIZE, DEFAULT_REAP_THRESHOLD, DEFAULT_SERVER_PORT, PCNSRV_ID,
};
pub use epoll::{EpollEvent, EpollOp, PlEpoll};
pub use socket::{PlSocket, PollFlags};

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self as xchan, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use rand::Rng;

use crate::control::{self, ControlChannel, ControlError, ControlMsg, CONTROL_VERSION};
use crate::error::PcnError;
use crate::fabric::Fabric;
use crate::link::{
    Channel, ChannelError, ConnInfo, Link, LinkError, LinkParams, ReapCallback, ReapEvent,
    CHANNEL_NUM_PORTS, MAX_BATCH,
};
use crate::netmsg::{Body, Family, Netmsg, SockAddrIn};

/// Asynchronous event routed to one socket.
pub(crate) enum SockEvent {
    Accept {
        channel_id: u32,
        sockid: u64,
        addr: SockAddrIn,
    },
    /// Received bytes; empty means end of stream.
    Data(Vec<u8>),
}

struct PendingCall {
    /// Event tag of the socket that issued the call.
    owner: u64,
    tx: Sender<Netmsg>,
}

/// Counters kept by the drain worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    /// Reap callbacks fired on inbound queues.
    pub reaps: u64,
    /// Responses and events dropped because nobody was waiting for the tag.
    pub dropped: u64,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared by the link handle, its sockets and the drain worker.
pub(crate) struct Shared {
    link: Link,
    cfg: LinkConfig,
    pending: Mutex<HashMap<u64, PendingCall>>,
    sockets: RwLock<HashMap<u64, Sender<SockEvent>>>,
    next_tag: AtomicU64,
    next_channel: AtomicUsize,
    down: AtomicBool,
    stop: AtomicBool,
    /// Productive drain sweeps so far; waiters sleep on `swept`.
    sweeps: Mutex<u64>,
    swept: Condvar,
    reaps: Arc<AtomicU64>,
    dropped: AtomicU64,
}

impl Shared {
    fn new(link: Link, cfg: LinkConfig, reaps: Arc<AtomicU64>) -> Self {
        Self {
            link,
            cfg,
            pending: Mutex::new(HashMap::new()),
            sockets: RwLock::new(HashMap::new()),
            next_tag: AtomicU64::new(1),
            next_channel: AtomicUsize::new(0),
            down: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            sweeps: Mutex::new(0),
            swept: Condvar::new(),
            reaps,
            dropped: AtomicU64::new(0),
        }
    }

    pub(crate) fn next_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    pub(crate) fn channel(&self, id: u32) -> Option<Arc<Channel>> {
        self.link.channel(id).cloned()
    }

    /// Channel for a new socket, per the configured policy.
    pub(crate) fn pick_channel(&self) -> Arc<Channel> {
        let channels = self.link.channels();
        let idx = match self.cfg.channel_policy {
            ChannelPolicy::Random => rand::thread_rng().gen_range(0..channels.len()),
            ChannelPolicy::RoundRobin => {
                self.next_channel.fetch_add(1, Ordering::Relaxed) % channels.len()
            }
        };
        channels[idx].clone()
    }

    /// Open the event queue for a socket tag.
    pub(crate) fn register(&self, tag: u64) -> Receiver<SockEvent> {
        let (tx, rx) = xchan::unbounded();
        self.sockets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(tag, tx);
        rx
    }

    pub(crate) fn unregister(&self, tag: u64) {
        self.sockets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&tag);
    }

    /// Issue `body` on `channel` under a fresh call tag and wait for its response.
    pub(crate) fn call(&self, channel: &Channel, owner: u64, body: Body) -> Result<Body, PcnError> {
        let tag = self.next_tag();
        self.call_tagged(channel, owner, tag, body)
    }

    pub(crate) fn call_tagged(
        &self,
        channel: &Channel,
        owner: u64,
        tag: u64,
        body: Body,
    ) -> Result<Body, PcnError> {
        let expected = body
            .command()
            .response()
            .ok_or(PcnError::Invalid("not a request"))?;
        let (tx, rx) = xchan::bounded(1);
        {
            let mut pending = lock(&self.pending);
            if pending.contains_key(&tag) {
                return Err(PcnError::TagCollision(tag));
            }
            pending.insert(tag, PendingCall { owner, tx });
        }
        // fail_all may have run before the insert; it would not see this waiter.
        if self.is_down() {
            self.forget(tag);
            return Err(PcnError::LinkDown);
        }
        if let Err(e) = channel.send(tag, body) {
            self.forget(tag);
            return Err(match e {
                ChannelError::Closed => PcnError::LinkDown,
                e => e.into(),
            });
        }
        let reply = match self.cfg.rpc_timeout {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => {
                    self.forget(tag);
                    PcnError::TimedOut
                }
                RecvTimeoutError::Disconnected => self.cancelled(),
            })?,
            None => rx.recv().map_err(|_| self.cancelled())?,
        };
        if reply.command() != expected {
            return Err(PcnError::BadResponse {
                expected,
                got: reply.command(),
            });
        }
        Ok(reply.body)
    }

    fn forget(&self, tag: u64) {
        lock(&self.pending).remove(&tag);
    }

    fn cancelled(&self) -> PcnError {
        if self.is_down() {
            PcnError::LinkDown
        } else {
            PcnError::Closed
        }
    }

    /// Drop every waiter issued by `owner`; they wake with [`PcnError::Closed`].
    pub(crate) fn cancel_calls(&self, owner: u64) {
        lock(&self.pending).retain(|_, call| call.owner != owner);
    }

    fn dispatch(&self, channel_id: u32, msg: Netmsg) -> Result<(), PcnError> {
        let command = msg.command();
        let tag = msg.tag;
        match command.family() {
            Family::Response => {
                let waiter = lock(&self.pending).remove(&tag);
                match waiter {
                    Some(call) => {
                        let _ = call.tx.send(msg);
                    }
                    None => self.discard(channel_id, &msg, "no call waiting"),
                }
            }
            Family::Event => {
                let event = match msg.body {
                    Body::EAccept { sockid, addr } => SockEvent::Accept {
                        channel_id,
                        sockid,
                        addr,
                    },
                    Body::ERecvdata { data, .. } => SockEvent::Data(data),
                    _ => return Err(PcnError::UnexpectedCommand(command)),
                };
                let delivered = self
                    .sockets
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&tag)
                    .map(|tx| tx.send(event).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "channel {}: dropping {:?} for tag {}: socket gone",
                        channel_id, command, tag
                    );
                }
            }
            Family::Request | Family::Notification => {
                return Err(PcnError::UnexpectedCommand(command));
            }
        }
        Ok(())
    }

    fn discard(&self, channel_id: u32, msg: &Netmsg, why: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        debug!(
            "channel {}: dropping {:?} (seq {}) for tag {}: {}",
            channel_id,
            msg.command(),
            msg.seqnum,
            msg.tag,
            why
        );
    }

    /// Drain worker body: sweep every channel, dispatch, back off when idle.
    fn drain_loop(&self) {
        debug!(
            "drain worker up for {} channels",
            self.link.num_channels()
        );
        while !self.stop.load(Ordering::Acquire) {
            let mut busy = false;
            for ch in self.link.channels() {
                let frames = match ch.recv_batch(MAX_BATCH) {
                    Ok(frames) => frames,
                    Err(ChannelError::Closed) => {
                        if !self.stop.load(Ordering::Acquire) {
                            info!("channel {} closed by proxy, link down", ch.id());
                        }
                        self.fail_all();
                        return;
                    }
                    Err(e) => {
                        error!("channel {}: {}, link down", ch.id(), e);
                        self.fail_all();
                        return;
                    }
                };
                busy |= !frames.is_empty();
                for msg in frames {
                    if let Err(e) = self.dispatch(ch.id(), msg) {
                        error!("channel {}: protocol error: {}, link down", ch.id(), e);
                        self.fail_all();
                        return;
                    }
                }
            }
            if busy {
                self.notify();
            } else {
                thread::sleep(self.cfg.idle_backoff);
            }
        }
    }

    /// Tear the link down and wake every waiter with [`PcnError::LinkDown`].
    fn fail_all(&self) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.link.shutdown();
        lock(&self.pending).clear();
        self.sockets
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        self.notify();
    }

    fn notify(&self) {
        *lock(&self.sweeps) += 1;
        self.swept.notify_all();
    }

    pub(crate) fn sweeps(&self) -> u64 {
        *lock(&self.sweeps)
    }

    /// Sleep until a sweep after `seen` completes or `timeout` passes.
    pub(crate) fn wait_sweep(&self, seen: u64, timeout: Duration) {
        let guard = lock(&self.sweeps);
        let _ = self
            .swept
            .wait_timeout_while(guard, timeout, |n| *n == seen)
            .unwrap_or_else(|e| e.into_inner());
    }
}

/// This node's attachment to the proxy.
pub struct PcnLink {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    node_id: u32,
    control: Mutex<Option<Box<dyn ControlChannel>>>,
}

impl PcnLink {
    /// Connect to the proxy's control port and attach.
    pub fn up(cfg: LinkConfig) -> Result<PcnLink, PcnError> {
        let control = TcpStream::connect(cfg.server_addr)?;
        control.set_nodelay(true)?;
        Self::attach(control, cfg)
    }

    /// Attach over an already connected control stream: take the proxy's
    /// Hello, announce our queue ports, build the Link and wait for the Ack.
    pub fn attach<C: ControlChannel + 'static>(
        mut control: C,
        cfg: LinkConfig,
    ) -> Result<PcnLink, PcnError> {
        let (num_channel, base_port) = match control::read_msg(&mut control)? {
            ControlMsg::Hello {
                version,
                num_channel,
                base_port,
            } if version == CONTROL_VERSION => (num_channel, base_port),
            other => return Err(ControlError::Unexpected(other).into()),
        };
        if num_channel == 0 {
            return Err(PcnError::Invalid("proxy offers no channels"));
        }
        let host_port = cfg
            .node_id
            .checked_mul(num_channel * CHANNEL_NUM_PORTS)
            .and_then(|off| base_port.checked_add(off))
            .ok_or(PcnError::Invalid("node id out of range"))?;
        let conn = ConnInfo {
            remote_id: cfg.server_id,
            remote_port: host_port,
            local_port: cfg.local_port,
        };
        control::write_msg(&mut control, &ControlMsg::Attach(conn.reversed(cfg.node_id)))?;

        let reaps = Arc::new(AtomicU64::new(0));
        let counter = reaps.clone();
        let on_reap: ReapCallback = Arc::new(move |ev: ReapEvent| {
            counter.fetch_add(1, Ordering::Relaxed);
            warn!(
                "inbound channel {} from node {} backed up: {} bytes unread",
                ev.channel_id, ev.remote_id, ev.backlog
            );
        });
        let params = LinkParams {
            local_id: cfg.node_id,
            num_channel,
            qsize: cfg.qsize,
            reap_threshold: cfg.reap_threshold,
        };
        let fabric = Fabric::new(cfg.fabric_dir.clone());
        let link = match Link::establish(&fabric, &params, &conn, &mut control, Some(on_reap)) {
            Ok(link) => link,
            Err(LinkError::Barrier(ControlMsg::Ack { rc })) => return Err(PcnError::Refused(rc)),
            Err(e) => return Err(e.into()),
        };

        let node_id = cfg.node_id;
        let shared = Arc::new(Shared::new(link, cfg, reaps));
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("pcnlink-drain-{}", node_id))
                .spawn(move || shared.drain_loop())?
        };
        let mut this = PcnLink {
            shared,
            worker: Some(worker),
            node_id,
            control: Mutex::new(None),
        };
        match control::read_msg(&mut control)? {
            ControlMsg::Ack { rc: 0 } => {}
            ControlMsg::Ack { rc } => return Err(PcnError::Refused(rc)),
            other => return Err(ControlError::Unexpected(other).into()),
        }
        info!(
            "node {} attached with {} channels",
            node_id,
            this.shared.link.num_channels()
        );
        *this.control.get_mut().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(control));
        Ok(this)
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn num_channels(&self) -> usize {
        self.shared.link.num_channels()
    }

    pub fn is_down(&self) -> bool {
        self.shared.is_down()
    }

    /// Calls currently waiting for a response.
    pub fn pending_calls(&self) -> usize {
        lock(&self.shared.pending).len()
    }

    /// Opaque counter that moves whenever the drain worker delivers something.
    pub fn activity(&self) -> u64 {
        self.shared.sweeps()
    }

    /// Block until [`activity`](Self::activity) moves past `seen` or `timeout` passes.
    pub fn wait_activity(&self, seen: u64, timeout: Duration) {
        self.shared.wait_sweep(seen, timeout)
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            reaps: self.shared.reaps.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
        }
    }

    /// Detach from the proxy. Outstanding and later calls on this link's
    /// sockets fail with [`PcnError::LinkDown`].
    pub fn down(mut self) -> Result<(), PcnError> {
        self.detach()
    }

    fn detach(&mut self) -> Result<(), PcnError> {
        let control = self
            .control
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let sent = match control {
            Some(mut c) => control::write_msg(&mut *c, &ControlMsg::Detach).map_err(PcnError::from),
            None => Ok(()),
        };
        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("drain worker panicked");
            }
        }
        self.shared.fail_all();
        sent
    }
}

impl Drop for PcnLink {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            debug!("detach on drop: {}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fabric::scratch_fabric;
    use crate::netmsg::Command;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    /// Host end of an attached link, answering requests by hand.
    pub(crate) struct FakeHost {
        pub(crate) link: Link,
        _control: UnixStream,
    }

    impl FakeHost {
        /// Next request from the node, with the channel it came on.
        pub(crate) fn next_request(&self) -> (u32, Netmsg) {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                for ch in self.link.channels() {
                    if let Some(msg) = ch.recv_batch(1).unwrap().pop() {
                        return (ch.id(), msg);
                    }
                }
                assert!(Instant::now() < deadline, "no request from node");
                thread::sleep(Duration::from_micros(50));
            }
        }

        pub(crate) fn expect(&self, command: Command) -> (u32, Netmsg) {
            let (ch, msg) = self.next_request();
            assert_eq!(msg.command(), command, "got {:?}", msg);
            (ch, msg)
        }

        pub(crate) fn send(&self, ch: u32, tag: u64, body: Body) {
            self.link.channel(ch).unwrap().send(tag, body).unwrap();
        }

        /// Answer `req` with a bare return code.
        pub(crate) fn answer(&self, ch: u32, req: &Netmsg, rc: i32) {
            self.send(ch, req.tag, Body::response_to(req.command(), rc).unwrap());
        }

        /// Answer a T_SOCKET.
        pub(crate) fn create(&self, sockid: u64) -> (u32, u64) {
            let (ch, req) = self.expect(Command::TSocket);
            self.send(ch, req.tag, Body::RSocket { rc: 0, sockid });
            (ch, req.tag)
        }
    }

    pub(crate) fn test_config(fabric: &Fabric) -> LinkConfig {
        LinkConfig {
            node_id: 1,
            local_port: 40000,
            qsize: 64 * 1024,
            reap_threshold: 16 * 1024,
            channel_policy: ChannelPolicy::RoundRobin,
            fabric_dir: fabric.dir().to_path_buf(),
            ..LinkConfig::default()
        }
    }

    fn run_host(
        mut control: UnixStream,
        fabric: Fabric,
        num_channel: u32,
        ack: i32,
    ) -> Option<FakeHost> {
        control::write_msg(
            &mut control,
            &ControlMsg::Hello {
                version: CONTROL_VERSION,
                num_channel,
                base_port: 30000,
            },
        )
        .unwrap();
        let conn = match control::read_msg(&mut control).unwrap() {
            ControlMsg::Attach(conn) => conn,
            other => panic!("expected attach, got {:?}", other),
        };
        assert_eq!(conn.remote_id, 1);
        assert_eq!(conn.local_port, 30000 + num_channel * CHANNEL_NUM_PORTS);
        if ack != 0 {
            control::write_msg(&mut control, &ControlMsg::Ack { rc: ack }).unwrap();
            // Hold the stream until the node's first barrier shows up.
            let _ = control::read_msg(&mut control);
            return None;
        }
        let params = LinkParams {
            local_id: 0,
            num_channel,
            qsize: 64 * 1024,
            reap_threshold: 16 * 1024,
        };
        let link = Link::establish(&fabric, &params, &conn, &mut control, None).unwrap();
        control::write_msg(&mut control, &ControlMsg::Ack { rc: 0 }).unwrap();
        Some(FakeHost {
            link,
            _control: control,
        })
    }

    /// A node attached to a hand-driven host over a socket pair.
    pub(crate) fn attach_pair(label: &str, num_channel: u32) -> (PcnLink, FakeHost) {
        let fabric = scratch_fabric(label);
        let (node_end, host_end) = UnixStream::pair().unwrap();
        let host_fabric = fabric.clone();
        let host = thread::spawn(move || run_host(host_end, host_fabric, num_channel, 0));
        let pl = PcnLink::attach(node_end, test_config(&fabric)).unwrap();
        (pl, host.join().unwrap().unwrap())
    }

    pub(crate) fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn attach_builds_every_channel() {
        let (pl, host) = attach_pair("attach", 3);
        assert_eq!(pl.num_channels(), 3);
        assert_eq!(host.link.num_channels(), 3);
        assert!(!pl.is_down());
        assert_eq!(pl.stats(), LinkStats::default());
    }

    #[test]
    fn refused_attach_reports_rc() {
        let fabric = scratch_fabric("refused");
        let (node_end, host_end) = UnixStream::pair().unwrap();
        let host_fabric = fabric.clone();
        let host = thread::spawn(move || run_host(host_end, host_fabric, 2, -libc::EEXIST));
        match PcnLink::attach(node_end, test_config(&fabric)) {
            Err(PcnError::Refused(rc)) => assert_eq!(rc, -libc::EEXIST),
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("attach should be refused"),
        }
        assert!(host.join().unwrap().is_none());
        assert!(!fabric.endpoint(1, 40000).exists());
    }

    #[test]
    fn responses_complete_out_of_order() {
        let (pl, host) = attach_pair("ooo", 1);
        thread::scope(|s| {
            let a = s.spawn(|| pl.socket(libc::AF_INET, libc::SOCK_STREAM, 0));
            let (ch, first) = host.expect(Command::TSocket);
            let b = s.spawn(|| pl.socket(libc::AF_INET, libc::SOCK_DGRAM, 0));
            let (_, second) = host.expect(Command::TSocket);
            let (first_ty, second_ty) = match (&first.body, &second.body) {
                (Body::TSocket { ty: t1, .. }, Body::TSocket { ty: t2, .. }) => (*t1, *t2),
                _ => unreachable!(),
            };
            assert_eq!((first_ty, second_ty), (libc::SOCK_STREAM, libc::SOCK_DGRAM));
            // Answer the later call first.
            host.send(ch, second.tag, Body::RSocket { rc: 0, sockid: 200 });
            host.send(ch, first.tag, Body::RSocket { rc: 0, sockid: 100 });
            assert_eq!(a.join().unwrap().unwrap().sockid(), 100);
            assert_eq!(b.join().unwrap().unwrap().sockid(), 200);
        });
        assert_eq!(pl.pending_calls(), 0);
    }

    #[test]
    fn negative_rc_surfaces_as_errno() {
        let (pl, host) = attach_pair("errno", 1);
        thread::scope(|s| {
            let call = s.spawn(|| pl.socket(libc::AF_INET, libc::SOCK_STREAM, 0));
            let (ch, req) = host.expect(Command::TSocket);
            host.send(ch, req.tag, Body::RSocket { rc: -libc::EMFILE, sockid: 0 });
            match call.join().unwrap() {
                Err(PcnError::Errno(e)) => assert_eq!(e, libc::EMFILE),
                Err(e) => panic!("unexpected error {}", e),
                Ok(_) => panic!("socket should fail"),
            }
        });
    }

    #[test]
    fn unsolicited_response_is_counted_and_dropped() {
        let (pl, host) = attach_pair("stray", 1);
        host.send(0, 9999, Body::RBind { rc: 0 });
        wait_until("stray drop", || pl.stats().dropped == 1);
        assert!(!pl.is_down());
    }

    #[test]
    fn request_from_proxy_is_a_protocol_error() {
        let (pl, host) = attach_pair("proto", 2);
        host.send(1, 1, Body::TClose { sockid: 3 });
        wait_until("link down", || pl.is_down());
        match pl.socket(libc::AF_INET, libc::SOCK_STREAM, 0) {
            Err(PcnError::LinkDown) => {}
            Err(e) => panic!("unexpected error {}", e),
            Ok(_) => panic!("socket on a dead link"),
        }
    }

    #[test]
    fn proxy_teardown_fails_waiting_calls() {
        let (pl, host) = attach_pair("teardown", 2);
        thread::scope(|s| {
            let call = s.spawn(|| pl.socket(libc::AF_INET, libc::SOCK_STREAM, 0));
            host.expect(Command::TSocket);
            drop(host);
            match call.join().unwrap() {
                Err(e) => assert_eq!(e.errno(), libc::EIO),
                Ok(_) => panic!("call should fail with the link"),
            }
        });
        assert!(pl.is_down());
        assert_eq!(pl.pending_calls(), 0);
    }

    #[test]
    fn down_sends_detach() {
        let fabric = scratch_fabric("detach");
        let (node_end, host_end) = UnixStream::pair().unwrap();
        let host_fabric = fabric.clone();
        let host = thread::spawn(move || {
            let mut probe = host_end.try_clone().unwrap();
            let fake = run_host(host_end, host_fabric, 1, 0).unwrap();
            let msg = control::read_msg(&mut probe).unwrap();
            (fake, msg)
        });
        let pl = PcnLink::attach(node_end, test_config(&fabric)).unwrap();
        pl.down().unwrap();
        let (_fake, msg) = host.join().unwrap();
        assert_eq!(msg, ControlMsg::Detach);
    }
}
