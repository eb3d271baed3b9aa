//! Network Contexts.
//!
//! Each context is one OS thread running a `mio` poll loop. It services
//! channel `i` of every attached Link (the context id is the channel id),
//! runs each request against the host socket it names, and turns host socket
//! readiness into `E_ACCEPT` / `E_RECVDATA` events. A context owns its host
//! sockets outright; contexts only meet in the shared [`ListenRegistry`].
//!
//! Channel queues have no readiness descriptor, so the loop drains them on
//! every turn and bounds the poll wait by `poll_timeout`.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddrV4};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use pcn_core::link::MAX_BATCH;
use pcn_core::netmsg::{self, Family, MsgHdr, DATA_FRAME_OVERHEAD, RECVDATA_DATA_OFFSET};
use pcn_core::{Body, Channel, ChannelError, Command, Netmsg, SockState};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::affinity;
use crate::hostsock::{self, HostSocket, NoSignal, PendingConnect};
use crate::listen::{ListenMember, ListenRegistry};

const WAKE_TOKEN: Token = Token(usize::MAX);
/// Largest option value returned by `T_GETSOCKOPT`.
pub const MAX_OPTLEN: usize = 1024;

/// Per-context tuning, derived from the proxy config.
#[derive(Debug, Clone)]
pub struct CtxSettings {
    pub max_stalls: u32,
    /// Minimum span of a stall run before it resets the socket.
    pub stall_timeout: Duration,
    pub staging_size: usize,
    pub max_read_len: usize,
    /// Reads (or accepts) per socket per readiness event.
    pub read_budget: usize,
    pub poll_timeout: Duration,
    /// Time a non-blocking connect may stay in flight.
    pub connect_timeout: Duration,
    /// CPU to pin the context thread to.
    pub cpu: Option<usize>,
}

/// Work handed to a context by the control plane.
pub enum CtxCommand {
    /// Start servicing this channel of a new link.
    Attach(Arc<Channel>),
    /// Forget the node: close its sockets and drop its channel, then ack.
    Detach { remote_id: u32, done: Sender<()> },
    Shutdown,
}

#[derive(Debug, thiserror::Error)]
enum CtxError {
    #[error("node sent {0:?}, which is not a request")]
    Unexpected(Command),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Control-plane side of a running context.
pub struct CtxHandle {
    id: u32,
    tx: Sender<CtxCommand>,
    waker: Arc<Waker>,
    thread: Option<JoinHandle<()>>,
}

impl CtxHandle {
    pub fn spawn(id: u32, settings: CtxSettings, listen: Arc<ListenRegistry>) -> io::Result<CtxHandle> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (tx, rx) = channel::unbounded();
        let ctx = NetCtx {
            id,
            poll,
            rx,
            settings,
            listen,
            channels: HashMap::new(),
            socks: HashMap::new(),
            next_sockid: 0,
            pending_reads: VecDeque::new(),
            pending_connects: Vec::new(),
        };
        let thread = thread::Builder::new()
            .name(format!("pcn-ctx-{}", id))
            .spawn(move || ctx.run())?;
        Ok(CtxHandle {
            id,
            tx,
            waker,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Queue `cmd` and wake the loop. False if the context has exited.
    pub fn send(&self, cmd: CtxCommand) -> bool {
        if self.tx.send(cmd).is_err() {
            return false;
        }
        if let Err(e) = self.waker.wake() {
            warn!("context {}: wake failed: {}", self.id, e);
        }
        true
    }

    /// Stop the loop and wait for the thread.
    pub fn stop(&mut self) {
        self.send(CtxCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("context {} panicked", self.id);
            }
        }
    }
}

impl Drop for CtxHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// What one socket read pass left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Nothing more to read until the next readiness event.
    Drained,
    /// Budget used up with data possibly left.
    More,
    /// The node's channel is full.
    Blocked,
}

enum Recv {
    WouldBlock,
    Data,
    Interrupted,
    Eof,
    Failed(io::Error),
}

struct NetCtx {
    id: u32,
    poll: Poll,
    rx: Receiver<CtxCommand>,
    settings: CtxSettings,
    listen: Arc<ListenRegistry>,
    /// This context's channel of each attached node, by node id.
    channels: HashMap<u32, Arc<Channel>>,
    socks: HashMap<u64, HostSocket>,
    next_sockid: u32,
    /// Sockets to read again without waiting for a readiness edge.
    pending_reads: VecDeque<u64>,
    /// Sockets with a `T_CONNECT` awaiting its answer.
    pending_connects: Vec<u64>,
}

impl NetCtx {
    fn run(mut self) {
        if let Some(cpu) = self.settings.cpu {
            match affinity::pin_current_thread(cpu) {
                Ok(cpu) => debug!("context {} pinned to cpu {}", self.id, cpu),
                Err(e) => warn!("context {}: cannot pin to cpu {}: {}", self.id, cpu, e),
            }
        }
        info!("context {} started", self.id);
        let mut events = Events::with_capacity(256);
        while self.handle_commands() {
            self.expire_connects();
            let busy = self.drain_channels() | self.retry_reads();
            let timeout = if busy {
                Duration::ZERO
            } else {
                self.settings.poll_timeout
            };
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("context {}: poll failed: {}", self.id, e);
                break;
            }
            for ev in events.iter() {
                if ev.token() == WAKE_TOKEN {
                    continue;
                }
                let sockid = ev.token().0 as u64;
                if self.socks.get(&sockid).is_some_and(|s| s.connecting.is_some()) {
                    self.finish_connect(sockid);
                    continue;
                }
                if ev.is_readable() || ev.is_read_closed() || ev.is_error() {
                    self.on_readable(sockid);
                }
                if ev.is_writable() {
                    self.on_writable(sockid);
                }
            }
        }
        let remotes: Vec<u32> = self.channels.keys().copied().collect();
        for remote_id in remotes {
            self.drop_remote(remote_id, "context stopping");
        }
        info!("context {} stopped", self.id);
    }

    /// Apply queued commands. False once the context should exit.
    fn handle_commands(&mut self) -> bool {
        loop {
            match self.rx.try_recv() {
                Ok(CtxCommand::Attach(ch)) => {
                    debug!(
                        "context {}: serving channel {} of node {}",
                        self.id,
                        ch.id(),
                        ch.remote_id()
                    );
                    self.channels.insert(ch.remote_id(), ch);
                }
                Ok(CtxCommand::Detach { remote_id, done }) => {
                    self.drop_remote(remote_id, "detached");
                    let _ = done.send(());
                }
                Ok(CtxCommand::Shutdown) | Err(TryRecvError::Disconnected) => return false,
                Err(TryRecvError::Empty) => return true,
            }
        }
    }

    fn drain_channels(&mut self) -> bool {
        let mut busy = false;
        let channels: Vec<Arc<Channel>> = self.channels.values().cloned().collect();
        for ch in channels {
            let batch = match ch.recv_batch(MAX_BATCH) {
                Ok(batch) => batch,
                Err(ChannelError::Closed) => {
                    self.drop_remote(ch.remote_id(), "channel closed");
                    continue;
                }
                Err(e) => {
                    error!("context {}: node {}: {}", self.id, ch.remote_id(), e);
                    self.drop_remote(ch.remote_id(), "protocol error");
                    continue;
                }
            };
            busy |= !batch.is_empty();
            for msg in batch {
                if let Err(e) = self.handle_request(&ch, msg) {
                    match e {
                        CtxError::Channel(ChannelError::Closed) => {
                            self.drop_remote(ch.remote_id(), "channel closed")
                        }
                        e => {
                            error!("context {}: node {}: {}", self.id, ch.remote_id(), e);
                            self.drop_remote(ch.remote_id(), "protocol error");
                        }
                    }
                    break;
                }
            }
        }
        busy
    }

    fn handle_request(&mut self, ch: &Arc<Channel>, msg: Netmsg) -> Result<(), CtxError> {
        let tag = msg.tag;
        let command = msg.command();
        let remote_id = ch.remote_id();
        let reply = match msg.body {
            Body::TSocket {
                domain,
                ty,
                protocol,
            } => self.open_socket(ch, tag, domain, ty, protocol),
            Body::TClose { sockid } => {
                let owned = matches!(self.socks.get(&sockid), Some(s) if s.remote_id == remote_id);
                if owned {
                    self.release(sockid);
                }
                Body::RClose {
                    rc: if owned { 0 } else { -libc::EBADF },
                }
            }
            Body::NSocket { sockid } => {
                self.register_tag(remote_id, sockid, tag);
                return Ok(());
            }
            body if command.family() == Family::Request => {
                let sockid = body.sockid().unwrap_or_default();
                let env = SockEnv {
                    registry: self.poll.registry(),
                    listen: &self.listen,
                    settings: &self.settings,
                    ctx_id: self.id,
                    channel: ch,
                };
                match lookup(&mut self.socks, remote_id, sockid) {
                    Ok(s) => match env.execute(s, tag, body)? {
                        Some(reply) => reply,
                        None => {
                            self.pending_connects.push(sockid);
                            return Ok(());
                        }
                    },
                    Err(rc) => Body::response_to(command, rc).ok_or(CtxError::Unexpected(command))?,
                }
            }
            _ => return Err(CtxError::Unexpected(command)),
        };
        ch.send(tag, reply)?;
        Ok(())
    }

    fn alloc_sockid(&mut self) -> u64 {
        loop {
            self.next_sockid = self.next_sockid.wrapping_add(1);
            let sockid = (u64::from(self.id) << 32) | u64::from(self.next_sockid);
            if self.next_sockid != 0 && !self.socks.contains_key(&sockid) {
                return sockid;
            }
        }
    }

    fn open_socket(&mut self, ch: &Channel, tag: u64, domain: i32, ty: i32, protocol: i32) -> Body {
        if domain != libc::AF_INET {
            return Body::RSocket {
                rc: -libc::EAFNOSUPPORT,
                sockid: 0,
            };
        }
        let protocol = (protocol != 0).then(|| Protocol::from(protocol));
        let sock = match Socket::new(Domain::from(domain), Type::from(ty), protocol) {
            Ok(sock) => sock,
            Err(e) => {
                return Body::RSocket {
                    rc: neg_errno(&e),
                    sockid: 0,
                }
            }
        };
        if let Err(e) = sock.set_reuse_address(true) {
            warn!("context {}: SO_REUSEADDR: {}", self.id, e);
        }
        let sockid = self.alloc_sockid();
        ch.socktbl().add(sockid, SockState::New);
        self.socks.insert(
            sockid,
            HostSocket::new(sock, sockid, ch.remote_id(), tag, self.settings.staging_size),
        );
        debug!(
            "context {}: node {} socket {:#x} (type {})",
            self.id,
            ch.remote_id(),
            sockid,
            ty
        );
        Body::RSocket { rc: 0, sockid }
    }

    /// `N_SOCKET`: the node adopted an accepted socket under `tag`.
    fn register_tag(&mut self, remote_id: u32, sockid: u64, tag: u64) {
        match self.socks.get_mut(&sockid) {
            Some(s) if s.remote_id == remote_id && !s.tag_available => {
                s.tag = tag;
                s.tag_available = true;
                self.pending_reads.push_back(sockid);
            }
            _ => debug!(
                "context {}: N_SOCKET for unknown socket {:#x} from node {}",
                self.id, sockid, remote_id
            ),
        }
    }

    /// Close a host socket and drop every reference to it.
    fn release(&mut self, sockid: u64) {
        let Some(mut s) = self.socks.remove(&sockid) else {
            return;
        };
        if let Err(e) = s.set_interest(self.poll.registry(), None) {
            debug!("context {}: deregister {:#x}: {}", self.id, sockid, e);
        }
        if let Some(key) = s.listen_key {
            self.listen.leave(key, sockid);
        }
        if let Some(ch) = self.channels.get(&s.remote_id) {
            ch.socktbl().remove(sockid);
        }
        if !s.staging.is_empty() && !s.reset {
            match s.staging.flush_to(NoSignal(&s.sock)) {
                Ok(_) if !s.staging.is_empty() => debug!(
                    "context {}: {:#x} closed with {} bytes unsent",
                    self.id,
                    sockid,
                    s.staging.len()
                ),
                Ok(_) => {}
                Err(e) => debug!("context {}: final flush {:#x}: {}", self.id, sockid, e),
            }
        }
        debug!("context {}: closed socket {:#x}", self.id, sockid);
    }

    /// Close everything belonging to `remote_id` and stop serving its channel.
    fn drop_remote(&mut self, remote_id: u32, why: &str) {
        let owned: Vec<u64> = self
            .socks
            .values()
            .filter(|s| s.remote_id == remote_id)
            .map(|s| s.sockid)
            .collect();
        for sockid in &owned {
            self.release(*sockid);
        }
        if let Some(ch) = self.channels.remove(&remote_id) {
            ch.close();
            info!(
                "context {}: node {} dropped ({}), {} sockets closed",
                self.id,
                remote_id,
                why,
                owned.len()
            );
        }
    }

    fn retry_reads(&mut self) -> bool {
        let mut progress = false;
        for _ in 0..self.pending_reads.len() {
            let Some(sockid) = self.pending_reads.pop_front() else {
                break;
            };
            match self.service_readable(sockid) {
                ReadState::Drained => progress = true,
                ReadState::More => {
                    progress = true;
                    self.pending_reads.push_back(sockid);
                }
                ReadState::Blocked => self.pending_reads.push_back(sockid),
            }
        }
        progress
    }

    /// Accept on a listening socket, read on any other.
    fn service_readable(&mut self, sockid: u64) -> ReadState {
        match self.socks.get(&sockid) {
            Some(s) if s.state == SockState::Listen => self.accept_ready(sockid),
            Some(_) => self.read_ready(sockid),
            None => ReadState::Drained,
        }
    }

    fn on_readable(&mut self, sockid: u64) {
        let state = self.service_readable(sockid);
        if state != ReadState::Drained && !self.pending_reads.contains(&sockid) {
            self.pending_reads.push_back(sockid);
        }
    }

    /// Accept pending connections on a listening socket and route each to
    /// the listening member picked for it.
    fn accept_ready(&mut self, sockid: u64) -> ReadState {
        for _ in 0..self.settings.read_budget {
            let Some(s) = self.socks.get(&sockid) else {
                return ReadState::Drained;
            };
            let (child, peer) = match s.sock.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return ReadState::Drained,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("context {}: accept on {:#x}: {}", self.id, sockid, e);
                    return ReadState::Drained;
                }
            };
            let own = ListenMember {
                remote_id: s.remote_id,
                ctx_id: self.id,
                sockid,
                tag: s.tag,
            };
            let target = s
                .listen_key
                .and_then(|key| self.listen.pick(key))
                .unwrap_or(own);
            self.adopt_accepted(child, peer, target);
        }
        ReadState::More
    }

    fn adopt_accepted(&mut self, child: Socket, peer: SockAddr, target: ListenMember) {
        let Some(ch) = self.channels.get(&target.remote_id).cloned() else {
            debug!(
                "context {}: no channel to node {}, dropping connection",
                self.id, target.remote_id
            );
            return;
        };
        let Some(addr) = peer.as_socket_ipv4() else {
            return;
        };
        if let Err(e) = child.set_nonblocking(true) {
            warn!("context {}: accepted socket: {}", self.id, e);
            return;
        }
        hostsock::raise_sndbuf(&child);
        let sockid = self.alloc_sockid();
        let mut hs = HostSocket::new(child, sockid, target.remote_id, 0, self.settings.staging_size);
        hs.tag_available = false;
        hs.state = SockState::In;
        if let Err(e) = hs.set_interest(self.poll.registry(), Some(Interest::READABLE)) {
            warn!("context {}: register accepted socket: {}", self.id, e);
            return;
        }
        ch.socktbl().add(sockid, SockState::In);
        self.socks.insert(sockid, hs);
        let event = Body::EAccept {
            sockid,
            addr: addr.into(),
        };
        match ch.send(target.tag, event) {
            Ok(_) => debug!(
                "context {}: {} accepted as {:#x} for node {} listener {:#x}",
                self.id, addr, sockid, target.remote_id, target.sockid
            ),
            Err(e) => {
                debug!("context {}: E_ACCEPT to node {}: {}", self.id, target.remote_id, e);
                self.release(sockid);
            }
        }
    }

    /// Forward what a stream socket has to read as `E_RECVDATA` frames
    /// written in place into the node's channel.
    fn read_ready(&mut self, sockid: u64) -> ReadState {
        let registry = self.poll.registry();
        let Some(s) = self.socks.get_mut(&sockid) else {
            return ReadState::Drained;
        };
        if !s.tag_available || s.eof || s.reset {
            return ReadState::Drained;
        }
        let Some(ch) = self.channels.get(&s.remote_id) else {
            return ReadState::Drained;
        };
        let max_read = self
            .settings
            .max_read_len
            .min(ch.max_frame().saturating_sub(DATA_FRAME_OVERHEAD));
        if max_read == 0 {
            return ReadState::Drained;
        }
        for _ in 0..self.settings.read_budget {
            let mut outcome = Recv::WouldBlock;
            let (sock, tag) = (&s.sock, s.tag);
            let sent = ch.send_with(DATA_FRAME_OVERHEAD + max_read, |frame, seqnum| {
                let data = &mut frame[RECVDATA_DATA_OFFSET..RECVDATA_DATA_OFFSET + max_read];
                let n = match (&*sock).read(data) {
                    Ok(0) => {
                        outcome = Recv::Eof;
                        0
                    }
                    Ok(n) => {
                        outcome = Recv::Data;
                        n
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                        outcome = Recv::Interrupted;
                        return Ok(None);
                    }
                    Err(e) => {
                        outcome = Recv::Failed(e);
                        0
                    }
                };
                Ok(Some(netmsg::write_recvdata_header(frame, seqnum, tag, sockid, n)?))
            });
            match sent {
                Ok(_) => {}
                Err(ChannelError::Busy) => return ReadState::Blocked,
                Err(e) => {
                    debug!("context {}: E_RECVDATA for {:#x}: {}", self.id, sockid, e);
                    return ReadState::Drained;
                }
            }
            match outcome {
                Recv::Data | Recv::Interrupted => {}
                Recv::WouldBlock => return ReadState::Drained,
                Recv::Eof | Recv::Failed(_) => {
                    if let Recv::Failed(e) = outcome {
                        debug!("context {}: read {:#x}: {}", self.id, sockid, e);
                    }
                    s.eof = true;
                    let keep = (!s.staging.is_empty()).then_some(Interest::WRITABLE);
                    if let Err(e) = s.set_interest(registry, keep) {
                        debug!("context {}: deregister {:#x}: {}", self.id, sockid, e);
                    }
                    return ReadState::Drained;
                }
            }
        }
        ReadState::More
    }

    /// Answer a pending `T_CONNECT` now that its socket reported readiness.
    fn finish_connect(&mut self, sockid: u64) {
        self.pending_connects.retain(|&id| id != sockid);
        let registry = self.poll.registry();
        let Some(s) = self.socks.get_mut(&sockid) else {
            return;
        };
        let Some(pending) = s.connecting.take() else {
            return;
        };
        let Some(ch) = self.channels.get(&s.remote_id) else {
            return;
        };
        let outcome = match s.sock.take_error() {
            Ok(None) => s.sock.peer_addr().map(|_| ()),
            Ok(Some(e)) | Err(e) => Err(e),
        };
        let rc = match outcome {
            Ok(()) => establish(s, registry, ch),
            Err(e) => {
                if let Err(e) = s.set_interest(registry, None) {
                    debug!("context {}: deregister {:#x}: {}", self.id, sockid, e);
                }
                neg_errno(&e)
            }
        };
        debug!("context {}: connect {:#x} finished, rc {}", self.id, sockid, rc);
        if let Err(e) = ch.send(pending.tag, Body::RConnect { rc }) {
            debug!("context {}: R_CONNECT for {:#x}: {}", self.id, sockid, e);
        }
    }

    /// Fail connects that outlived `connect_timeout` with `-ETIMEDOUT`.
    fn expire_connects(&mut self) {
        if self.pending_connects.is_empty() {
            return;
        }
        let now = Instant::now();
        let registry = self.poll.registry();
        let (socks, channels, ctx_id) = (&mut self.socks, &self.channels, self.id);
        self.pending_connects.retain(|sockid| {
            let Some(s) = socks.get_mut(sockid) else {
                return false;
            };
            let Some(pending) = s.connecting else {
                return false;
            };
            if pending.deadline > now {
                return true;
            }
            s.connecting = None;
            if let Err(e) = s.set_interest(registry, None) {
                debug!("context {}: deregister {:#x}: {}", ctx_id, sockid, e);
            }
            if let Some(ch) = channels.get(&s.remote_id) {
                let reply = Body::RConnect {
                    rc: -libc::ETIMEDOUT,
                };
                if let Err(e) = ch.send(pending.tag, reply) {
                    debug!("context {}: R_CONNECT for {:#x}: {}", ctx_id, sockid, e);
                }
            }
            false
        });
    }

    /// Flush the staging backlog; drop writable interest once it is empty.
    fn on_writable(&mut self, sockid: u64) {
        let registry = self.poll.registry();
        let Some(s) = self.socks.get_mut(&sockid) else {
            return;
        };
        match s.staging.flush_to(NoSignal(&s.sock)) {
            Ok(n) => {
                if n > 0 {
                    s.stalls.reset();
                }
            }
            Err(e) => {
                debug!("context {}: flush {:#x}: {}", self.id, sockid, e);
                s.staging.clear();
            }
        }
        if s.staging.is_empty() {
            let want = (!s.eof).then_some(Interest::READABLE);
            if let Err(e) = s.set_interest(registry, want) {
                debug!("context {}: reregister {:#x}: {}", self.id, sockid, e);
            }
        }
    }
}

/// Socket owned by `remote_id`, or the rc to answer with.
fn lookup(
    socks: &mut HashMap<u64, HostSocket>,
    remote_id: u32,
    sockid: u64,
) -> Result<&mut HostSocket, i32> {
    match socks.get_mut(&sockid) {
        Some(s) if s.remote_id == remote_id => {
            if s.reset {
                Err(-libc::ECONNRESET)
            } else {
                Ok(s)
            }
        }
        _ => Err(-libc::EBADF),
    }
}

fn neg_errno(e: &io::Error) -> i32 {
    -e.raw_os_error().unwrap_or(libc::EIO)
}

fn rc_of(res: io::Result<()>) -> i32 {
    match res {
        Ok(()) => 0,
        Err(e) => neg_errno(&e),
    }
}

fn byte_rc(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

/// What a request on an existing socket needs from its context.
struct SockEnv<'a> {
    registry: &'a Registry,
    listen: &'a ListenRegistry,
    settings: &'a CtxSettings,
    ctx_id: u32,
    channel: &'a Channel,
}

impl SockEnv<'_> {
    /// Run `body` against `s`. `None` when the answer comes later.
    fn execute(&self, s: &mut HostSocket, tag: u64, body: Body) -> Result<Option<Body>, CtxError> {
        if let Body::TConnect { addr, .. } = body {
            return Ok(self.connect(s, addr.into(), tag).map(|rc| Body::RConnect { rc }));
        }
        Ok(Some(match body {
            Body::TBind { addr, .. } => Body::RBind {
                rc: self.bind(s, addr.into()),
            },
            Body::TListen { backlog, .. } => Body::RListen {
                rc: self.listen(s, backlog),
            },
            Body::TSetsockopt {
                level,
                optname,
                optval,
                ..
            } => Body::RSetsockopt {
                rc: setsockopt(s, level, optname, &optval),
            },
            Body::TGetsockopt {
                level,
                optname,
                optlen,
                ..
            } => match getsockopt(s, level, optname, optlen as usize) {
                Ok(optval) => Body::RGetsockopt { rc: 0, optval },
                Err(rc) => Body::RGetsockopt {
                    rc,
                    optval: Vec::new(),
                },
            },
            Body::TSendmsg { flags, msg, .. } => Body::RSendmsg {
                rc: sendmsg(s, flags, &msg),
            },
            Body::TSenddata { data, .. } => Body::RSenddata {
                rc: self.senddata(s, &data)?,
            },
            Body::TShutdown { how, .. } => Body::RShutdown {
                rc: shutdown(s, how),
            },
            other => return Err(CtxError::Unexpected(other.command())),
        }))
    }

    fn bind(&self, s: &mut HostSocket, addr: SocketAddrV4) -> i32 {
        if !s.is_stream() {
            return rc_of(s.sock.bind(&addr.into()));
        }
        let member = ListenMember {
            remote_id: s.remote_id,
            ctx_id: self.ctx_id,
            sockid: s.sockid,
            tag: s.tag,
        };
        match self.listen.bind(addr, &s.sock, member) {
            Ok(shared) => {
                if let Some(dup) = shared {
                    s.sock = dup;
                }
                if addr.port() != 0 {
                    s.listen_key = Some(addr);
                }
                0
            }
            Err(e) => neg_errno(&e),
        }
    }

    /// Start a non-blocking connect. `None` while the handshake is in
    /// flight; the context answers once the socket turns writable.
    fn connect(&self, s: &mut HostSocket, addr: SocketAddrV4, tag: u64) -> Option<i32> {
        if s.connecting.is_some() {
            return Some(-libc::EALREADY);
        }
        if let Err(e) = s.sock.set_nonblocking(true) {
            return Some(neg_errno(&e));
        }
        match s.sock.connect(&addr.into()) {
            Ok(()) => Some(establish(s, self.registry, self.channel)),
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                if let Err(e) = s.set_interest(self.registry, Some(Interest::WRITABLE)) {
                    return Some(neg_errno(&e));
                }
                s.connecting = Some(PendingConnect {
                    tag,
                    deadline: Instant::now() + self.settings.connect_timeout,
                });
                None
            }
            Err(e) => Some(neg_errno(&e)),
        }
    }

    fn listen(&self, s: &mut HostSocket, backlog: i32) -> i32 {
        let res = s.sock.listen(backlog).and_then(|_| s.sock.set_nonblocking(true));
        if let Err(e) = res {
            return neg_errno(&e);
        }
        if let Err(e) = s.set_interest(self.registry, Some(Interest::READABLE)) {
            return neg_errno(&e);
        }
        s.state = SockState::Listen;
        self.channel.socktbl().move_to(s.sockid, SockState::Listen);
        if let Some(key) = s.listen_key {
            self.listen.listen(key, s.sockid);
        }
        0
    }

    /// `T_SENDDATA`: rc is the bytes accepted. A send that takes nothing is
    /// a stall; the socket is reset once more than `max_stalls` of them span
    /// `stall_timeout` without the socket draining.
    fn senddata(&self, s: &mut HostSocket, data: &[u8]) -> Result<i32, CtxError> {
        let accepted = match s.send_or_stage(data) {
            Ok(n) => n,
            Err(e) => return Ok(neg_errno(&e)),
        };
        if accepted == 0 && !data.is_empty() {
            let (max, window) = (self.settings.max_stalls, self.settings.stall_timeout);
            if s.stalls.record(max, window, Instant::now()) {
                self.force_close(s)?;
                return Ok(-libc::ECONNRESET);
            }
            return Ok(-libc::EAGAIN);
        }
        s.stalls.reset();
        if !s.staging.is_empty() && (s.interest.is_some() || s.eof) {
            let want = if s.eof {
                Interest::WRITABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };
            if let Err(e) = s.set_interest(self.registry, Some(want)) {
                debug!("context {}: writable interest {:#x}: {}", self.ctx_id, s.sockid, e);
            }
        }
        Ok(byte_rc(accepted))
    }

    /// Shut an ill-behaved socket and report end of stream to the node.
    fn force_close(&self, s: &mut HostSocket) -> Result<(), CtxError> {
        warn!(
            "context {}: socket {:#x} of node {} stalled {} times, forcing close",
            self.ctx_id,
            s.sockid,
            s.remote_id,
            s.stalls.count()
        );
        if let Err(e) = s.set_interest(self.registry, None) {
            debug!("context {}: deregister {:#x}: {}", self.ctx_id, s.sockid, e);
        }
        if let Err(e) = s.sock.shutdown(Shutdown::Both) {
            debug!("context {}: shutdown {:#x}: {}", self.ctx_id, s.sockid, e);
        }
        s.staging.clear();
        s.reset = true;
        if s.tag_available && !s.eof {
            s.eof = true;
            let eos = Body::ERecvdata {
                sockid: s.sockid,
                data: Vec::new(),
            };
            self.channel.send(s.tag, eos)?;
        }
        Ok(())
    }
}

/// Connected: watch for data and file the socket as OUT.
fn establish(s: &mut HostSocket, registry: &Registry, ch: &Channel) -> i32 {
    if let Err(e) = s.set_interest(registry, Some(Interest::READABLE)) {
        return neg_errno(&e);
    }
    s.state = SockState::Out;
    ch.socktbl().move_to(s.sockid, SockState::Out);
    0
}

fn setsockopt(s: &HostSocket, level: i32, optname: i32, optval: &[u8]) -> i32 {
    let rc = unsafe {
        libc::setsockopt(
            s.fd(),
            level,
            optname,
            optval.as_ptr().cast(),
            optval.len() as libc::socklen_t,
        )
    };
    if rc < 0 {
        neg_errno(&io::Error::last_os_error())
    } else {
        0
    }
}

fn getsockopt(s: &HostSocket, level: i32, optname: i32, optlen: usize) -> Result<Vec<u8>, i32> {
    let mut optval = vec![0u8; optlen.min(MAX_OPTLEN)];
    let mut len = optval.len() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            s.fd(),
            level,
            optname,
            optval.as_mut_ptr().cast(),
            &mut len,
        )
    };
    if rc < 0 {
        return Err(neg_errno(&io::Error::last_os_error()));
    }
    optval.truncate(len as usize);
    Ok(optval)
}

fn sendmsg(s: &mut HostSocket, flags: i32, msg: &MsgHdr) -> i32 {
    if !s.staging.is_empty() {
        if let Err(e) = s.staging.flush_to(NoSignal(&s.sock)) {
            return neg_errno(&e);
        }
        if !s.staging.is_empty() {
            return -libc::EAGAIN;
        }
    }
    let mut iov: Vec<libc::iovec> = msg
        .iov
        .iter()
        .map(|b| libc::iovec {
            iov_base: b.as_ptr() as *mut libc::c_void,
            iov_len: b.len(),
        })
        .collect();
    // SAFETY: msghdr is plain data; every pointer set below outlives the call.
    let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
    if !msg.name.is_empty() {
        hdr.msg_name = msg.name.as_ptr() as *mut libc::c_void;
        hdr.msg_namelen = msg.name.len() as libc::socklen_t;
    }
    hdr.msg_iov = iov.as_mut_ptr();
    hdr.msg_iovlen = iov.len() as _;
    if !msg.control.is_empty() {
        hdr.msg_control = msg.control.as_ptr() as *mut libc::c_void;
        hdr.msg_controllen = msg.control.len() as _;
    }
    let n = unsafe { libc::sendmsg(s.fd(), &hdr, flags | libc::MSG_NOSIGNAL) };
    if n < 0 {
        neg_errno(&io::Error::last_os_error())
    } else {
        byte_rc(n as usize)
    }
}

fn shutdown(s: &HostSocket, how: i32) -> i32 {
    let how = match how {
        libc::SHUT_RD => Shutdown::Read,
        libc::SHUT_WR => Shutdown::Write,
        libc::SHUT_RDWR => Shutdown::Both,
        _ => return -libc::EINVAL,
    };
    rc_of(s.sock.shutdown(how))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn host_socket(sockid: u64) -> HostSocket {
        let sock = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        HostSocket::new(sock, sockid, 1, 42, 256)
    }

    #[test]
    fn lookup_checks_owner_and_reset() {
        let mut socks = HashMap::new();
        socks.insert(7, host_socket(7));
        assert!(lookup(&mut socks, 1, 7).is_ok());
        assert_eq!(lookup(&mut socks, 2, 7).err(), Some(-libc::EBADF));
        assert_eq!(lookup(&mut socks, 1, 8).err(), Some(-libc::EBADF));
        socks.get_mut(&7).unwrap().reset = true;
        assert_eq!(lookup(&mut socks, 1, 7).err(), Some(-libc::ECONNRESET));
    }

    #[test]
    fn sockopts_go_to_the_host_socket() {
        let s = host_socket(1);
        let one = 1i32.to_ne_bytes();
        assert_eq!(setsockopt(&s, libc::SOL_SOCKET, libc::SO_KEEPALIVE, &one), 0);
        let got = getsockopt(&s, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 4).unwrap();
        assert_eq!(got.len(), 4);
        assert_ne!(i32::from_ne_bytes(got[..4].try_into().unwrap()), 0);

        let capped = getsockopt(&s, libc::SOL_SOCKET, libc::SO_KEEPALIVE, 1 << 20).unwrap();
        assert!(capped.len() <= MAX_OPTLEN);
        assert!(setsockopt(&s, libc::SOL_SOCKET, 0x7fff, &one) < 0);
    }

    #[test]
    fn shutdown_maps_how() {
        let s = host_socket(1);
        assert_eq!(shutdown(&s, 17), -libc::EINVAL);
        // Not connected.
        assert_eq!(shutdown(&s, libc::SHUT_RDWR), -libc::ENOTCONN);
    }

    #[test]
    fn sendmsg_with_name_reaches_a_datagram_peer() {
        let peer = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = match peer.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        let sock = Socket::new(Domain::IPV4, Type::DGRAM, None).unwrap();
        let mut s = HostSocket::new(sock, 1, 1, 42, 256);
        let name = netmsg::SockAddrIn::from(SocketAddrV4::new(Ipv4Addr::LOCALHOST, dest.port()));
        let msg = MsgHdr {
            name: name.to_bytes().to_vec(),
            iov: vec![b"ping ".to_vec(), b"pong".to_vec()],
            control: Vec::new(),
        };
        assert_eq!(sendmsg(&mut s, 0, &msg), 9);
        let mut buf = [0u8; 16];
        let (n, _) = peer.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ping pong");
    }
}
