//! Sockets: one handle per proxied host socket.

use std::io::{self, IoSlice, IoSliceMut, Read, Write};
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use bitflags::bitflags;
use crossbeam::channel::{Receiver, TryRecvError};
use log::{debug, warn};

use super::{lock, PcnLink, Shared, SockEvent};
use crate::error::PcnError;
use crate::link::Channel;
use crate::netmsg::{Body, MsgHdr, SockAddrIn, DATA_FRAME_OVERHEAD};
use crate::socktbl::SockState;

/// First pause before a blocking send retries a host socket that took
/// nothing; doubled on each further refusal up to [`SEND_RETRY_MAX`].
const SEND_RETRY_BACKOFF: Duration = Duration::from_millis(1);
const SEND_RETRY_MAX: Duration = Duration::from_millis(32);

bitflags! {
    /// `poll(2)` readiness bits, with the platform's values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PollFlags: u32 {
        const IN = libc::POLLIN as u32;
        const OUT = libc::POLLOUT as u32;
        const ERR = libc::POLLERR as u32;
        const HUP = libc::POLLHUP as u32;
        const NVAL = libc::POLLNVAL as u32;
        const RDHUP = libc::POLLRDHUP as u32;
    }
}

/// The single-slot "last received" cache plus end-of-stream latch.
#[derive(Default)]
struct RecvCache {
    last: Option<(Vec<u8>, usize)>,
    eof: bool,
}

impl RecvCache {
    fn take(&mut self, buf: &mut [u8]) -> usize {
        let Some((data, off)) = self.last.as_mut() else {
            return 0;
        };
        let n = (data.len() - *off).min(buf.len());
        buf[..n].copy_from_slice(&data[*off..*off + n]);
        *off += n;
        if *off == data.len() {
            self.last = None;
        }
        n
    }

    fn absorb(&mut self, tag: u64, event: SockEvent, buf: &mut [u8]) -> usize {
        match event {
            SockEvent::Data(data) if data.is_empty() => {
                self.eof = true;
                0
            }
            SockEvent::Data(data) => {
                self.last = Some((data, 0));
                self.take(buf)
            }
            SockEvent::Accept { sockid, .. } => {
                warn!("socket {}: dropping accept of {:#x} on a data socket", tag, sockid);
                0
            }
        }
    }

    fn readable(&self) -> bool {
        self.last.is_some() || self.eof
    }
}

pub(crate) struct SockCore {
    shared: Arc<Shared>,
    channel: Arc<Channel>,
    tag: u64,
    sockid: u64,
    ty: i32,
    events: Receiver<SockEvent>,
    cache: Mutex<RecvCache>,
    nonblocking: AtomicBool,
    closed: AtomicBool,
    /// `RDHUP`/`HUP` bits set by shutdown.
    hup: AtomicU32,
}

impl SockCore {
    pub(crate) fn tag(&self) -> u64 {
        self.tag
    }

    pub(crate) fn poll(&self) -> PollFlags {
        if self.closed.load(Ordering::Acquire) {
            return PollFlags::NVAL;
        }
        let mut mask = PollFlags::from_bits_truncate(self.hup.load(Ordering::Relaxed));
        if self.shared.is_down() {
            return mask | PollFlags::ERR | PollFlags::HUP;
        }
        match self.channel.socktbl().state_of(self.tag) {
            Some(SockState::In) | Some(SockState::Out) => {
                if self.channel.has_room(DATA_FRAME_OVERHEAD + 1) {
                    mask |= PollFlags::OUT;
                }
                if !self.events.is_empty() || lock(&self.cache).readable() {
                    mask |= PollFlags::IN;
                }
            }
            Some(SockState::Listen) => {
                if !self.events.is_empty() {
                    mask |= PollFlags::IN;
                }
            }
            Some(SockState::Epoll) => mask |= PollFlags::NVAL,
            Some(SockState::New) | None => {}
        }
        mask
    }

    /// Why the event queue disconnected.
    fn gone(&self) -> PcnError {
        if self.shared.is_down() {
            PcnError::LinkDown
        } else {
            PcnError::Closed
        }
    }

    /// Release everything this socket holds. With `wait` the close is a
    /// full call; otherwise T_CLOSE is queued and its response dropped.
    fn finish_close(&self, wait: bool) -> Result<(), PcnError> {
        let shared = &self.shared;
        shared.cancel_calls(self.tag);
        shared.unregister(self.tag);
        let res = if shared.is_down() {
            Ok(())
        } else if wait {
            shared
                .call(&self.channel, self.tag, Body::TClose { sockid: self.sockid })
                .and_then(|body| PcnError::check(body.rc().unwrap_or(0)))
                .map(|_| ())
        } else {
            if let Err(e) = self
                .channel
                .try_send(shared.next_tag(), Body::TClose { sockid: self.sockid })
            {
                debug!("socket {}: close not sent: {}", self.tag, e);
            }
            Ok(())
        };
        self.channel.socktbl().remove(self.tag);
        res
    }
}

/// A proxied socket. Calls block unless the socket is non-blocking.
pub struct PlSocket {
    core: Arc<SockCore>,
}

impl PcnLink {
    /// `socket(2)`. `SOCK_NONBLOCK` in `ty` makes the new socket non-blocking.
    pub fn socket(&self, domain: i32, ty: i32, protocol: i32) -> Result<PlSocket, PcnError> {
        let shared = &self.shared;
        if shared.is_down() {
            return Err(PcnError::LinkDown);
        }
        let nonblocking = ty & libc::SOCK_NONBLOCK != 0;
        let ty = ty & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC);
        let channel = shared.pick_channel();
        // The creating call's tag becomes the socket's event tag on the host.
        let tag = shared.next_tag();
        let events = shared.register(tag);
        let created = shared
            .call_tagged(&channel, tag, tag, Body::TSocket { domain, ty, protocol })
            .and_then(|body| match body {
                Body::RSocket { rc, sockid } => PcnError::check(rc).map(|_| sockid),
                other => Err(PcnError::UnexpectedCommand(other.command())),
            });
        let sockid = match created {
            Ok(sockid) => sockid,
            Err(e) => {
                shared.unregister(tag);
                return Err(e);
            }
        };
        channel.socktbl().add(tag, SockState::New);
        let sock = PlSocket::new(shared.clone(), channel, tag, sockid, ty, events);
        sock.set_nonblocking(nonblocking);
        Ok(sock)
    }
}

impl PlSocket {
    fn new(
        shared: Arc<Shared>,
        channel: Arc<Channel>,
        tag: u64,
        sockid: u64,
        ty: i32,
        events: Receiver<SockEvent>,
    ) -> Self {
        Self {
            core: Arc::new(SockCore {
                shared,
                channel,
                tag,
                sockid,
                ty,
                events,
                cache: Mutex::new(RecvCache::default()),
                nonblocking: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                hup: AtomicU32::new(0),
            }),
        }
    }

    pub(crate) fn core(&self) -> &Arc<SockCore> {
        &self.core
    }

    /// Host socket id.
    pub fn sockid(&self) -> u64 {
        self.core.sockid
    }

    /// Event tag: the id events for this socket are addressed to.
    pub fn tag(&self) -> u64 {
        self.core.tag
    }

    pub fn channel_id(&self) -> u32 {
        self.core.channel.id()
    }

    pub fn socket_type(&self) -> i32 {
        self.core.ty
    }

    /// Lifecycle state in the channel's socket table; None once closed.
    pub fn state(&self) -> Option<SockState> {
        self.core.channel.socktbl().state_of(self.core.tag)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.core.nonblocking.store(nonblocking, Ordering::Relaxed);
    }

    pub fn is_nonblocking(&self) -> bool {
        self.core.nonblocking.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<(), PcnError> {
        if self.core.closed.load(Ordering::Acquire) {
            Err(PcnError::Closed)
        } else {
            Ok(())
        }
    }

    fn rpc(&self, body: Body) -> Result<Body, PcnError> {
        self.ensure_open()?;
        self.core.shared.call(&self.core.channel, self.core.tag, body)
    }

    fn rpc_rc(&self, body: Body) -> Result<usize, PcnError> {
        let reply = self.rpc(body)?;
        match reply.rc() {
            Some(rc) => PcnError::check(rc),
            None => Err(PcnError::UnexpectedCommand(reply.command())),
        }
    }

    fn mark(&self, state: SockState) {
        self.core.channel.socktbl().move_to(self.core.tag, state);
    }

    pub fn bind(&self, addr: SocketAddrV4) -> Result<(), PcnError> {
        self.rpc_rc(Body::TBind {
            sockid: self.core.sockid,
            addr: addr.into(),
        })?;
        self.mark(SockState::Listen);
        Ok(())
    }

    pub fn connect(&self, addr: SocketAddrV4) -> Result<(), PcnError> {
        self.rpc_rc(Body::TConnect {
            sockid: self.core.sockid,
            addr: addr.into(),
        })?;
        self.mark(SockState::Out);
        Ok(())
    }

    pub fn listen(&self, backlog: i32) -> Result<(), PcnError> {
        self.rpc_rc(Body::TListen {
            sockid: self.core.sockid,
            backlog,
        })?;
        self.mark(SockState::Listen);
        Ok(())
    }

    pub fn setsockopt(&self, level: i32, optname: i32, optval: &[u8]) -> Result<(), PcnError> {
        self.rpc_rc(Body::TSetsockopt {
            sockid: self.core.sockid,
            level,
            optname,
            optval: optval.to_vec(),
        })
        .map(|_| ())
    }

    /// Option value, at most `maxlen` bytes of it.
    pub fn getsockopt(&self, level: i32, optname: i32, maxlen: usize) -> Result<Vec<u8>, PcnError> {
        let reply = self.rpc(Body::TGetsockopt {
            sockid: self.core.sockid,
            level,
            optname,
            optlen: u32::try_from(maxlen).unwrap_or(u32::MAX),
        })?;
        match reply {
            Body::RGetsockopt { rc, mut optval } => {
                PcnError::check(rc)?;
                optval.truncate(maxlen);
                Ok(optval)
            }
            other => Err(PcnError::UnexpectedCommand(other.command())),
        }
    }

    /// Send up to one frame's worth of `buf`; returns the bytes the host took.
    pub fn send(&self, buf: &[u8]) -> Result<usize, PcnError> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let room = self
            .core
            .channel
            .max_frame()
            .saturating_sub(DATA_FRAME_OVERHEAD);
        let chunk = &buf[..buf.len().min(room)];
        let mut backoff = SEND_RETRY_BACKOFF;
        loop {
            let sent = self.rpc_rc(Body::TSenddata {
                sockid: self.core.sockid,
                data: chunk.to_vec(),
            });
            match sent {
                Err(PcnError::Errno(libc::EAGAIN)) if self.is_nonblocking() => {
                    return Err(PcnError::WouldBlock)
                }
                Err(PcnError::Errno(libc::EAGAIN)) => {
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(SEND_RETRY_MAX);
                }
                other => return other,
            }
        }
    }

    /// `sendmsg(2)` with an optional destination, a gather list and control data.
    pub fn sendmsg(
        &self,
        name: Option<SocketAddrV4>,
        iov: &[IoSlice<'_>],
        control: &[u8],
        flags: i32,
    ) -> Result<usize, PcnError> {
        let msg = MsgHdr {
            name: name
                .map(|addr| SockAddrIn::from(addr).to_bytes().to_vec())
                .unwrap_or_default(),
            iov: iov.iter().map(|v| v.to_vec()).collect(),
            control: control.to_vec(),
        };
        self.rpc_rc(Body::TSendmsg {
            sockid: self.core.sockid,
            flags,
            msg,
        })
    }

    /// Copy received bytes into `buf`. Leftovers of a delivered event are
    /// returned first; 0 means end of stream.
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, PcnError> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let core = &self.core;
        let mut copied = 0;
        loop {
            {
                let mut cache = lock(&core.cache);
                copied += cache.take(&mut buf[copied..]);
                while copied < buf.len() {
                    match core.events.try_recv() {
                        Ok(ev) => copied += cache.absorb(core.tag, ev, &mut buf[copied..]),
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            if copied > 0 || cache.eof {
                                return Ok(copied);
                            }
                            return Err(core.gone());
                        }
                    }
                }
                if copied > 0 || cache.eof {
                    return Ok(copied);
                }
            }
            if self.is_nonblocking() {
                return Err(PcnError::WouldBlock);
            }
            let ev = core.events.recv().map_err(|_| core.gone())?;
            copied += lock(&core.cache).absorb(core.tag, ev, buf);
            if copied > 0 {
                return Ok(copied);
            }
        }
    }

    /// `recv` scattered over `iov`.
    pub fn recvmsg(&self, iov: &mut [IoSliceMut<'_>]) -> Result<usize, PcnError> {
        let total = iov.iter().map(|v| v.len()).sum();
        let mut staging = vec![0u8; total];
        let n = self.recv(&mut staging)?;
        let mut rest = &staging[..n];
        for v in iov.iter_mut() {
            if rest.is_empty() {
                break;
            }
            let k = rest.len().min(v.len());
            v[..k].copy_from_slice(&rest[..k]);
            rest = &rest[k..];
        }
        Ok(n)
    }

    /// Wait for the next connection the proxy routed to this listener and
    /// open the child socket for it.
    pub fn accept(&self) -> Result<(PlSocket, SocketAddrV4), PcnError> {
        self.ensure_open()?;
        let core = &self.core;
        loop {
            let ev = if self.is_nonblocking() {
                match core.events.try_recv() {
                    Ok(ev) => ev,
                    Err(TryRecvError::Empty) => return Err(PcnError::WouldBlock),
                    Err(TryRecvError::Disconnected) => return Err(core.gone()),
                }
            } else {
                core.events.recv().map_err(|_| core.gone())?
            };
            match ev {
                SockEvent::Accept {
                    channel_id,
                    sockid,
                    addr,
                } => return self.adopt(channel_id, sockid, addr),
                SockEvent::Data(data) => {
                    warn!(
                        "socket {}: dropping {} data bytes on a listener",
                        core.tag,
                        data.len()
                    );
                }
            }
        }
    }

    /// Materialize an accepted host socket and tell the proxy its tag.
    fn adopt(
        &self,
        channel_id: u32,
        sockid: u64,
        addr: SockAddrIn,
    ) -> Result<(PlSocket, SocketAddrV4), PcnError> {
        let shared = &self.core.shared;
        let channel = shared.channel(channel_id).ok_or(PcnError::LinkDown)?;
        let tag = shared.next_tag();
        let events = shared.register(tag);
        channel.socktbl().add(tag, SockState::In);
        if let Err(e) = channel.send(tag, Body::NSocket { sockid }) {
            shared.unregister(tag);
            channel.socktbl().remove(tag);
            return Err(e.into());
        }
        let child = PlSocket::new(shared.clone(), channel, tag, sockid, self.core.ty, events);
        Ok((child, addr.into()))
    }

    /// `shutdown(2)`; also latches `RDHUP` (one direction) or `HUP` (both) for poll.
    pub fn shutdown(&self, how: i32) -> Result<(), PcnError> {
        self.rpc_rc(Body::TShutdown {
            sockid: self.core.sockid,
            how,
        })?;
        let bit = if how == libc::SHUT_RDWR {
            PollFlags::HUP
        } else {
            PollFlags::RDHUP
        };
        self.core.hup.fetch_or(bit.bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Close the socket. Calls still waiting on it fail with
    /// [`PcnError::Closed`]; responses that arrive for them later are dropped.
    pub fn close(&self) -> Result<(), PcnError> {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Err(PcnError::Closed);
        }
        self.core.finish_close(true)
    }

    pub fn poll(&self) -> PollFlags {
        self.core.poll()
    }
}

impl Drop for PlSocket {
    fn drop(&mut self) {
        if !self.core.closed.swap(true, Ordering::AcqRel) {
            let _ = self.core.finish_close(false);
        }
    }
}

impl Read for PlSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf).map_err(io::Error::from)
    }
}

impl Write for PlSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send(buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netmsg::Command;
    use crate::pcnlink::tests::{attach_pair, wait_until, FakeHost};
    use std::net::Ipv4Addr;

    /// Create a socket through the fake host and connect it.
    fn connected(pl: &PcnLink, host: &FakeHost, sockid: u64) -> PlSocket {
        thread::scope(|s| {
            let call = s.spawn(|| {
                let sock = pl.socket(libc::AF_INET, libc::SOCK_STREAM, 0)?;
                sock.connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 80))?;
                Ok::<_, PcnError>(sock)
            });
            host.create(sockid);
            let (ch, req) = host.expect(Command::TConnect);
            host.answer(ch, &req, 0);
            call.join().unwrap().unwrap()
        })
    }

    #[test]
    fn bind_and_listen_move_state() {
        let (pl, host) = attach_pair("bind", 2);
        thread::scope(|s| {
            let call = s.spawn(|| {
                let sock = pl.socket(libc::AF_INET, libc::SOCK_STREAM, 0)?;
                sock.bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 9999))?;
                sock.listen(64)?;
                Ok::<_, PcnError>(sock)
            });
            let (ch, sock_tag) = host.create(7);
            let (_, bind) = host.expect(Command::TBind);
            match &bind.body {
                Body::TBind { sockid, addr } => {
                    assert_eq!(*sockid, 7);
                    assert_eq!(addr.port, 9999);
                }
                _ => unreachable!(),
            }
            assert_ne!(bind.tag, sock_tag);
            host.answer(ch, &bind, 0);
            let (_, listen) = host.expect(Command::TListen);
            host.answer(ch, &listen, 0);
            let sock = call.join().unwrap().unwrap();
            assert_eq!(sock.tag(), sock_tag);
            assert_eq!(sock.state(), Some(SockState::Listen));
        });
    }

    #[test]
    fn sockets_spread_round_robin() {
        let (pl, host) = attach_pair("rr", 2);
        let a = connected(&pl, &host, 1);
        let b = connected(&pl, &host, 2);
        assert_ne!(a.channel_id(), b.channel_id());
        assert_eq!(a.state(), Some(SockState::Out));
    }

    #[test]
    fn recv_serves_partial_reads_then_eof() {
        let (pl, host) = attach_pair("recv", 1);
        let sock = connected(&pl, &host, 5);
        sock.set_nonblocking(true);
        assert!(matches!(sock.recv(&mut [0u8; 8]), Err(PcnError::WouldBlock)));
        sock.set_nonblocking(false);

        host.send(0, sock.tag(), Body::ERecvdata { sockid: 5, data: b"hello world".to_vec() });
        let mut buf = [0u8; 5];
        assert_eq!(sock.recv(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert!(sock.poll().contains(PollFlags::IN | PollFlags::OUT));
        let mut rest = [0u8; 64];
        assert_eq!(sock.recv(&mut rest).unwrap(), 6);
        assert_eq!(&rest[..6], b" world");

        host.send(0, sock.tag(), Body::ERecvdata { sockid: 5, data: Vec::new() });
        assert_eq!(sock.recv(&mut rest).unwrap(), 0);
        assert_eq!(sock.recv(&mut rest).unwrap(), 0);
    }

    #[test]
    fn recvmsg_scatters() {
        let (pl, host) = attach_pair("recvmsg", 1);
        let sock = connected(&pl, &host, 5);
        host.send(0, sock.tag(), Body::ERecvdata { sockid: 5, data: b"abcdef".to_vec() });
        let (mut a, mut b) = ([0u8; 2], [0u8; 8]);
        let n = sock
            .recvmsg(&mut [IoSliceMut::new(&mut a), IoSliceMut::new(&mut b)])
            .unwrap();
        assert_eq!(n, 6);
        assert_eq!(&a, b"ab");
        assert_eq!(&b[..4], b"cdef");
    }

    #[test]
    fn send_reports_bytes_and_retries_eagain() {
        let (pl, host) = attach_pair("send", 1);
        let sock = connected(&pl, &host, 9);
        thread::scope(|s| {
            let call = s.spawn(|| sock.send(b"hello world!\0"));
            let (ch, req) = host.expect(Command::TSenddata);
            host.answer(ch, &req, -libc::EAGAIN);
            let (ch, retry) = host.expect(Command::TSenddata);
            match &retry.body {
                Body::TSenddata { sockid, data } => {
                    assert_eq!(*sockid, 9);
                    assert_eq!(data.as_slice(), b"hello world!\0");
                }
                _ => unreachable!(),
            }
            host.answer(ch, &retry, 13);
            assert_eq!(call.join().unwrap().unwrap(), 13);
        });
        sock.set_nonblocking(true);
        thread::scope(|s| {
            let call = s.spawn(|| sock.send(b"x"));
            let (ch, req) = host.expect(Command::TSenddata);
            host.answer(ch, &req, -libc::EAGAIN);
            assert!(matches!(call.join().unwrap(), Err(PcnError::WouldBlock)));
        });
    }

    #[test]
    fn sendmsg_carries_name_and_iov() {
        let (pl, host) = attach_pair("sendmsg", 1);
        let sock = connected(&pl, &host, 4);
        let dest = SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 5353);
        thread::scope(|s| {
            let call = s.spawn(|| {
                sock.sendmsg(Some(dest), &[IoSlice::new(b"ab"), IoSlice::new(b"cd")], &[], 0)
            });
            let (ch, req) = host.expect(Command::TSendmsg);
            match &req.body {
                Body::TSendmsg { msg, .. } => {
                    assert_eq!(SockAddrIn::from_bytes(&msg.name), Some(dest.into()));
                    assert_eq!(msg.iov, vec![b"ab".to_vec(), b"cd".to_vec()]);
                    assert_eq!(msg.data_len(), 4);
                }
                _ => unreachable!(),
            }
            host.answer(ch, &req, 4);
            assert_eq!(call.join().unwrap().unwrap(), 4);
        });
    }

    #[test]
    fn getsockopt_returns_value() {
        let (pl, host) = attach_pair("getsockopt", 1);
        let sock = connected(&pl, &host, 4);
        thread::scope(|s| {
            let call = s.spawn(|| sock.getsockopt(libc::SOL_SOCKET, libc::SO_SNDBUF, 4));
            let (ch, req) = host.expect(Command::TGetsockopt);
            host.send(
                ch,
                req.tag,
                Body::RGetsockopt { rc: 0, optval: 65536i32.to_ne_bytes().to_vec() },
            );
            assert_eq!(call.join().unwrap().unwrap(), 65536i32.to_ne_bytes().to_vec());
        });
    }

    #[test]
    fn accept_adopts_child_and_registers_tag() {
        let (pl, host) = attach_pair("accept", 2);
        let listener = connected(&pl, &host, 1);
        listener.set_nonblocking(true);
        assert!(matches!(listener.accept(), Err(PcnError::WouldBlock)));

        let peer = SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 9), 41000);
        host.send(1, listener.tag(), Body::EAccept { sockid: 77, addr: peer.into() });
        wait_until("accept event", || listener.poll().contains(PollFlags::IN));
        let (child, addr) = listener.accept().unwrap();
        assert_eq!(addr, peer);
        assert_eq!(child.sockid(), 77);
        assert_eq!(child.channel_id(), 1);
        assert_eq!(child.state(), Some(SockState::In));

        let (ch, note) = host.expect(Command::NSocket);
        assert_eq!(ch, 1);
        assert_eq!(note.tag, child.tag());
        assert_eq!(note.body, Body::NSocket { sockid: 77 });
    }

    #[test]
    fn close_discards_late_response() {
        let (pl, host) = attach_pair("late", 1);
        let sock = connected(&pl, &host, 3);
        thread::scope(|s| {
            let sender = s.spawn(|| sock.send(b"late"));
            let (ch, send_req) = host.expect(Command::TSenddata);
            let closer = s.spawn(|| sock.close());
            let (_, close_req) = host.expect(Command::TClose);
            host.answer(ch, &close_req, 0);
            assert!(matches!(sender.join().unwrap(), Err(PcnError::Closed)));
            closer.join().unwrap().unwrap();
            // The proxy answers the send only now.
            host.answer(ch, &send_req, 4);
        });
        wait_until("late drop", || pl.stats().dropped == 1);
        assert_eq!(pl.pending_calls(), 0);
        assert!(matches!(sock.close(), Err(PcnError::Closed)));
        assert!(matches!(sock.send(b"x"), Err(PcnError::Closed)));
        assert_eq!(sock.poll(), PollFlags::NVAL);
        assert_eq!(sock.state(), None);
    }

    #[test]
    fn shutdown_latches_hangup_bits() {
        let (pl, host) = attach_pair("shutdown", 1);
        let sock = connected(&pl, &host, 2);
        thread::scope(|s| {
            let call = s.spawn(|| sock.shutdown(libc::SHUT_WR));
            let (ch, req) = host.expect(Command::TShutdown);
            host.answer(ch, &req, 0);
            call.join().unwrap().unwrap();
        });
        assert!(sock.poll().contains(PollFlags::RDHUP));
        assert!(!sock.poll().contains(PollFlags::HUP));
    }

    #[test]
    fn link_loss_ends_recv() {
        let (pl, host) = attach_pair("loss", 1);
        let sock = connected(&pl, &host, 2);
        drop(host);
        wait_until("link down", || pl.is_down());
        assert!(matches!(sock.recv(&mut [0u8; 4]), Err(PcnError::LinkDown)));
        assert!(sock.poll().contains(PollFlags::ERR | PollFlags::HUP));
    }
}
