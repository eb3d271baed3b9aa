//! C ABI for linking pcn-core as a static library into C/C++ applications on
//! the accelerator. Descriptors are small integers private to this table.
//! Failures return -1 and set `errno`.

use std::collections::HashMap;
use std::ffi::{c_void, CStr};
use std::io::IoSlice;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::slice;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::PcnError;
use crate::pcnlink::{LinkConfig, PcnLink, PlSocket, PollFlags};

/// Longest single sleep inside `pcnlink_poll`.
const POLL_RECHECK: Duration = Duration::from_millis(1);

struct FfiState {
    link: Arc<PcnLink>,
    socks: HashMap<c_int, Arc<PlSocket>>,
    next_fd: c_int,
}

static STATE: Mutex<Option<FfiState>> = Mutex::new(None);

fn state() -> MutexGuard<'static, Option<FfiState>> {
    STATE.lock().unwrap_or_else(|e| e.into_inner())
}

fn set_errno(e: c_int) {
    unsafe {
        *libc::__errno_location() = e;
    }
}

fn fail(e: &PcnError) -> c_int {
    log::debug!("pcnlink call failed: {}", e);
    set_errno(e.errno());
    -1
}

fn socket_for(fd: c_int) -> Result<Arc<PlSocket>, PcnError> {
    let st = state();
    let st = st.as_ref().ok_or(PcnError::LinkDown)?;
    st.socks.get(&fd).cloned().ok_or(PcnError::Closed)
}

fn link() -> Result<Arc<PcnLink>, PcnError> {
    state()
        .as_ref()
        .map(|st| st.link.clone())
        .ok_or(PcnError::LinkDown)
}

fn install(sock: PlSocket) -> Result<c_int, PcnError> {
    let mut st = state();
    let st = st.as_mut().ok_or(PcnError::LinkDown)?;
    let fd = st.next_fd;
    st.next_fd = st.next_fd.checked_add(1).ok_or(PcnError::Errno(libc::EMFILE))?;
    st.socks.insert(fd, Arc::new(sock));
    Ok(fd)
}

fn read_sockaddr(addr: *const libc::sockaddr, len: libc::socklen_t) -> Result<SocketAddrV4, PcnError> {
    if addr.is_null() || (len as usize) < mem::size_of::<libc::sockaddr_in>() {
        return Err(PcnError::Invalid("short sockaddr"));
    }
    let sin = unsafe { ptr::read_unaligned(addr as *const libc::sockaddr_in) };
    if c_int::from(sin.sin_family) != libc::AF_INET {
        return Err(PcnError::Errno(libc::EAFNOSUPPORT));
    }
    Ok(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    ))
}

fn write_sockaddr(sa: SocketAddrV4, addr: *mut libc::sockaddr, len: *mut libc::socklen_t) {
    if addr.is_null() || len.is_null() {
        return;
    }
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = sa.port().to_be();
    sin.sin_addr.s_addr = u32::from(*sa.ip()).to_be();
    let full = mem::size_of::<libc::sockaddr_in>();
    unsafe {
        let n = (*len as usize).min(full);
        ptr::copy_nonoverlapping(&sin as *const _ as *const u8, addr as *mut u8, n);
        *len = full as libc::socklen_t;
    }
}

fn bytes<'a>(buf: *const c_void, len: usize) -> &'a [u8] {
    if buf.is_null() || len == 0 {
        &[]
    } else {
        unsafe { slice::from_raw_parts(buf as *const u8, len) }
    }
}

/// Attach to the proxy. `server` ("host:port") may be null and `node_id` /
/// `local_port` 0 to take `PCNLINK_*` environment values or defaults.
#[no_mangle]
pub extern "C" fn pcnlink_up(server: *const c_char, node_id: c_int, local_port: c_int) -> c_int {
    let mut cfg = LinkConfig::from_env();
    if !server.is_null() {
        let raw = unsafe { CStr::from_ptr(server) };
        match raw.to_str().ok().and_then(|s| s.parse().ok()) {
            Some(addr) => cfg.server_addr = addr,
            None => return fail(&PcnError::Invalid("server address")),
        }
    }
    if node_id > 0 {
        cfg.node_id = node_id as u32;
    }
    if local_port > 0 {
        cfg.local_port = local_port as u32;
    }
    if state().is_some() {
        return fail(&PcnError::Errno(libc::EISCONN));
    }
    match PcnLink::up(cfg) {
        Ok(link) => {
            let mut st = state();
            if st.is_some() {
                return fail(&PcnError::Errno(libc::EISCONN));
            }
            *st = Some(FfiState {
                link: Arc::new(link),
                socks: HashMap::new(),
                next_fd: 3,
            });
            0
        }
        Err(e) => fail(&e),
    }
}

/// Detach from the proxy and drop every descriptor.
#[no_mangle]
pub extern "C" fn pcnlink_down() -> c_int {
    let Some(st) = state().take() else {
        return fail(&PcnError::LinkDown);
    };
    drop(st.socks);
    match Arc::try_unwrap(st.link) {
        Ok(link) => match link.down() {
            Ok(()) => 0,
            Err(e) => fail(&e),
        },
        // A call is still running on another thread; the link goes when it returns.
        Err(_) => 0,
    }
}

#[no_mangle]
pub extern "C" fn pcnlink_u_socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    match link()
        .and_then(|l| l.socket(domain, ty, protocol))
        .and_then(install)
    {
        Ok(fd) => fd,
        Err(e) => fail(&e),
    }
}

#[no_mangle]
pub extern "C" fn pcnlink_u_bind(fd: c_int, addr: *const libc::sockaddr, addrlen: libc::socklen_t) -> c_int {
    match read_sockaddr(addr, addrlen).and_then(|sa| socket_for(fd)?.bind(sa)) {
        Ok(()) => 0,
        Err(e) => fail(&e),
    }
}

#[no_mangle]
pub extern "C" fn pcnlink_u_connect(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: libc::socklen_t,
) -> c_int {
    match read_sockaddr(addr, addrlen).and_then(|sa| socket_for(fd)?.connect(sa)) {
        Ok(()) => 0,
        Err(e) => fail(&e),
    }
}

#[no_mangle]
pub extern "C" fn pcnlink_u_listen(fd: c_int, backlog: c_int) -> c_int {
    match socket_for(fd).and_then(|s| s.listen(backlog)) {
        Ok(()) => 0,
        Err(e) => fail(&e),
    }
}

#[no_mangle]
pub extern "C" fn pcnlink_u_setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: libc::socklen_t,
) -> c_int {
    let val = bytes(optval, optlen as usize);
    match socket_for(fd).and_then(|s| s.setsockopt(level, optname, val)) {
        Ok(()) => 0,
        Err(e) => fail(&e),
    }
}

#[no_mangle]
pub extern "C" fn pcnlink_u_getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut libc::socklen_t,
) -> c_int {
    if optval.is_null() || optlen.is_null() {
        return fail(&PcnError::Errno(libc::EFAULT));
    }
    let maxlen = unsafe { *optlen } as usize;
    match socket_for(fd).and_then(|s| s.getsockopt(level, optname, maxlen)) {
        Ok(val) => {
            unsafe {
                ptr::copy_nonoverlapping(val.as_ptr(), optval as *mut u8, val.len());
                *optlen = val.len() as libc::socklen_t;
            }
            0
        }
        Err(e) => fail(&e),
    }
}

/// `flags` are ignored; use `pcnlink_fcntl` for non-blocking mode.
#[no_mangle]
pub extern "C" fn pcnlink_u_send(fd: c_int, buf: *const c_void, len: usize, _flags: c_int) -> libc::ssize_t {
    let data = bytes(buf, len);
    match socket_for(fd).and_then(|s| s.send(data)) {
        Ok(n) => n as libc::ssize_t,
        Err(e) => fail(&e) as libc::ssize_t,
    }
}

#[no_mangle]
pub extern "C" fn pcnlink_u_sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> libc::ssize_t {
    if msg.is_null() {
        return fail(&PcnError::Errno(libc::EFAULT)) as libc::ssize_t;
    }
    let msg = unsafe { &*msg };
    let name = if msg.msg_name.is_null() || msg.msg_namelen == 0 {
        None
    } else {
        match read_sockaddr(msg.msg_name as *const libc::sockaddr, msg.msg_namelen) {
            Ok(sa) => Some(sa),
            Err(e) => return fail(&e) as libc::ssize_t,
        }
    };
    let iovecs: &[libc::iovec] = if msg.msg_iov.is_null() || msg.msg_iovlen == 0 {
        &[]
    } else {
        unsafe { slice::from_raw_parts(msg.msg_iov, msg.msg_iovlen as usize) }
    };
    let iov: Vec<IoSlice<'_>> = iovecs
        .iter()
        .map(|v| IoSlice::new(bytes(v.iov_base, v.iov_len)))
        .collect();
    let control = bytes(msg.msg_control, msg.msg_controllen as usize);
    match socket_for(fd).and_then(|s| s.sendmsg(name, &iov, control, flags)) {
        Ok(n) => n as libc::ssize_t,
        Err(e) => fail(&e) as libc::ssize_t,
    }
}

/// `flags` are ignored; use `pcnlink_fcntl` for non-blocking mode.
#[no_mangle]
pub extern "C" fn pcnlink_u_recv(fd: c_int, buf: *mut c_void, len: usize, _flags: c_int) -> libc::ssize_t {
    if buf.is_null() && len > 0 {
        return fail(&PcnError::Errno(libc::EFAULT)) as libc::ssize_t;
    }
    let out: &mut [u8] = if len == 0 {
        &mut []
    } else {
        unsafe { slice::from_raw_parts_mut(buf as *mut u8, len) }
    };
    match socket_for(fd).and_then(|s| s.recv(out)) {
        Ok(n) => n as libc::ssize_t,
        Err(e) => fail(&e) as libc::ssize_t,
    }
}

#[no_mangle]
pub extern "C" fn pcnlink_u_shutdown(fd: c_int, how: c_int) -> c_int {
    match socket_for(fd).and_then(|s| s.shutdown(how)) {
        Ok(()) => 0,
        Err(e) => fail(&e),
    }
}

#[no_mangle]
pub extern "C" fn pcnlink_u_close(fd: c_int) -> c_int {
    let sock = {
        let mut st = state();
        match st.as_mut() {
            Some(st) => st.socks.remove(&fd),
            None => None,
        }
    };
    match sock {
        Some(sock) => match sock.close() {
            Ok(()) => 0,
            Err(e) => fail(&e),
        },
        None => fail(&PcnError::Closed),
    }
}

#[no_mangle]
pub extern "C" fn pcnlink_u_accept(
    fd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut libc::socklen_t,
) -> c_int {
    match socket_for(fd).and_then(|s| s.accept()) {
        Ok((child, peer)) => match install(child) {
            Ok(child_fd) => {
                write_sockaddr(peer, addr, addrlen);
                child_fd
            }
            Err(e) => fail(&e),
        },
        Err(e) => fail(&e),
    }
}

/// `F_GETFL` / `F_SETFL` with `O_NONBLOCK`; other commands fail with `EINVAL`.
#[no_mangle]
pub extern "C" fn pcnlink_fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    let sock = match socket_for(fd) {
        Ok(sock) => sock,
        Err(e) => return fail(&e),
    };
    match cmd {
        libc::F_GETFL => {
            if sock.is_nonblocking() {
                libc::O_RDWR | libc::O_NONBLOCK
            } else {
                libc::O_RDWR
            }
        }
        libc::F_SETFL => {
            sock.set_nonblocking(arg & libc::O_NONBLOCK != 0);
            0
        }
        _ => fail(&PcnError::Invalid("fcntl command")),
    }
}

/// `poll(2)` over pcnlink descriptors. `timeout` is in milliseconds, negative
/// waits forever. Unknown descriptors report `POLLNVAL`.
#[no_mangle]
pub extern "C" fn pcnlink_poll(fds: *mut libc::pollfd, nfds: libc::nfds_t, timeout: c_int) -> c_int {
    if fds.is_null() && nfds > 0 {
        return fail(&PcnError::Errno(libc::EFAULT));
    }
    let link = match link() {
        Ok(link) => link,
        Err(e) => return fail(&e),
    };
    let fds: &mut [libc::pollfd] = if nfds == 0 {
        &mut []
    } else {
        unsafe { slice::from_raw_parts_mut(fds, nfds as usize) }
    };
    let deadline = (timeout >= 0).then(|| Instant::now() + Duration::from_millis(timeout as u64));
    loop {
        let seen = link.activity();
        let mut ready = 0;
        for pfd in fds.iter_mut() {
            let mask = match socket_for(pfd.fd) {
                Ok(sock) => {
                    let wanted = PollFlags::from_bits_truncate(pfd.events as u32)
                        | PollFlags::ERR
                        | PollFlags::HUP
                        | PollFlags::NVAL;
                    sock.poll() & wanted
                }
                Err(_) => PollFlags::NVAL,
            };
            pfd.revents = mask.bits() as libc::c_short;
            if !mask.is_empty() {
                ready += 1;
            }
        }
        if ready > 0 {
            return ready;
        }
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return 0;
                }
                (deadline - now).min(POLL_RECHECK)
            }
            None => POLL_RECHECK,
        };
        link.wait_activity(seen, slice);
    }
}
