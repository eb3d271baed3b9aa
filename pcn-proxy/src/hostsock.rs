//! Host-side state of one proxied socket.

use std::io::{self, Write};
use std::net::SocketAddrV4;
use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use pcn_core::SockState;
use socket2::{Socket, Type};

/// Fixed buffer holding bytes a send could not push to the kernel yet.
pub struct StagingBuffer {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
}

impl StagingBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0; size].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Copy as much of `data` as fits. Returns the bytes taken.
    pub fn push(&mut self, data: &[u8]) -> usize {
        if self.end + data.len() > self.buf.len() && self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        let n = data.len().min(self.buf.len() - self.end);
        self.buf[self.end..self.end + n].copy_from_slice(&data[..n]);
        self.end += n;
        n
    }

    /// Write staged bytes until empty or the writer would block.
    /// Returns the bytes written.
    pub fn flush_to<W: Write>(&mut self, mut w: W) -> io::Result<usize> {
        let mut written = 0;
        while !self.is_empty() {
            match w.write(&self.buf[self.start..self.end]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.start += n;
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        if self.is_empty() {
            self.clear();
        }
        Ok(written)
    }
}

/// Sends that made no progress on one socket since it last drained, and
/// when that run of stalls began.
#[derive(Debug, Default)]
pub struct StallCounter {
    stalls: u32,
    since: Option<Instant>,
}

impl StallCounter {
    /// Count one stall at `now`. Returns true once more than `max_stalls`
    /// stalls have piled up over at least `window` without the socket
    /// draining in between.
    pub fn record(&mut self, max_stalls: u32, window: Duration, now: Instant) -> bool {
        let since = *self.since.get_or_insert(now);
        self.stalls = self.stalls.saturating_add(1);
        self.stalls > max_stalls && now.saturating_duration_since(since) >= window
    }

    pub fn reset(&mut self) {
        self.stalls = 0;
        self.since = None;
    }

    pub fn count(&self) -> u32 {
        self.stalls
    }
}

/// `send` without raising SIGPIPE.
pub struct NoSignal<'a>(pub &'a Socket);

impl Write for NoSignal<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.send_with_flags(buf, libc::MSG_NOSIGNAL)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A `T_CONNECT` still in flight.
#[derive(Debug, Clone, Copy)]
pub struct PendingConnect {
    /// Call tag the `R_CONNECT` answers.
    pub tag: u64,
    pub deadline: Instant,
}

/// A real host socket acting for one accelerator socket.
pub struct HostSocket {
    pub sock: Socket,
    pub sockid: u64,
    /// Node that owns the socket.
    pub remote_id: u32,
    /// Event tag on the node side. Accepted sockets learn it from `N_SOCKET`.
    pub tag: u64,
    pub tag_available: bool,
    pub state: SockState,
    /// Listen group this socket belongs to.
    pub listen_key: Option<SocketAddrV4>,
    /// Interest currently registered with the context's poll, if any.
    pub interest: Option<Interest>,
    pub staging: StagingBuffer,
    pub stalls: StallCounter,
    /// Forcibly closed; every request but `T_CLOSE` fails.
    pub reset: bool,
    /// End of stream already reported to the node.
    pub eof: bool,
    pub connecting: Option<PendingConnect>,
}

impl HostSocket {
    pub fn new(sock: Socket, sockid: u64, remote_id: u32, tag: u64, staging_size: usize) -> Self {
        Self {
            sock,
            sockid,
            remote_id,
            tag,
            tag_available: true,
            state: SockState::New,
            listen_key: None,
            interest: None,
            staging: StagingBuffer::new(staging_size),
            stalls: StallCounter::default(),
            reset: false,
            eof: false,
            connecting: None,
        }
    }

    pub fn fd(&self) -> i32 {
        self.sock.as_raw_fd()
    }

    /// Register, reregister or deregister with the context's poll so that
    /// exactly `interest` is watched. The token is the sockid.
    pub fn set_interest(&mut self, registry: &Registry, interest: Option<Interest>) -> io::Result<()> {
        let fd = self.fd();
        let token = Token(self.sockid as usize);
        match (self.interest, interest) {
            (None, Some(want)) => registry.register(&mut SourceFd(&fd), token, want)?,
            (Some(have), Some(want)) if have != want => {
                registry.reregister(&mut SourceFd(&fd), token, want)?
            }
            (Some(_), None) => registry.deregister(&mut SourceFd(&fd))?,
            _ => {}
        }
        self.interest = interest;
        Ok(())
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.sock.r#type(), Ok(ty) if ty == Type::STREAM)
    }

    /// Forward `data`, staging what the kernel does not take. Returns the
    /// bytes accepted (sent plus staged).
    pub fn send_or_stage(&mut self, data: &[u8]) -> io::Result<usize> {
        if !self.staging.is_empty() {
            self.staging.flush_to(NoSignal(&self.sock))?;
            if !self.staging.is_empty() {
                return Ok(self.staging.push(data));
            }
        }
        let sent = match NoSignal(&self.sock).write(data) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e),
        };
        Ok(sent + self.staging.push(&data[sent..]))
    }
}

/// Raise the send buffer of `sock` to the system maximum.
pub fn raise_sndbuf(sock: &Socket) {
    let max = std::fs::read_to_string("/proc/sys/net/core/wmem_max")
        .ok()
        .and_then(|s| s.trim().parse::<usize>().ok());
    if let Some(max) = max {
        if let Err(e) = sock.set_send_buffer_size(max) {
            log::debug!("SO_SNDBUF {}: {}", max, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writer that takes at most `room` bytes in total.
    struct Sink {
        got: Vec<u8>,
        room: usize,
    }

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.room == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.room);
            self.got.extend_from_slice(&buf[..n]);
            self.room -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn staging_fills_then_flushes_in_order() {
        let mut st = StagingBuffer::new(8);
        assert_eq!(st.push(b"abcde"), 5);
        assert_eq!(st.push(b"fghij"), 3);
        assert_eq!(st.len(), 8);

        let mut sink = Sink {
            got: Vec::new(),
            room: 3,
        };
        assert_eq!(st.flush_to(&mut sink).unwrap(), 3);
        assert_eq!(st.len(), 5);
        // Freed head space is reused after compaction.
        assert_eq!(st.push(b"xyz!"), 3);

        sink.room = 100;
        st.flush_to(&mut sink).unwrap();
        assert!(st.is_empty());
        assert_eq!(sink.got, b"abcdefghxyz");
    }

    #[test]
    fn stall_counter_trips_past_threshold_and_window() {
        let window = Duration::from_millis(500);
        let t0 = Instant::now();
        let mut c = StallCounter::default();
        assert!(!c.record(2, window, t0));
        assert!(!c.record(2, window, t0 + Duration::from_millis(1)));
        // Past the count but not yet the window: a fast retry loop alone
        // never trips it.
        for ms in 2..100 {
            assert!(!c.record(2, window, t0 + Duration::from_millis(ms)));
        }
        assert!(c.record(2, window, t0 + window));
        c.reset();
        assert_eq!(c.count(), 0);
        assert!(!c.record(2, window, t0 + window * 4));
    }

    #[test]
    fn stall_counter_window_restarts_after_progress() {
        let window = Duration::from_millis(100);
        let t0 = Instant::now();
        let mut c = StallCounter::default();
        for ms in 0..5 {
            c.record(1, window, t0 + Duration::from_millis(ms));
        }
        c.reset();
        // The earlier run does not count toward the new one.
        assert!(!c.record(1, window, t0 + Duration::from_millis(150)));
        assert!(!c.record(1, window, t0 + Duration::from_millis(200)));
        assert!(c.record(1, window, t0 + Duration::from_millis(250)));
    }

    #[test]
    fn send_or_stage_counts_staged_bytes() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        let sock = Socket::from(std::os::fd::OwnedFd::from(a));
        sock.set_nonblocking(true).unwrap();
        sock.set_send_buffer_size(4096).unwrap();
        let mut hs = HostSocket::new(sock, 1, 1, 7, 1024);

        let chunk = vec![0x5a; 64 * 1024];
        let mut accepted = 0;
        while hs.staging.len() < 1024 {
            accepted += hs.send_or_stage(&chunk).unwrap();
        }
        // Staging is full; nothing more is taken until the peer reads.
        assert_eq!(hs.send_or_stage(&chunk).unwrap(), 0);
        assert!(accepted >= 1024);
        drop(b);
    }
}
