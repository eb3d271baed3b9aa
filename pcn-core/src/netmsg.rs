//! Netmsg wire protocol: fixed header, per-command bodies, dry-run sizing.
//!
//! Every frame is packed and little-endian. The header is 24 bytes:
//!
//! | offset | width | field                                      |
//! |--------|-------|--------------------------------------------|
//! | 0      | 8     | `seqnum` (advisory, [`UNKNOWN_SEQNUM`] if unset) |
//! | 8      | 4     | `size`, total frame length including header |
//! | 12     | 4     | `command` ([`Command`])                    |
//! | 16     | 8     | `tag`, requester-chosen correlation id     |
//!
//! Responses continue with `rc: i32` at offset 24 (negative errno on failure).
//! Bodies, starting at offset 24:
//!
//! | command        | body                                                          |
//! |----------------|---------------------------------------------------------------|
//! | `T_SOCKET`     | domain i32, type i32, protocol i32                            |
//! | `T_BIND`/`T_CONNECT` | sockid u64, addrlen u32, sockaddr_in (16)               |
//! | `T_LISTEN`     | sockid u64, backlog i32                                       |
//! | `T_SETSOCKOPT` | sockid u64, level i32, optname i32, optlen u32, optval        |
//! | `T_GETSOCKOPT` | sockid u64, level i32, optname i32, optlen u32                |
//! | `T_SENDMSG`    | sockid u64, flags i32, namelen u32, iovlen u32, controllen u32, name, iovlen x (len u32, bytes), control |
//! | `T_SENDDATA`   | sockid u64, datalen u32, data                                 |
//! | `T_SHUTDOWN`   | sockid u64, how i32                                           |
//! | `T_CLOSE`      | sockid u64                                                    |
//! | `R_SOCKET`     | rc i32, sockid u64                                            |
//! | `R_GETSOCKOPT` | rc i32, optlen u32, optval                                    |
//! | other `R_*`    | rc i32                                                        |
//! | `E_ACCEPT`     | sockid u64, addrlen u32, sockaddr_in (16)                     |
//! | `E_RECVDATA`   | sockid u64, datalen u32, data                                 |
//! | `N_SOCKET`     | sockid u64                                                    |
//!
//! `sockaddr_in` is family u16 (LE), port u16 (network order), address (4
//! octets), 8 zero bytes. Cache-line sizing of the response header is a
//! performance note only; nothing here depends on alignment.

use std::net::{Ipv4Addr, SocketAddrV4};

/// Length of the fixed header.
pub const HEADER_LEN: usize = 24;
/// Length of a response carrying only `rc`.
pub const RESPONSE_LEN: usize = HEADER_LEN + 4;
/// Sentinel for a frame whose sequence number was never assigned.
pub const UNKNOWN_SEQNUM: u64 = u64::MAX;
/// Encoded size of a `sockaddr_in`.
pub const SOCKADDR_IN_LEN: usize = 16;
/// Fixed bytes in front of the payload of `T_SENDDATA` and `E_RECVDATA`.
pub const DATA_FRAME_OVERHEAD: usize = HEADER_LEN + 8 + 4;
/// Offset of the payload bytes inside an `E_RECVDATA` frame.
pub const RECVDATA_DATA_OFFSET: usize = DATA_FRAME_OVERHEAD;

/// Wire command numbers. Requests are 0..=9, responses 10..=19 in the same
/// order, then events and the notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    TSocket = 0,
    TBind = 1,
    TConnect = 2,
    TListen = 3,
    TSetsockopt = 4,
    TGetsockopt = 5,
    TSendmsg = 6,
    TSenddata = 7,
    TShutdown = 8,
    TClose = 9,
    RSocket = 10,
    RBind = 11,
    RConnect = 12,
    RListen = 13,
    RSetsockopt = 14,
    RGetsockopt = 15,
    RSendmsg = 16,
    RSenddata = 17,
    RShutdown = 18,
    RClose = 19,
    EAccept = 20,
    ERecvdata = 21,
    NSocket = 22,
}

const REQUEST_COUNT: u32 = 10;

/// Which side originates a command and how it is correlated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Accelerator to host, answered by exactly one response with the same tag.
    Request,
    /// Host to accelerator, completes the request with the same tag.
    Response,
    /// Host to accelerator, unsolicited; tag names the owning socket.
    Event,
    /// Accelerator to host, no response.
    Notification,
}

impl Command {
    pub fn family(self) -> Family {
        match self as u32 {
            0..=9 => Family::Request,
            10..=19 => Family::Response,
            20 | 21 => Family::Event,
            _ => Family::Notification,
        }
    }

    /// The response command answering this request, if it is one.
    pub fn response(self) -> Option<Command> {
        if self.family() == Family::Request {
            Command::try_from(self as u32 + REQUEST_COUNT).ok()
        } else {
            None
        }
    }
}

impl TryFrom<u32> for Command {
    type Error = DecodeError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        use Command::*;
        const ALL: [Command; 23] = [
            TSocket, TBind, TConnect, TListen, TSetsockopt, TGetsockopt, TSendmsg, TSenddata,
            TShutdown, TClose, RSocket, RBind, RConnect, RListen, RSetsockopt, RGetsockopt,
            RSendmsg, RSenddata, RShutdown, RClose, EAccept, ERecvdata, NSocket,
        ];
        ALL.get(raw as usize)
            .copied()
            .ok_or(DecodeError::UnknownCommand(raw))
    }
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub seqnum: u64,
    pub size: u32,
    pub command: Command,
    pub tag: u64,
}

impl Header {
    /// Read the header at the front of `buf` without touching the body.
    pub fn decode(buf: &[u8]) -> Result<Header, DecodeError> {
        let mut r = Reader::new(buf);
        let seqnum = r.u64()?;
        let size = r.u32()?;
        let command = Command::try_from(r.u32()?)?;
        let tag = r.u64()?;
        Ok(Header {
            seqnum,
            size,
            command,
            tag,
        })
    }
}

/// IPv4 socket address in `sockaddr_in` layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SockAddrIn {
    pub family: u16,
    pub port: u16,
    pub addr: Ipv4Addr,
}

impl SockAddrIn {
    /// Raw `sockaddr_in` bytes, as carried in `T_SENDMSG` names.
    pub fn to_bytes(&self) -> [u8; SOCKADDR_IN_LEN] {
        let mut out = [0u8; SOCKADDR_IN_LEN];
        out[0..2].copy_from_slice(&self.family.to_le_bytes());
        out[2..4].copy_from_slice(&self.port.to_be_bytes());
        out[4..8].copy_from_slice(&self.addr.octets());
        out
    }

    pub fn from_bytes(raw: &[u8]) -> Option<SockAddrIn> {
        if raw.len() < 8 {
            return None;
        }
        Some(SockAddrIn {
            family: u16::from_le_bytes([raw[0], raw[1]]),
            port: u16::from_be_bytes([raw[2], raw[3]]),
            addr: Ipv4Addr::new(raw[4], raw[5], raw[6], raw[7]),
        })
    }
}

impl From<SocketAddrV4> for SockAddrIn {
    fn from(sa: SocketAddrV4) -> Self {
        Self {
            family: libc::AF_INET as u16,
            port: sa.port(),
            addr: *sa.ip(),
        }
    }
}

impl From<SockAddrIn> for SocketAddrV4 {
    fn from(sa: SockAddrIn) -> Self {
        SocketAddrV4::new(sa.addr, sa.port)
    }
}

/// `msghdr` equivalent for `T_SENDMSG`: name, gather list and ancillary data
/// carried as explicit length-prefixed blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgHdr {
    pub name: Vec<u8>,
    pub iov: Vec<Vec<u8>>,
    pub control: Vec<u8>,
}

impl MsgHdr {
    /// Total payload bytes across the gather list.
    pub fn data_len(&self) -> usize {
        self.iov.iter().map(Vec::len).sum()
    }
}

/// Command-specific body. The variant determines the header `command`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    TSocket { domain: i32, ty: i32, protocol: i32 },
    TBind { sockid: u64, addr: SockAddrIn },
    TConnect { sockid: u64, addr: SockAddrIn },
    TListen { sockid: u64, backlog: i32 },
    TSetsockopt { sockid: u64, level: i32, optname: i32, optval: Vec<u8> },
    TGetsockopt { sockid: u64, level: i32, optname: i32, optlen: u32 },
    TSendmsg { sockid: u64, flags: i32, msg: MsgHdr },
    TSenddata { sockid: u64, data: Vec<u8> },
    TShutdown { sockid: u64, how: i32 },
    TClose { sockid: u64 },
    RSocket { rc: i32, sockid: u64 },
    RBind { rc: i32 },
    RConnect { rc: i32 },
    RListen { rc: i32 },
    RSetsockopt { rc: i32 },
    RGetsockopt { rc: i32, optval: Vec<u8> },
    RSendmsg { rc: i32 },
    RSenddata { rc: i32 },
    RShutdown { rc: i32 },
    RClose { rc: i32 },
    EAccept { sockid: u64, addr: SockAddrIn },
    ERecvdata { sockid: u64, data: Vec<u8> },
    NSocket { sockid: u64 },
}

impl Body {
    pub fn command(&self) -> Command {
        match self {
            Body::TSocket { .. } => Command::TSocket,
            Body::TBind { .. } => Command::TBind,
            Body::TConnect { .. } => Command::TConnect,
            Body::TListen { .. } => Command::TListen,
            Body::TSetsockopt { .. } => Command::TSetsockopt,
            Body::TGetsockopt { .. } => Command::TGetsockopt,
            Body::TSendmsg { .. } => Command::TSendmsg,
            Body::TSenddata { .. } => Command::TSenddata,
            Body::TShutdown { .. } => Command::TShutdown,
            Body::TClose { .. } => Command::TClose,
            Body::RSocket { .. } => Command::RSocket,
            Body::RBind { .. } => Command::RBind,
            Body::RConnect { .. } => Command::RConnect,
            Body::RListen { .. } => Command::RListen,
            Body::RSetsockopt { .. } => Command::RSetsockopt,
            Body::RGetsockopt { .. } => Command::RGetsockopt,
            Body::RSendmsg { .. } => Command::RSendmsg,
            Body::RSenddata { .. } => Command::RSenddata,
            Body::RShutdown { .. } => Command::RShutdown,
            Body::RClose { .. } => Command::RClose,
            Body::EAccept { .. } => Command::EAccept,
            Body::ERecvdata { .. } => Command::ERecvdata,
            Body::NSocket { .. } => Command::NSocket,
        }
    }

    /// Return code of a response body.
    pub fn rc(&self) -> Option<i32> {
        match self {
            Body::RSocket { rc, .. }
            | Body::RBind { rc }
            | Body::RConnect { rc }
            | Body::RListen { rc }
            | Body::RSetsockopt { rc }
            | Body::RGetsockopt { rc, .. }
            | Body::RSendmsg { rc }
            | Body::RSenddata { rc }
            | Body::RShutdown { rc }
            | Body::RClose { rc } => Some(*rc),
            _ => None,
        }
    }

    /// Target host socket of a request or event.
    pub fn sockid(&self) -> Option<u64> {
        match self {
            Body::TBind { sockid, .. }
            | Body::TConnect { sockid, .. }
            | Body::TListen { sockid, .. }
            | Body::TSetsockopt { sockid, .. }
            | Body::TGetsockopt { sockid, .. }
            | Body::TSendmsg { sockid, .. }
            | Body::TSenddata { sockid, .. }
            | Body::TShutdown { sockid, .. }
            | Body::TClose { sockid }
            | Body::RSocket { sockid, .. }
            | Body::EAccept { sockid, .. }
            | Body::ERecvdata { sockid, .. }
            | Body::NSocket { sockid } => Some(*sockid),
            _ => None,
        }
    }

    /// Response to `request` carrying only a return code. Extra response
    /// fields are zero/empty; used for failures and for plain acknowledgements.
    pub fn response_to(request: Command, rc: i32) -> Option<Body> {
        Some(match request {
            Command::TSocket => Body::RSocket { rc, sockid: 0 },
            Command::TBind => Body::RBind { rc },
            Command::TConnect => Body::RConnect { rc },
            Command::TListen => Body::RListen { rc },
            Command::TSetsockopt => Body::RSetsockopt { rc },
            Command::TGetsockopt => Body::RGetsockopt { rc, optval: Vec::new() },
            Command::TSendmsg => Body::RSendmsg { rc },
            Command::TSenddata => Body::RSenddata { rc },
            Command::TShutdown => Body::RShutdown { rc },
            Command::TClose => Body::RClose { rc },
            _ => return None,
        })
    }

    fn write(&self, w: &mut Writer<'_>) -> Result<(), EncodeError> {
        match self {
            Body::TSocket {
                domain,
                ty,
                protocol,
            } => {
                w.i32(*domain);
                w.i32(*ty);
                w.i32(*protocol);
            }
            Body::TBind { sockid, addr }
            | Body::TConnect { sockid, addr }
            | Body::EAccept { sockid, addr } => {
                w.u64(*sockid);
                w.sockaddr(addr);
            }
            Body::TListen { sockid, backlog } => {
                w.u64(*sockid);
                w.i32(*backlog);
            }
            Body::TSetsockopt {
                sockid,
                level,
                optname,
                optval,
            } => {
                w.u64(*sockid);
                w.i32(*level);
                w.i32(*optname);
                w.blob(optval)?;
            }
            Body::TGetsockopt {
                sockid,
                level,
                optname,
                optlen,
            } => {
                w.u64(*sockid);
                w.i32(*level);
                w.i32(*optname);
                w.u32(*optlen);
            }
            Body::TSendmsg { sockid, flags, msg } => {
                w.u64(*sockid);
                w.i32(*flags);
                w.u32(len_u32(msg.name.len())?);
                w.u32(len_u32(msg.iov.len())?);
                w.u32(len_u32(msg.control.len())?);
                w.put(&msg.name);
                for iov in &msg.iov {
                    w.blob(iov)?;
                }
                w.put(&msg.control);
            }
            Body::TSenddata { sockid, data } | Body::ERecvdata { sockid, data } => {
                w.u64(*sockid);
                w.blob(data)?;
            }
            Body::TShutdown { sockid, how } => {
                w.u64(*sockid);
                w.i32(*how);
            }
            Body::TClose { sockid } | Body::NSocket { sockid } => w.u64(*sockid),
            Body::RSocket { rc, sockid } => {
                w.i32(*rc);
                w.u64(*sockid);
            }
            Body::RGetsockopt { rc, optval } => {
                w.i32(*rc);
                w.blob(optval)?;
            }
            Body::RBind { rc }
            | Body::RConnect { rc }
            | Body::RListen { rc }
            | Body::RSetsockopt { rc }
            | Body::RSendmsg { rc }
            | Body::RSenddata { rc }
            | Body::RShutdown { rc }
            | Body::RClose { rc } => w.i32(*rc),
        }
        Ok(())
    }

    fn read(command: Command, r: &mut Reader<'_>) -> Result<Body, DecodeError> {
        Ok(match command {
            Command::TSocket => Body::TSocket {
                domain: r.i32()?,
                ty: r.i32()?,
                protocol: r.i32()?,
            },
            Command::TBind => Body::TBind {
                sockid: r.u64()?,
                addr: r.sockaddr()?,
            },
            Command::TConnect => Body::TConnect {
                sockid: r.u64()?,
                addr: r.sockaddr()?,
            },
            Command::TListen => Body::TListen {
                sockid: r.u64()?,
                backlog: r.i32()?,
            },
            Command::TSetsockopt => Body::TSetsockopt {
                sockid: r.u64()?,
                level: r.i32()?,
                optname: r.i32()?,
                optval: r.blob("optval")?,
            },
            Command::TGetsockopt => Body::TGetsockopt {
                sockid: r.u64()?,
                level: r.i32()?,
                optname: r.i32()?,
                optlen: r.u32()?,
            },
            Command::TSendmsg => {
                let sockid = r.u64()?;
                let flags = r.i32()?;
                let namelen = r.u32()?;
                let iovlen = r.u32()?;
                let controllen = r.u32()?;
                let name = r.bytes("name", namelen)?;
                // each iov costs at least its 4-byte length
                if iovlen as usize > r.remaining() / 4 {
                    return Err(DecodeError::LengthOverrun {
                        field: "iovlen",
                        len: iovlen,
                        available: r.remaining(),
                    });
                }
                let mut iov = Vec::with_capacity(iovlen as usize);
                for _ in 0..iovlen {
                    iov.push(r.blob("iov")?);
                }
                let control = r.bytes("control", controllen)?;
                Body::TSendmsg {
                    sockid,
                    flags,
                    msg: MsgHdr { name, iov, control },
                }
            }
            Command::TSenddata => Body::TSenddata {
                sockid: r.u64()?,
                data: r.blob("datalen")?,
            },
            Command::TShutdown => Body::TShutdown {
                sockid: r.u64()?,
                how: r.i32()?,
            },
            Command::TClose => Body::TClose { sockid: r.u64()? },
            Command::RSocket => Body::RSocket {
                rc: r.i32()?,
                sockid: r.u64()?,
            },
            Command::RBind => Body::RBind { rc: r.i32()? },
            Command::RConnect => Body::RConnect { rc: r.i32()? },
            Command::RListen => Body::RListen { rc: r.i32()? },
            Command::RSetsockopt => Body::RSetsockopt { rc: r.i32()? },
            Command::RGetsockopt => Body::RGetsockopt {
                rc: r.i32()?,
                optval: r.blob("optlen")?,
            },
            Command::RSendmsg => Body::RSendmsg { rc: r.i32()? },
            Command::RSenddata => Body::RSenddata { rc: r.i32()? },
            Command::RShutdown => Body::RShutdown { rc: r.i32()? },
            Command::RClose => Body::RClose { rc: r.i32()? },
            Command::EAccept => Body::EAccept {
                sockid: r.u64()?,
                addr: r.sockaddr()?,
            },
            Command::ERecvdata => Body::ERecvdata {
                sockid: r.u64()?,
                data: r.blob("datalen")?,
            },
            Command::NSocket => Body::NSocket { sockid: r.u64()? },
        })
    }
}

/// One framed protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Netmsg {
    pub seqnum: u64,
    pub tag: u64,
    pub body: Body,
}

impl Netmsg {
    /// New message with an unassigned sequence number.
    pub fn new(tag: u64, body: Body) -> Self {
        Self {
            seqnum: UNKNOWN_SEQNUM,
            tag,
            body,
        }
    }

    pub fn command(&self) -> Command {
        self.body.command()
    }

    /// Dry run: exact encoded size, nothing written.
    pub fn encoded_len(&self) -> Result<usize, EncodeError> {
        let mut w = Writer::dry();
        self.write(&mut w, 0)?;
        Ok(w.pos)
    }

    /// Encode into the front of `buf`, returning the number of bytes written.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize, EncodeError> {
        let size = self.encoded_len()?;
        if buf.len() < size {
            return Err(EncodeError::BufferTooSmall {
                need: size,
                have: buf.len(),
            });
        }
        let mut w = Writer::new(&mut buf[..size]);
        self.write(&mut w, size as u32)?;
        Ok(size)
    }

    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut out = vec![0u8; self.encoded_len()?];
        self.encode_into(&mut out)?;
        Ok(out)
    }

    fn write(&self, w: &mut Writer<'_>, size: u32) -> Result<(), EncodeError> {
        w.u64(self.seqnum);
        w.u32(size);
        w.u32(self.command() as u32);
        w.u64(self.tag);
        self.body.write(w)?;
        if w.pos > u32::MAX as usize {
            return Err(EncodeError::TooLarge(w.pos));
        }
        Ok(())
    }

    /// Decode one frame from the front of `buf`. Reads at most the
    /// header-declared `size` bytes; anything after it is ignored.
    pub fn decode(buf: &[u8]) -> Result<Netmsg, DecodeError> {
        let header = Header::decode(buf)?;
        let size = header.size as usize;
        if size < HEADER_LEN || size > buf.len() {
            return Err(DecodeError::BadSize {
                size: header.size,
                available: buf.len(),
            });
        }
        let mut r = Reader::new(&buf[HEADER_LEN..size]);
        let body = Body::read(header.command, &mut r)?;
        Ok(Netmsg {
            seqnum: header.seqnum,
            tag: header.tag,
            body,
        })
    }
}

/// Fill in the header and fixed fields of an `E_RECVDATA` frame whose
/// `datalen` payload bytes were already written at [`RECVDATA_DATA_OFFSET`].
/// Returns the total frame length.
pub fn write_recvdata_header(
    frame: &mut [u8],
    seqnum: u64,
    tag: u64,
    sockid: u64,
    datalen: usize,
) -> Result<usize, EncodeError> {
    let size = RECVDATA_DATA_OFFSET + datalen;
    if frame.len() < size {
        return Err(EncodeError::BufferTooSmall {
            need: size,
            have: frame.len(),
        });
    }
    let mut w = Writer::new(&mut frame[..RECVDATA_DATA_OFFSET]);
    w.u64(seqnum);
    w.u32(len_u32(size)?);
    w.u32(Command::ERecvdata as u32);
    w.u64(tag);
    w.u64(sockid);
    w.u32(len_u32(datalen)?);
    Ok(size)
}

fn len_u32(len: usize) -> Result<u32, EncodeError> {
    u32::try_from(len).map_err(|_| EncodeError::TooLarge(len))
}

/// Error encoding a Netmsg.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    #[error("length {0} does not fit the wire format")]
    TooLarge(usize),
}

/// Error decoding a Netmsg. Every variant is a protocol error.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("bad frame size {size} ({available} bytes available)")]
    BadSize { size: u32, available: usize },
    #[error("unknown command {0}")]
    UnknownCommand(u32),
    #[error("{field} of {len} overruns frame ({available} bytes left)")]
    LengthOverrun {
        field: &'static str,
        len: u32,
        available: usize,
    },
    #[error("bad address length {0}")]
    BadAddrLen(u32),
}

/// Byte writer; without a buffer it only counts (dry run).
struct Writer<'a> {
    buf: Option<&'a mut [u8]>,
    pos: usize,
}

impl<'a> Writer<'a> {
    fn dry() -> Self {
        Self { buf: None, pos: 0 }
    }

    /// `buf` must be at least as long as the dry-run size.
    fn new(buf: &'a mut [u8]) -> Self {
        Self {
            buf: Some(buf),
            pos: 0,
        }
    }

    fn put(&mut self, bytes: &[u8]) {
        if let Some(buf) = self.buf.as_deref_mut() {
            buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        }
        self.pos += bytes.len();
    }

    fn u32(&mut self, v: u32) {
        self.put(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.put(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }

    fn blob(&mut self, bytes: &[u8]) -> Result<(), EncodeError> {
        self.u32(len_u32(bytes.len())?);
        self.put(bytes);
        Ok(())
    }

    fn sockaddr(&mut self, sa: &SockAddrIn) {
        self.u32(SOCKADDR_IN_LEN as u32);
        self.put(&sa.to_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                need: self.pos + n,
                have: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn bytes(&mut self, field: &'static str, len: u32) -> Result<Vec<u8>, DecodeError> {
        if len as usize > self.remaining() {
            return Err(DecodeError::LengthOverrun {
                field,
                len,
                available: self.remaining(),
            });
        }
        Ok(self.take(len as usize)?.to_vec())
    }

    fn blob(&mut self, field: &'static str) -> Result<Vec<u8>, DecodeError> {
        let len = self.u32()?;
        self.bytes(field, len)
    }

    fn sockaddr(&mut self) -> Result<SockAddrIn, DecodeError> {
        let addrlen = self.u32()?;
        if addrlen as usize > SOCKADDR_IN_LEN {
            return Err(DecodeError::BadAddrLen(addrlen));
        }
        let raw: [u8; SOCKADDR_IN_LEN] = self.array()?;
        SockAddrIn::from_bytes(&raw).ok_or(DecodeError::BadAddrLen(addrlen))
    }
}
