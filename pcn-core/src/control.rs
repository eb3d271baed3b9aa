//! Out-of-band control channel used while attaching a Link.
//!
//! Framing: length-prefix (4 bytes LE) + bincode payload. Only the handshake
//! and barrier tokens travel here; RPC traffic uses the Channels.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::link::ConnInfo;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Control protocol version carried in [`ControlMsg::Hello`].
pub const CONTROL_VERSION: u8 = 1;

/// Sentinel exchanged once per Channel so neither side produces before the
/// other has created its outbound queue.
pub const BARRIER_TOKEN: u32 = 0xCAFE_BEBE;

/// Messages on the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMsg {
    /// Proxy greeting: version, channels per link and the first port of the
    /// proxy's queue port range.
    Hello {
        version: u8,
        num_channel: u32,
        base_port: u32,
    },
    /// Node to proxy: queue addressing for the new link, from the proxy's view.
    Attach(ConnInfo),
    /// Per-channel barrier.
    Barrier { token: u32 },
    /// Link is live (`rc == 0`) or refused (negative errno).
    Ack { rc: i32 },
    /// Node is leaving; the proxy detaches the link.
    Detach,
}

/// A raw point-to-point byte stream usable as the control channel.
pub trait ControlChannel: Read + Write + Send {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl ControlChannel for TcpStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

impl ControlChannel for UnixStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_read_timeout(self, timeout)
    }
}

/// Error on the blocking control channel.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("control channel I/O: {0}")]
    Io(#[from] io::Error),
    #[error("control message codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("control frame of {0} bytes exceeds the limit")]
    Oversized(u64),
    #[error("unexpected control message {0:?}")]
    Unexpected(ControlMsg),
}

impl ControlError {
    /// Read timed out with no frame started; the channel is still usable.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ControlError::Io(e)
            if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut))
    }
}

/// Length word of a control frame, checked against [`MAX_FRAME_LEN`].
fn frame_len(len: u64) -> Result<u32, ControlError> {
    u32::try_from(len)
        .ok()
        .filter(|&n| n <= MAX_FRAME_LEN)
        .ok_or(ControlError::Oversized(len))
}

/// Write one framed message. The payload is serialized straight after a
/// placeholder length word, which is patched once the size is known.
pub fn write_msg<W: Write + ?Sized>(w: &mut W, msg: &ControlMsg) -> Result<(), ControlError> {
    let mut frame = vec![0u8; LEN_SIZE];
    bincode::serialize_into(&mut frame, msg)?;
    let len = frame_len((frame.len() - LEN_SIZE) as u64)?;
    frame[..LEN_SIZE].copy_from_slice(&len.to_le_bytes());
    w.write_all(&frame)?;
    w.flush()?;
    Ok(())
}

/// Read one framed message, blocking until it is complete.
pub fn read_msg<R: Read + ?Sized>(r: &mut R) -> Result<ControlMsg, ControlError> {
    let mut word = [0u8; LEN_SIZE];
    r.read_exact(&mut word)?;
    let len = frame_len(u64::from(u32::from_le_bytes(word)))?;
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    Ok(bincode::deserialize(&payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hello() -> ControlMsg {
        ControlMsg::Hello {
            version: CONTROL_VERSION,
            num_channel: 4,
            base_port: 20001,
        }
    }

    #[test]
    fn frame_is_length_word_then_payload() {
        let mut buf = Vec::new();
        write_msg(&mut buf, &sample_hello()).unwrap();
        let len = u32::from_le_bytes(buf[..LEN_SIZE].try_into().unwrap()) as usize;
        assert_eq!(buf.len(), LEN_SIZE + len);
        assert_eq!(read_msg(&mut &buf[..]).unwrap(), sample_hello());
    }

    #[test]
    fn truncated_frame_is_an_io_error() {
        let mut buf = Vec::new();
        write_msg(&mut buf, &sample_hello()).unwrap();
        let err = read_msg(&mut &buf[..buf.len() - 1]).unwrap_err();
        assert!(matches!(err, ControlError::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof));
        assert!(!err.is_timeout());
    }

    #[test]
    fn oversized_length_word_is_refused_before_reading() {
        let mut buf = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        buf.extend_from_slice(&[0; 8]);
        assert!(matches!(
            read_msg(&mut &buf[..]),
            Err(ControlError::Oversized(n)) if n == u64::from(MAX_FRAME_LEN) + 1
        ));
    }

    #[test]
    fn garbage_payload_is_a_codec_error() {
        let mut buf = 2u32.to_le_bytes().to_vec();
        buf.extend_from_slice(&[0xff, 0xff]);
        assert!(matches!(read_msg(&mut &buf[..]), Err(ControlError::Codec(_))));
    }

    #[test]
    fn stream_carries_handshake_in_order() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let attach = ControlMsg::Attach(ConnInfo {
            remote_id: 2,
            remote_port: 25000,
            local_port: 20009,
        });
        write_msg(&mut a, &sample_hello()).unwrap();
        write_msg(&mut a, &attach).unwrap();
        write_msg(&mut a, &ControlMsg::Barrier { token: BARRIER_TOKEN }).unwrap();
        assert_eq!(read_msg(&mut b).unwrap(), sample_hello());
        assert_eq!(read_msg(&mut b).unwrap(), attach);
        assert_eq!(
            read_msg(&mut b).unwrap(),
            ControlMsg::Barrier { token: BARRIER_TOKEN }
        );
    }

    #[test]
    fn read_timeout_is_reported() {
        let (_a, mut b) = UnixStream::pair().unwrap();
        ControlChannel::set_read_timeout(&b, Some(Duration::from_millis(10))).unwrap();
        let err = read_msg(&mut b).unwrap_err();
        assert!(err.is_timeout());
    }
}
