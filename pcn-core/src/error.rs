//! Errors surfaced by the accelerator-side socket layer.

use std::io;

use crate::control::ControlError;
use crate::link::{ChannelError, LinkError};
use crate::netmsg::Command;

/// Error returned by [`crate::pcnlink`] operations. Every variant maps to
/// an errno via [`PcnError::errno`].
#[derive(Debug, thiserror::Error)]
pub enum PcnError {
    /// The host syscall failed with this errno.
    #[error("host call failed: errno {0}")]
    Errno(i32),
    #[error("operation would block")]
    WouldBlock,
    #[error("call timed out")]
    TimedOut,
    /// The socket was closed, or the call was cancelled by a close.
    #[error("socket closed")]
    Closed,
    /// The link to the proxy failed or was detached.
    #[error("link down")]
    LinkDown,
    #[error("expected {expected:?}, got {got:?}")]
    BadResponse { expected: Command, got: Command },
    #[error("unexpected {0:?} from proxy")]
    UnexpectedCommand(Command),
    #[error("tag {0} already has a call in flight")]
    TagCollision(u64),
    /// The proxy refused the attach with this (negative) errno.
    #[error("attach refused: rc {0}")]
    Refused(i32),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
}

impl PcnError {
    /// Positive errno for the C surface.
    pub fn errno(&self) -> i32 {
        match self {
            PcnError::Errno(e) => *e,
            PcnError::WouldBlock => libc::EAGAIN,
            PcnError::TimedOut => libc::ETIMEDOUT,
            PcnError::Closed => libc::EBADF,
            PcnError::LinkDown | PcnError::Channel(_) | PcnError::Link(_) => libc::EIO,
            PcnError::BadResponse { .. }
            | PcnError::UnexpectedCommand(_)
            | PcnError::TagCollision(_) => libc::EPROTO,
            PcnError::Refused(rc) => -rc,
            PcnError::Invalid(_) => libc::EINVAL,
            PcnError::Control(ControlError::Io(e)) | PcnError::Io(e) => {
                e.raw_os_error().unwrap_or(libc::EIO)
            }
            PcnError::Control(_) => libc::EPROTO,
        }
    }

    /// Turn a response `rc` into a byte count or an errno failure.
    pub(crate) fn check(rc: i32) -> Result<usize, PcnError> {
        if rc < 0 {
            Err(PcnError::Errno(-rc))
        } else {
            Ok(rc as usize)
        }
    }
}

impl From<PcnError> for io::Error {
    fn from(e: PcnError) -> io::Error {
        match e {
            PcnError::Io(e) => e,
            PcnError::WouldBlock => io::ErrorKind::WouldBlock.into(),
            other => io::Error::from_raw_os_error(other.errno()),
        }
    }
}
