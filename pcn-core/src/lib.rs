//! PCN transport core.
//!
//! Lets an accelerator node use the host's network stack: socket calls made
//! through [`pcnlink`] become Netmsg requests carried over a Link of
//! queue-pair Channels to the host proxy, which runs them against real
//! sockets and answers with responses and events.

pub mod control;
pub mod error;
pub mod fabric;
pub mod ffi;
pub mod link;
pub mod netmsg;
pub mod pcnlink;
pub mod queue;
pub mod socktbl;

pub use control::{ControlChannel, ControlMsg, CONTROL_VERSION};
pub use error::PcnError;
pub use fabric::Fabric;
pub use link::{Channel, ChannelError, ConnInfo, Link, LinkError, LinkParams, CHANNEL_NUM_PORTS};
pub use netmsg::{Body, Command, Netmsg};
pub use pcnlink::{parse_size, LinkConfig, PcnLink, PlEpoll, PlSocket, PollFlags};
pub use socktbl::{SockState, SocketTable};

/// Node ids on a fabric: the host (0) plus up to eight accelerators.
pub const MAX_REMOTES: usize = 9;
