//! PCN host proxy.
//!
//! Accepts Link attachments from accelerator nodes on a TCP control port and
//! runs every socket call they forward against real host sockets, one
//! Network Context per worker thread.

pub mod affinity;
pub mod config;
pub mod hostsock;
pub mod listen;
pub mod netctx;
pub mod proxy;

pub use config::{Cli, Config};
pub use proxy::Proxy;
