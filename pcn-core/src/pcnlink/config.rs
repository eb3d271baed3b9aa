//! Link configuration for the accelerator side.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::Duration;

use crate::fabric::Fabric;

/// Node id of the host proxy.
pub const PCNSRV_ID: u32 = 0;
pub const DEFAULT_SERVER_PORT: u16 = 20000;
pub const DEFAULT_NODE_ID: u32 = 1;
pub const DEFAULT_LOCAL_PORT: u32 = 25000;
pub const DEFAULT_QSIZE: usize = 32 * 1024 * 1024;
pub const DEFAULT_REAP_THRESHOLD: usize = 1024 * 1024;
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_micros(50);

/// How new sockets are spread over the link's channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPolicy {
    Random,
    RoundRobin,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Proxy control address.
    pub server_addr: SocketAddr,
    pub server_id: u32,
    pub node_id: u32,
    /// First port of this node's master queues.
    pub local_port: u32,
    pub qsize: usize,
    pub reap_threshold: usize,
    /// Upper bound on a single RPC; None waits forever.
    pub rpc_timeout: Option<Duration>,
    pub channel_policy: ChannelPolicy,
    /// Drain worker sleep after a sweep that found nothing.
    pub idle_backoff: Duration,
    pub fabric_dir: PathBuf,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::LOCALHOST,
                DEFAULT_SERVER_PORT,
            )),
            server_id: PCNSRV_ID,
            node_id: DEFAULT_NODE_ID,
            local_port: DEFAULT_LOCAL_PORT,
            qsize: DEFAULT_QSIZE,
            reap_threshold: DEFAULT_REAP_THRESHOLD,
            rpc_timeout: None,
            channel_policy: ChannelPolicy::Random,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            fabric_dir: Fabric::default_dir(),
        }
    }
}

impl LinkConfig {
    /// Defaults overridden by `PCNLINK_*` / `PCN_FABRIC_DIR`. Unparseable
    /// values are logged and ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse("PCNLINK_SERVER", |s| s.parse::<SocketAddr>().ok()) {
            cfg.server_addr = v;
        }
        if let Some(v) = env_parse("PCNLINK_NODE_ID", |s| s.parse::<u32>().ok()) {
            cfg.node_id = v;
        }
        if let Some(v) = env_parse("PCNLINK_PORT", |s| s.parse::<u32>().ok()) {
            cfg.local_port = v;
        }
        if let Some(v) = env_parse("PCNLINK_QSIZE", |s| parse_size(s).ok()) {
            cfg.qsize = v;
        }
        if let Some(v) = env_parse("PCNLINK_RPC_TIMEOUT_MS", |s| s.parse::<u64>().ok()) {
            cfg.rpc_timeout = Some(Duration::from_millis(v));
        }
        if let Ok(dir) = std::env::var("PCN_FABRIC_DIR") {
            if !dir.is_empty() {
                cfg.fabric_dir = PathBuf::from(dir);
            }
        }
        cfg
    }
}

fn env_parse<T>(key: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    let parsed = parse(raw.trim());
    if parsed.is_none() {
        log::warn!("ignoring {}={:?}: not a valid value", key, raw);
    }
    parsed
}

/// Parse a byte size: plain integer or with a `K`/`M`/`G` suffix (powers of 1024).
pub fn parse_size(s: &str) -> Result<usize, ParseSizeError> {
    let s = s.trim();
    let (digits, shift) = match s.char_indices().last() {
        None => return Err(ParseSizeError(s.to_string())),
        Some((i, c)) => match c.to_ascii_uppercase() {
            'K' => (&s[..i], 10),
            'M' => (&s[..i], 20),
            'G' => (&s[..i], 30),
            _ => (s, 0),
        },
    };
    let n: usize = digits
        .trim()
        .parse()
        .map_err(|_| ParseSizeError(s.to_string()))?;
    n.checked_mul(1usize << shift)
        .ok_or_else(|| ParseSizeError(s.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid size {0:?}, expected an integer with optional K/M/G suffix")]
pub struct ParseSizeError(String);
