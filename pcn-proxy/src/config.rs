//! Load config from file, environment and command line.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use pcn_core::queue::CAPACITY_GRANULE;
use pcn_core::{parse_size, Fabric};
use serde::{Deserialize, Deserializer};

use crate::netctx::CtxSettings;

/// Command-line flags; each one overrides the file and environment.
#[derive(Debug, Default, Parser)]
#[command(name = "pcn-proxy", version, about = "PCN host proxy")]
pub struct Cli {
    /// Control port for link attachments; also the first queue port.
    #[arg(short, long)]
    pub port: Option<u16>,
    /// Number of Network Contexts (channels per link).
    #[arg(short, long)]
    pub ncpu: Option<usize>,
    /// Outbound queue size per channel, e.g. 32M.
    #[arg(short = 'z', long, value_parser = parse_size)]
    pub qsize: Option<usize>,
    /// Config file to use instead of the default locations.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Proxy configuration. File: ~/.config/pcn/proxy.toml or /etc/pcn/proxy.toml.
/// Env overrides: PCN_PROXY_PORT, PCN_PROXY_NCPU, PCN_PROXY_QSIZE,
/// PCN_FABRIC_DIR, PCN_MAX_STALLS, PCN_STALL_TIMEOUT_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_ncpu")]
    pub ncpu: usize,
    /// Accepts a byte count or a K/M/G string.
    #[serde(default = "default_qsize", deserialize_with = "de_size")]
    pub qsize: usize,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    #[serde(default = "default_reap_threshold", deserialize_with = "de_size")]
    pub reap_threshold: usize,
    /// Sends without progress tolerated before a socket is reset.
    #[serde(default = "default_max_stalls")]
    pub max_stalls: u32,
    /// How long a socket must go without draining before stalls reset it.
    #[serde(default = "default_stall_timeout_ms")]
    pub stall_timeout_ms: u64,
    #[serde(default = "default_staging_size", deserialize_with = "de_size")]
    pub staging_size: usize,
    #[serde(default = "default_max_read_len", deserialize_with = "de_size")]
    pub max_read_len: usize,
    #[serde(default = "default_read_budget")]
    pub read_budget: usize,
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_pin_cpus")]
    pub pin_cpus: bool,
    #[serde(default = "Fabric::default_dir")]
    pub fabric_dir: PathBuf,
}

fn default_port() -> u16 {
    20000
}
fn default_ncpu() -> usize {
    16
}
fn default_qsize() -> usize {
    32 * 1024 * 1024
}
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_reap_threshold() -> usize {
    1024 * 1024
}
fn default_max_stalls() -> u32 {
    3
}
fn default_stall_timeout_ms() -> u64 {
    10_000
}
fn default_staging_size() -> usize {
    4096
}
fn default_max_read_len() -> usize {
    32 * 1024
}
fn default_read_budget() -> usize {
    8
}
fn default_poll_timeout_ms() -> u64 {
    1
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_pin_cpus() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeValue {
    Bytes(usize),
    Text(String),
}

fn de_size<'de, D: Deserializer<'de>>(d: D) -> Result<usize, D::Error> {
    match SizeValue::deserialize(d)? {
        SizeValue::Bytes(n) => Ok(n),
        SizeValue::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            ncpu: default_ncpu(),
            qsize: default_qsize(),
            bind_addr: default_bind_addr(),
            reap_threshold: default_reap_threshold(),
            max_stalls: default_max_stalls(),
            stall_timeout_ms: default_stall_timeout_ms(),
            staging_size: default_staging_size(),
            max_read_len: default_max_read_len(),
            read_budget: default_read_budget(),
            poll_timeout_ms: default_poll_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            pin_cpus: default_pin_cpus(),
            fabric_dir: Fabric::default_dir(),
        }
    }
}

impl Config {
    /// Settings for Network Context `id`.
    pub fn ctx_settings(&self, id: usize) -> CtxSettings {
        CtxSettings {
            max_stalls: self.max_stalls,
            stall_timeout: Duration::from_millis(self.stall_timeout_ms),
            staging_size: self.staging_size,
            max_read_len: self.max_read_len,
            read_budget: self.read_budget,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            cpu: self.pin_cpus.then_some(id),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ncpu == 0 {
            bail!("ncpu must be at least 1");
        }
        if self.qsize < CAPACITY_GRANULE {
            bail!("qsize {} is below the {} byte minimum", self.qsize, CAPACITY_GRANULE);
        }
        if self.staging_size == 0 || self.max_read_len == 0 || self.read_budget == 0 {
            bail!("staging_size, max_read_len and read_budget must be non-zero");
        }
        Ok(())
    }
}

/// Load config: merge defaults, then the config file (if any), then env
/// vars, then `cli`.
pub fn load(cli: &Cli) -> anyhow::Result<Config> {
    let mut c = match &cli.config {
        Some(path) => load_file(path)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => load_file(&path)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |key| std::env::var(key).ok());
    if let Some(p) = cli.port {
        c.port = p;
    }
    if let Some(n) = cli.ncpu {
        c.ncpu = n;
    }
    if let Some(q) = cli.qsize {
        c.qsize = q;
    }
    c.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/pcn/proxy.toml"));
    }
    out.push(PathBuf::from("/etc/pcn/proxy.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let c = toml::from_str::<Config>(&s)
        .with_context(|| format!("parsing config {}", path.display()))?;
    log::info!("config loaded from {}", path.display());
    Ok(c)
}

/// Apply env overrides; unparsable values are ignored with a warning.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    fn parsed<T>(key: &str, raw: Option<String>, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let raw = raw?;
        let v = parse(raw.trim());
        if v.is_none() {
            log::warn!("ignoring {}={:?}", key, raw);
        }
        v
    }
    if let Some(p) = parsed("PCN_PROXY_PORT", var("PCN_PROXY_PORT"), |s| s.parse().ok()) {
        c.port = p;
    }
    if let Some(n) = parsed("PCN_PROXY_NCPU", var("PCN_PROXY_NCPU"), |s| s.parse().ok()) {
        c.ncpu = n;
    }
    if let Some(q) = parsed("PCN_PROXY_QSIZE", var("PCN_PROXY_QSIZE"), |s| parse_size(s).ok()) {
        c.qsize = q;
    }
    if let Some(m) = parsed("PCN_MAX_STALLS", var("PCN_MAX_STALLS"), |s| s.parse().ok()) {
        c.max_stalls = m;
    }
    if let Some(t) = parsed("PCN_STALL_TIMEOUT_MS", var("PCN_STALL_TIMEOUT_MS"), |s| s.parse().ok()) {
        c.stall_timeout_ms = t;
    }
    if let Some(dir) = var("PCN_FABRIC_DIR").filter(|d| !d.is_empty()) {
        c.fabric_dir = PathBuf::from(dir);
    }
}
