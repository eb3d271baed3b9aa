//! Proxy control plane: accept link attachments and hand their channels to
//! the Network Contexts.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{bail, Context};
use log::{info, warn};
use pcn_core::control::{self, BARRIER_TOKEN};
use pcn_core::link::{ReapCallback, ReapEvent};
use pcn_core::pcnlink::PCNSRV_ID;
use pcn_core::{
    ControlChannel, ControlMsg, Fabric, Link, LinkParams, CHANNEL_NUM_PORTS, CONTROL_VERSION,
    MAX_REMOTES,
};
use tokio::net::TcpListener;

use crate::config::Config;
use crate::listen::ListenRegistry;
use crate::netctx::{CtxCommand, CtxHandle};

/// How often a link's control stream is checked for detach or EOF.
const LIVENESS_POLL: Duration = Duration::from_millis(250);
/// Wait for each context to let go of a detached node.
const DETACH_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace period for a refused node to send its first barrier.
const REFUSE_LINGER: Duration = Duration::from_millis(200);

pub struct Proxy {
    cfg: Config,
    fabric: Fabric,
    ctxs: Mutex<Vec<CtxHandle>>,
    num_channel: u32,
    nodes: Mutex<HashSet<u32>>,
    stopping: AtomicBool,
}

/// Attached node id, released on drop.
struct NodeClaim<'a> {
    nodes: &'a Mutex<HashSet<u32>>,
    node: u32,
}

impl Drop for NodeClaim<'_> {
    fn drop(&mut self) {
        lock(self.nodes).remove(&self.node);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Proxy {
    /// Spawn the Network Contexts.
    pub fn start(cfg: Config) -> anyhow::Result<Arc<Proxy>> {
        cfg.validate()?;
        let listen = Arc::new(ListenRegistry::new());
        let mut ctxs = Vec::with_capacity(cfg.ncpu);
        for id in 0..cfg.ncpu {
            let ctx = CtxHandle::spawn(id as u32, cfg.ctx_settings(id), listen.clone())
                .with_context(|| format!("starting network context {}", id))?;
            ctxs.push(ctx);
        }
        info!(
            "proxy up: {} contexts, qsize {} bytes, fabric {}",
            cfg.ncpu,
            cfg.qsize,
            cfg.fabric_dir.display()
        );
        Ok(Arc::new(Proxy {
            fabric: Fabric::new(cfg.fabric_dir.clone()),
            num_channel: cfg.ncpu as u32,
            cfg,
            ctxs: Mutex::new(ctxs),
            nodes: Mutex::new(HashSet::new()),
            stopping: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Nodes with a live link.
    pub fn link_count(&self) -> usize {
        lock(&self.nodes).len()
    }

    /// Bind the control listener on `bind_addr:port`.
    pub async fn listen(&self) -> anyhow::Result<TcpListener> {
        let addr = SocketAddr::new(self.cfg.bind_addr, self.cfg.port);
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding control port {}", addr))?;
        info!("accepting links on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept control connections; each link is served on a blocking task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await.context("accepting link")?;
            let stream = stream.into_std()?;
            stream.set_nonblocking(false)?;
            stream.set_nodelay(true)?;
            let proxy = self.clone();
            tokio::task::spawn_blocking(move || {
                if let Err(e) = proxy.serve_link(stream) {
                    warn!("link from {}: {:#}", peer, e);
                }
            });
        }
    }

    /// Run one link from attach to detach over its control stream.
    pub fn serve_link<C: ControlChannel>(&self, mut control: C) -> anyhow::Result<()> {
        let num_channel = self.num_channel;
        let base_port = u32::from(self.cfg.port);
        control::write_msg(
            &mut control,
            &ControlMsg::Hello {
                version: CONTROL_VERSION,
                num_channel,
                base_port,
            },
        )?;
        let conn = match control::read_msg(&mut control)? {
            ControlMsg::Attach(conn) => conn,
            other => bail!("expected Attach, got {:?}", other),
        };
        let node = conn.remote_id;
        let expected_port = node
            .checked_mul(num_channel * CHANNEL_NUM_PORTS)
            .and_then(|off| base_port.checked_add(off));
        if node == PCNSRV_ID || node as usize >= MAX_REMOTES || expected_port != Some(conn.local_port) {
            self.refuse(&mut control, -libc::EINVAL);
            bail!("node {} refused: bad attach {:?}", node, conn);
        }
        if !lock(&self.nodes).insert(node) {
            self.refuse(&mut control, -libc::EEXIST);
            bail!("node {} refused: already attached", node);
        }
        let _claim = NodeClaim {
            nodes: &self.nodes,
            node,
        };

        let params = LinkParams {
            local_id: PCNSRV_ID,
            num_channel,
            qsize: self.cfg.qsize,
            reap_threshold: self.cfg.reap_threshold,
        };
        let on_reap: ReapCallback = Arc::new(|ev: ReapEvent| {
            warn!(
                "channel {} from node {} backed up: {} bytes unread",
                ev.channel_id, ev.remote_id, ev.backlog
            )
        });
        let link = Link::establish(&self.fabric, &params, &conn, &mut control, Some(on_reap))
            .with_context(|| format!("building link to node {}", node))?;
        {
            let ctxs = lock(&self.ctxs);
            for (ctx, ch) in ctxs.iter().zip(link.channels()) {
                ctx.send(CtxCommand::Attach(ch.clone()));
            }
        }
        if let Err(e) = control::write_msg(&mut control, &ControlMsg::Ack { rc: 0 }) {
            self.detach_link(&link);
            return Err(e).with_context(|| format!("acknowledging node {}", node));
        }
        info!("node {} attached with {} channels", node, num_channel);

        let why = self.watch_link(&mut control, &link);
        self.detach_link(&link);
        info!("node {} detached: {}", node, why);
        Ok(())
    }

    /// Answer an attach with a negative Ack in place of the first barrier.
    fn refuse<C: ControlChannel>(&self, control: &mut C, rc: i32) {
        if control::write_msg(control, &ControlMsg::Ack { rc }).is_err() {
            return;
        }
        // The node sends its first barrier before reading; take it so the
        // close does not reset the stream under the Ack.
        if control.set_read_timeout(Some(REFUSE_LINGER)).is_ok() {
            if let Ok(msg) = control::read_msg(control) {
                if msg != (ControlMsg::Barrier { token: BARRIER_TOKEN }) {
                    warn!("refused node sent {:?}", msg);
                }
            }
        }
    }

    /// Block until the link should go away; returns why.
    fn watch_link<C: ControlChannel>(&self, control: &mut C, link: &Link) -> &'static str {
        if control.set_read_timeout(Some(LIVENESS_POLL)).is_err() {
            return "control stream unusable";
        }
        loop {
            if self.stopping.load(Ordering::Acquire) {
                return "proxy stopping";
            }
            if link.is_faulted() {
                return "channel closed";
            }
            match control::read_msg(control) {
                Ok(ControlMsg::Detach) => return "detach requested",
                Ok(other) => warn!("node {}: unexpected {:?}", link.remote_id(), other),
                Err(e) if e.is_timeout() => {}
                Err(_) => return "control stream closed",
            }
        }
    }

    /// Close the link's channels and wait until every context has released
    /// the node's sockets.
    fn detach_link(&self, link: &Link) {
        link.shutdown();
        let (done_tx, done_rx) = crossbeam::channel::unbounded();
        let mut waiting = 0;
        for ctx in lock(&self.ctxs).iter() {
            let cmd = CtxCommand::Detach {
                remote_id: link.remote_id(),
                done: done_tx.clone(),
            };
            if ctx.send(cmd) {
                waiting += 1;
            }
        }
        drop(done_tx);
        for _ in 0..waiting {
            if done_rx.recv_timeout(DETACH_TIMEOUT).is_err() {
                warn!("node {}: contexts slow to detach", link.remote_id());
                break;
            }
        }
    }

    /// Stop accepting work and join the contexts. Links still attached see
    /// their channels close.
    pub fn shutdown(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut ctxs = std::mem::take(&mut *lock(&self.ctxs));
        for ctx in ctxs.iter_mut() {
            ctx.stop();
        }
        info!("proxy stopped");
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.shutdown();
    }
}
