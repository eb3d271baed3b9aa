//! Channels and Links.
//!
//! A Channel pairs an outbound master queue with an inbound shadow queue and
//! carries its own socket table. A Link is the fixed set of Channels to one
//! remote node, built all-or-nothing by [`Link::establish`].

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use serde::{Deserialize, Serialize};

use crate::control::{self, ControlError, ControlMsg, BARRIER_TOKEN};
use crate::fabric::Fabric;
use crate::netmsg::{Body, DecodeError, EncodeError, Netmsg};
use crate::queue::{Master, QueueError, ReapHook, Shadow};
use crate::socktbl::SocketTable;

/// Ports consumed per channel (one per queue direction).
pub const CHANNEL_NUM_PORTS: u32 = 2;

/// Frames drained from one channel per sweep.
pub const MAX_BATCH: usize = 32;

/// Queue addressing for one link, from the point of view of the side using it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnInfo {
    /// Node id of the peer.
    pub remote_id: u32,
    /// First port of the peer's master queues.
    pub remote_port: u32,
    /// First port of this side's master queues.
    pub local_port: u32,
}

impl ConnInfo {
    /// The same link seen from the peer, whose own node id is `local_id`.
    pub fn reversed(&self, local_id: u32) -> ConnInfo {
        ConnInfo {
            remote_id: local_id,
            remote_port: self.local_port,
            local_port: self.remote_port,
        }
    }
}

/// Sizing for [`Link::establish`].
#[derive(Debug, Clone, Copy)]
pub struct LinkParams {
    /// Node id of this side.
    pub local_id: u32,
    pub num_channel: u32,
    /// Outbound queue capacity per channel.
    pub qsize: usize,
    /// Inbound backlog that triggers the reap callback.
    pub reap_threshold: usize,
}

/// Inbound backlog report passed to a [`ReapCallback`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapEvent {
    pub remote_id: u32,
    pub channel_id: u32,
    pub backlog: usize,
}

pub type ReapCallback = Arc<dyn Fn(ReapEvent) + Send + Sync>;

/// One bidirectional pair of queues plus its socket table.
pub struct Channel {
    id: u32,
    remote_id: u32,
    // Field order is teardown order: shadow before master.
    in_q: spin::Mutex<Shadow>,
    out_q: Mutex<Master>,
    seqnum: AtomicU64,
    socktbl: SocketTable,
    closed: AtomicBool,
}

impl Channel {
    pub fn new(id: u32, remote_id: u32, out_q: Master, in_q: Shadow) -> Self {
        Self {
            id,
            remote_id,
            in_q: spin::Mutex::new(in_q),
            out_q: Mutex::new(out_q),
            seqnum: AtomicU64::new(0),
            socktbl: SocketTable::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    pub fn socktbl(&self) -> &SocketTable {
        &self.socktbl
    }

    fn out_q(&self) -> MutexGuard<'_, Master> {
        self.out_q.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Largest frame the outbound queue accepts.
    pub fn max_frame(&self) -> usize {
        self.out_q().max_frame()
    }

    /// Whether a frame of `len` bytes fits in the outbound queue right now.
    pub fn has_room(&self, len: usize) -> bool {
        !self.is_closed() && self.out_q().has_room(len)
    }

    /// Encode and append one frame without waiting. Returns its seqnum.
    pub fn try_send(&self, tag: u64, body: Body) -> Result<u64, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let mut msg = Netmsg::new(tag, body);
        let len = msg.encoded_len()?;
        let mut out_q = self.out_q();
        let mut slot = match out_q.reserve(len) {
            Ok(slot) => slot,
            Err(QueueError::Full) => return Err(ChannelError::Full(msg.body)),
            Err(e) => return Err(e.into()),
        };
        msg.seqnum = self.seqnum.fetch_add(1, Ordering::Relaxed);
        msg.encode_into(&mut slot)?;
        slot.commit(len);
        Ok(msg.seqnum)
    }

    /// Append one frame, waiting for space while the consumer catches up.
    pub fn send(&self, tag: u64, body: Body) -> Result<u64, ChannelError> {
        let mut body = body;
        loop {
            match self.try_send(tag, body) {
                Err(ChannelError::Full(back)) => {
                    body = back;
                    thread::yield_now();
                }
                other => return other,
            }
        }
    }

    /// Reserve up to `max_len` bytes and let `fill` write a frame in place.
    /// `fill` gets the frame buffer and its seqnum and returns the frame
    /// length, or None to abandon the reservation.
    pub fn send_with<F>(&self, max_len: usize, fill: F) -> Result<Option<usize>, ChannelError>
    where
        F: FnOnce(&mut [u8], u64) -> Result<Option<usize>, ChannelError>,
    {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }
        let mut out_q = self.out_q();
        let mut slot = match out_q.reserve(max_len) {
            Ok(slot) => slot,
            Err(QueueError::Full) => return Err(ChannelError::Busy),
            Err(e) => return Err(e.into()),
        };
        let seqnum = self.seqnum.load(Ordering::Relaxed);
        match fill(&mut slot, seqnum)? {
            Some(len) => {
                slot.commit(len);
                self.seqnum.fetch_add(1, Ordering::Relaxed);
                Ok(Some(len))
            }
            None => Ok(None),
        }
    }

    /// Drain up to `max` frames from the inbound queue. Only one thread
    /// drains at a time; a decode failure is a protocol error.
    pub fn recv_batch(&self, max: usize) -> Result<Vec<Netmsg>, ChannelError> {
        let mut frames = Vec::new();
        let mut peer_closed = false;
        {
            let mut in_q = self.in_q.lock();
            let mut buf = Vec::new();
            while frames.len() < max {
                match in_q.recv(&mut buf) {
                    Ok(true) => frames.push(std::mem::take(&mut buf)),
                    Ok(false) => break,
                    Err(QueueError::PeerClosed) => {
                        peer_closed = true;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if peer_closed {
            self.close();
            if frames.is_empty() {
                return Err(ChannelError::Closed);
            }
        }
        frames
            .iter()
            .map(|f| Netmsg::decode(f).map_err(ChannelError::from))
            .collect()
    }

    /// Inbound bytes waiting to be drained.
    pub fn backlog(&self) -> usize {
        self.in_q.lock().backlog()
    }

    /// Stop accepting sends and tell the peer no more frames follow.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.out_q().close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Error on a Channel.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
    /// The outbound queue is full; the unsent body is handed back.
    #[error("outbound queue full")]
    Full(Body),
    /// The outbound queue is full (in-place send).
    #[error("outbound queue busy")]
    Busy,
    #[error(transparent)]
    Queue(QueueError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error("protocol error: {0}")]
    Protocol(#[from] DecodeError),
}

impl From<QueueError> for ChannelError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::PeerClosed => ChannelError::Closed,
            e => ChannelError::Queue(e),
        }
    }
}

/// Connection to one remote node: a fixed set of Channels.
pub struct Link {
    remote_id: u32,
    channels: Vec<Arc<Channel>>,
}

impl Link {
    /// Build every channel of the link over the control stream. Per channel:
    /// create the outbound master, exchange the barrier token, then attach
    /// the inbound shadow to the peer's master. Any failure tears down what
    /// was already built and returns the error.
    pub fn establish<C: Read + Write + ?Sized>(
        fabric: &Fabric,
        params: &LinkParams,
        conn: &ConnInfo,
        control: &mut C,
        reap: Option<ReapCallback>,
    ) -> Result<Link, LinkError> {
        let mut channels = Vec::with_capacity(params.num_channel as usize);
        for id in 0..params.num_channel {
            match Self::establish_channel(fabric, params, conn, control, reap.clone(), id) {
                Ok(ch) => channels.push(Arc::new(ch)),
                Err(e) => {
                    log::warn!(
                        "link to node {}: channel {} failed ({}), tearing down {} channels",
                        conn.remote_id,
                        id,
                        e,
                        channels.len()
                    );
                    teardown(&mut channels);
                    return Err(e);
                }
            }
        }
        log::debug!(
            "link to node {} up with {} channels",
            conn.remote_id,
            channels.len()
        );
        Ok(Link {
            remote_id: conn.remote_id,
            channels,
        })
    }

    fn establish_channel<C: Read + Write + ?Sized>(
        fabric: &Fabric,
        params: &LinkParams,
        conn: &ConnInfo,
        control: &mut C,
        reap: Option<ReapCallback>,
        id: u32,
    ) -> Result<Channel, LinkError> {
        let local_port = conn.local_port + id * CHANNEL_NUM_PORTS;
        let remote_port = conn.remote_port + id * CHANNEL_NUM_PORTS;

        let out_q = fabric.create_master(params.local_id, local_port, params.qsize)?;

        control::write_msg(control, &ControlMsg::Barrier { token: BARRIER_TOKEN })?;
        match control::read_msg(control)? {
            ControlMsg::Barrier {
                token: BARRIER_TOKEN,
            } => {}
            other => return Err(LinkError::Barrier(other)),
        }

        let remote_id = conn.remote_id;
        let hook = reap.map(|cb| {
            ReapHook::new(params.reap_threshold, move |backlog| {
                cb(ReapEvent {
                    remote_id,
                    channel_id: id,
                    backlog,
                })
            })
        });
        let in_q = fabric.connect_shadow(remote_id, remote_port, hook)?;
        Ok(Channel::new(id, remote_id, out_q, in_q))
    }

    pub fn remote_id(&self) -> u32 {
        self.remote_id
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, id: u32) -> Option<&Arc<Channel>> {
        self.channels.get(id as usize)
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    /// Any channel closed, locally or by the peer.
    pub fn is_faulted(&self) -> bool {
        self.channels.iter().any(|c| c.is_closed())
    }

    /// Close every channel; queues are released when the last holder drops.
    pub fn shutdown(&self) {
        for ch in &self.channels {
            ch.close();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.shutdown();
        teardown(&mut self.channels);
    }
}

/// Release channels newest first.
fn teardown(channels: &mut Vec<Arc<Channel>>) {
    while let Some(ch) = channels.pop() {
        ch.close();
        drop(ch);
    }
}

/// Error building a Link.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("queue setup: {0}")]
    Queue(#[from] QueueError),
    #[error("control channel: {0}")]
    Control(#[from] ControlError),
    #[error("barrier expected, got {0:?}")]
    Barrier(ControlMsg),
}
