//! Level-triggered epoll over pcnlink sockets.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::socket::SockCore;
use super::{lock, PcnLink, PlSocket, PollFlags, Shared};
use crate::error::PcnError;
use crate::link::Channel;
use crate::socktbl::SockState;

/// Longest sleep between readiness sweeps. Outbound room has no wakeup of
/// its own, so waiters recheck at least this often.
const RECHECK: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpollOp {
    Add,
    Mod,
    Del,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpollEvent {
    pub events: PollFlags,
    pub data: u64,
}

struct Interest {
    core: Arc<SockCore>,
    events: PollFlags,
    data: u64,
}

pub struct PlEpoll {
    shared: Arc<Shared>,
    channel: Arc<Channel>,
    tag: u64,
    interest: Mutex<BTreeMap<u64, Interest>>,
}

impl PcnLink {
    /// `epoll_create(2)`.
    pub fn epoll(&self) -> Result<PlEpoll, PcnError> {
        if self.shared.is_down() {
            return Err(PcnError::LinkDown);
        }
        let channel = self.shared.pick_channel();
        let tag = self.shared.next_tag();
        channel.socktbl().add(tag, SockState::Epoll);
        Ok(PlEpoll {
            shared: self.shared.clone(),
            channel,
            tag,
            interest: Mutex::new(BTreeMap::new()),
        })
    }
}

impl PlEpoll {
    pub fn ctl(
        &self,
        op: EpollOp,
        sock: &PlSocket,
        events: PollFlags,
        data: u64,
    ) -> Result<(), PcnError> {
        let mut interest = lock(&self.interest);
        let key = sock.tag();
        match op {
            EpollOp::Add => {
                if interest.contains_key(&key) {
                    return Err(PcnError::Errno(libc::EEXIST));
                }
                interest.insert(
                    key,
                    Interest {
                        core: sock.core().clone(),
                        events,
                        data,
                    },
                );
            }
            EpollOp::Mod => {
                let entry = interest
                    .get_mut(&key)
                    .ok_or(PcnError::Errno(libc::ENOENT))?;
                entry.events = events;
                entry.data = data;
            }
            EpollOp::Del => {
                interest
                    .remove(&key)
                    .ok_or(PcnError::Errno(libc::ENOENT))?;
            }
        }
        Ok(())
    }

    /// Up to `max` ready sockets. Waits until one is ready, `timeout`
    /// passes (returning none) or the link goes down.
    pub fn wait(&self, max: usize, timeout: Option<Duration>) -> Result<Vec<EpollEvent>, PcnError> {
        if max == 0 {
            return Err(PcnError::Invalid("epoll wait needs room for one event"));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let seen = self.shared.sweeps();
            let ready = self.ready(max);
            if !ready.is_empty() {
                return Ok(ready);
            }
            if self.shared.is_down() {
                return Err(PcnError::LinkDown);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(Vec::new());
                    }
                    (deadline - now).min(RECHECK)
                }
                None => RECHECK,
            };
            self.shared.wait_sweep(seen, slice);
        }
    }

    fn ready(&self, max: usize) -> Vec<EpollEvent> {
        // Reported whether asked for or not.
        let always = PollFlags::ERR | PollFlags::HUP;
        lock(&self.interest)
            .values()
            .filter_map(|i| {
                let hit = i.core.poll() & (i.events | always);
                (!hit.is_empty()).then_some(EpollEvent {
                    events: hit,
                    data: i.data,
                })
            })
            .take(max)
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.interest).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PlEpoll {
    fn drop(&mut self) {
        self.channel.socktbl().remove(self.tag);
    }
}
