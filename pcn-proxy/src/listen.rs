//! Shared listen sockets.
//!
//! Several nodes may bind the same stream address. The first bind creates
//! the host socket; later binds get a duplicate of it and join the group.
//! Each accepted connection goes to one listening member, picked round-robin
//! over the node ids that have one.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::sync::Mutex;

use pcn_core::MAX_REMOTES;
use socket2::Socket;

/// One node socket listening through a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenMember {
    pub remote_id: u32,
    pub ctx_id: u32,
    pub sockid: u64,
    /// Event tag of the node's listening socket.
    pub tag: u64,
}

struct Entry {
    member: ListenMember,
    listening: bool,
}

struct ListenGroup {
    /// Kept open so later members can duplicate it.
    base: Socket,
    members: Vec<Entry>,
    /// Bit `n` set when node `n` has a listening member.
    remote_bits: u32,
    lb_cnt: u32,
}

impl ListenGroup {
    fn refresh_bits(&mut self) {
        self.remote_bits = self
            .members
            .iter()
            .filter(|e| e.listening)
            .fold(0, |bits, e| bits | 1 << e.member.remote_id);
    }

    /// Next node id with a set bit, scanning from `lb_cnt`.
    fn next_remote(&mut self) -> Option<u32> {
        let n = MAX_REMOTES as u32;
        for i in 0..n {
            let id = (self.lb_cnt + i) % n;
            if self.remote_bits & (1 << id) != 0 {
                self.lb_cnt = id + 1;
                return Some(id);
            }
        }
        None
    }
}

#[derive(Default)]
pub struct ListenRegistry {
    groups: Mutex<HashMap<SocketAddrV4, ListenGroup>>,
}

impl ListenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `sock` to `addr` for `member`. If the address is already held by
    /// a group, nothing is bound: the member joins the group and gets a
    /// duplicate of the group's socket to use in place of `sock`. Port 0 is
    /// never shared.
    pub fn bind(
        &self,
        addr: SocketAddrV4,
        sock: &Socket,
        member: ListenMember,
    ) -> io::Result<Option<Socket>> {
        if addr.port() == 0 {
            sock.bind(&addr.into())?;
            return Ok(None);
        }
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(group) = groups.get_mut(&addr) {
            let dup = group.base.try_clone()?;
            group.members.push(Entry {
                member,
                listening: false,
            });
            log::debug!(
                "node {} joins listen group {} ({} members)",
                member.remote_id,
                addr,
                group.members.len()
            );
            return Ok(Some(dup));
        }
        sock.bind(&addr.into())?;
        groups.insert(
            addr,
            ListenGroup {
                base: sock.try_clone()?,
                members: vec![Entry {
                    member,
                    listening: false,
                }],
                remote_bits: 0,
                lb_cnt: 0,
            },
        );
        Ok(None)
    }

    /// Mark a member as accepting connections.
    pub fn listen(&self, addr: SocketAddrV4, sockid: u64) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(group) = groups.get_mut(&addr) {
            if let Some(entry) = group.members.iter_mut().find(|e| e.member.sockid == sockid) {
                entry.listening = true;
            }
            group.refresh_bits();
        }
    }

    /// Remove a member; the group goes with its last member.
    pub fn leave(&self, addr: SocketAddrV4, sockid: u64) {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let Some(group) = groups.get_mut(&addr) else {
            return;
        };
        group.members.retain(|e| e.member.sockid != sockid);
        if group.members.is_empty() {
            groups.remove(&addr);
            log::debug!("listen group {} closed", addr);
        } else {
            group.refresh_bits();
        }
    }

    /// Member that receives the next connection accepted on `addr`.
    pub fn pick(&self, addr: SocketAddrV4) -> Option<ListenMember> {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        let group = groups.get_mut(&addr)?;
        let remote = group.next_remote()?;
        group
            .members
            .iter()
            .find(|e| e.listening && e.member.remote_id == remote)
            .map(|e| e.member)
    }

    pub fn members(&self, addr: SocketAddrV4) -> usize {
        self.groups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&addr)
            .map(|g| g.members.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use socket2::{Domain, Type};
    use std::net::Ipv4Addr;

    fn stream() -> Socket {
        let s = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        s.set_reuse_address(true).unwrap();
        s
    }

    fn member(remote_id: u32, sockid: u64) -> ListenMember {
        ListenMember {
            remote_id,
            ctx_id: 0,
            sockid,
            tag: 100 + sockid,
        }
    }

    fn free_addr() -> SocketAddrV4 {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        match probe.local_addr().unwrap() {
            std::net::SocketAddr::V4(a) => SocketAddrV4::new(Ipv4Addr::LOCALHOST, a.port()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn second_bind_shares_the_socket() {
        let reg = ListenRegistry::new();
        let addr = free_addr();
        let a = stream();
        assert!(reg.bind(addr, &a, member(1, 1)).unwrap().is_none());
        let b = reg.bind(addr, &stream(), member(2, 2)).unwrap().unwrap();
        assert_eq!(reg.members(addr), 2);
        assert_eq!(
            a.local_addr().unwrap().as_socket(),
            b.local_addr().unwrap().as_socket()
        );
        reg.leave(addr, 1);
        reg.leave(addr, 2);
        assert_eq!(reg.members(addr), 0);
    }

    #[test]
    fn pick_rotates_over_listening_remotes() {
        let reg = ListenRegistry::new();
        let addr = free_addr();
        let a = stream();
        reg.bind(addr, &a, member(1, 1)).unwrap();
        let _b = reg.bind(addr, &stream(), member(2, 2)).unwrap();
        assert_eq!(reg.pick(addr), None);
        reg.listen(addr, 1);
        reg.listen(addr, 2);
        let picks: Vec<u32> = (0..10).map(|_| reg.pick(addr).unwrap().remote_id).collect();
        assert_eq!(picks, vec![1, 2, 1, 2, 1, 2, 1, 2, 1, 2]);

        reg.leave(addr, 1);
        assert!((0..3).all(|_| reg.pick(addr).unwrap().remote_id == 2));
    }

    #[test]
    fn wildcard_port_is_never_shared() {
        let reg = ListenRegistry::new();
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0);
        let (a, b) = (stream(), stream());
        assert!(reg.bind(addr, &a, member(1, 1)).unwrap().is_none());
        assert!(reg.bind(addr, &b, member(2, 2)).unwrap().is_none());
        assert_ne!(
            a.local_addr().unwrap().as_socket(),
            b.local_addr().unwrap().as_socket()
        );
        assert_eq!(reg.members(addr), 0);
    }
}
