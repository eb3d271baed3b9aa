//! Per-channel socket table: socket ids partitioned by lifecycle state.
//!
//! The table indexes sockets; it never owns them. Callers keep the sockets
//! in their own arena keyed by the same id and must remove every member
//! before the table goes away.

use std::collections::{BTreeSet, HashMap};

/// Lifecycle state; a socket is in exactly one state at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SockState {
    New,
    Listen,
    Epoll,
    /// Accepted.
    In,
    /// Connected.
    Out,
}

impl SockState {
    pub const ALL: [SockState; 5] = [
        SockState::New,
        SockState::Listen,
        SockState::Epoll,
        SockState::In,
        SockState::Out,
    ];

    fn slot(self) -> usize {
        match self {
            SockState::New => 0,
            SockState::Listen => 1,
            SockState::Epoll => 2,
            SockState::In => 3,
            SockState::Out => 4,
        }
    }
}

#[derive(Default)]
struct Lists {
    sets: [BTreeSet<u64>; 5],
    state: HashMap<u64, SockState>,
}

/// Five ordered id sets guarded by one lock.
#[derive(Default)]
pub struct SocketTable {
    lists: spin::Mutex<Lists>,
}

impl SocketTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `id` in `state`. Returns false (and changes nothing) if present.
    pub fn add(&self, id: u64, state: SockState) -> bool {
        let mut lists = self.lists.lock();
        if lists.state.contains_key(&id) {
            return false;
        }
        lists.state.insert(id, state);
        lists.sets[state.slot()].insert(id);
        true
    }

    /// Remove `id`, returning the state it was in.
    pub fn remove(&self, id: u64) -> Option<SockState> {
        let mut lists = self.lists.lock();
        let state = lists.state.remove(&id)?;
        lists.sets[state.slot()].remove(&id);
        Some(state)
    }

    /// Move `id` to `state` in one step. Returns the previous state, or None
    /// if `id` is not a member (nothing is inserted then).
    pub fn move_to(&self, id: u64, state: SockState) -> Option<SockState> {
        let mut lists = self.lists.lock();
        let prev = lists.state.insert(id, state);
        match prev {
            Some(prev) => {
                lists.sets[prev.slot()].remove(&id);
                lists.sets[state.slot()].insert(id);
            }
            None => {
                lists.state.remove(&id);
            }
        }
        prev
    }

    pub fn state_of(&self, id: u64) -> Option<SockState> {
        self.lists.lock().state.get(&id).copied()
    }

    /// Members of one list in id order.
    pub fn members(&self, state: SockState) -> Vec<u64> {
        self.lists.lock().sets[state.slot()].iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lists.lock().state.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for SocketTable {
    fn drop(&mut self) {
        let live = self.lists.get_mut().state.len();
        if live > 0 {
            log::warn!("socket table dropped with {} live sockets", live);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;
    use std::thread;

    fn lists_containing(tbl: &SocketTable, id: u64) -> usize {
        SockState::ALL
            .iter()
            .filter(|s| tbl.members(**s).contains(&id))
            .count()
    }

    #[test]
    fn add_move_remove() {
        let tbl = SocketTable::new();
        assert!(tbl.add(1, SockState::New));
        assert!(!tbl.add(1, SockState::Out));
        assert_eq!(tbl.move_to(1, SockState::Listen), Some(SockState::New));
        assert_eq!(tbl.members(SockState::Listen), vec![1]);
        assert!(tbl.members(SockState::New).is_empty());
        assert_eq!(tbl.remove(1), Some(SockState::Listen));
        assert!(tbl.is_empty());
    }

    #[test]
    fn move_of_unknown_id_inserts_nothing() {
        let tbl = SocketTable::new();
        assert_eq!(tbl.move_to(9, SockState::In), None);
        assert_eq!(tbl.state_of(9), None);
        assert!(tbl.members(SockState::In).is_empty());
    }

    #[test]
    fn random_transitions_keep_one_state() {
        let tbl = SocketTable::new();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for id in 0..32 {
            tbl.add(id, SockState::New);
        }
        for _ in 0..2000 {
            let id = rng.gen_range(0..32);
            let state = SockState::ALL[rng.gen_range(0..5)];
            tbl.move_to(id, state);
            assert_eq!(lists_containing(&tbl, id), 1);
            assert_eq!(tbl.state_of(id), Some(state));
        }
        for id in 0..32 {
            tbl.remove(id);
        }
    }

    #[test]
    fn concurrent_moves_never_duplicate() {
        let tbl = Arc::new(SocketTable::new());
        for id in 0..8 {
            tbl.add(id, SockState::New);
        }
        let workers: Vec<_> = (0..4)
            .map(|w| {
                let tbl = tbl.clone();
                thread::spawn(move || {
                    for i in 0..1000u64 {
                        tbl.move_to((i + w) % 8, SockState::ALL[(i % 5) as usize]);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        let total: usize = SockState::ALL.iter().map(|s| tbl.members(*s).len()).sum();
        assert_eq!(total, 8);
        for id in 0..8 {
            assert_eq!(lists_containing(&tbl, id), 1);
            tbl.remove(id);
        }
    }
}
