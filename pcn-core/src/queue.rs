//! Transport Queue: single-producer/single-consumer byte ring.
//!
//! The ring lives in a memory-mapped file so the producer ("master") and the
//! consumer ("shadow") may sit in different processes. Layout:
//!
//! | offset | field                                    |
//! |--------|------------------------------------------|
//! | 0      | magic `PCNQUEUE`                         |
//! | 8      | capacity of the data area                |
//! | 16     | closed flag (set by the master)          |
//! | 64     | `head`: bytes ever published by producer |
//! | 128    | `tail`: bytes ever released by consumer  |
//! | 192    | data area                                |
//!
//! Records are `[len: u32][payload][pad to 8]`. A length of `u32::MAX` marks
//! the unused end of the data area; the consumer continues at offset 0.
//! The producer writes the record, then publishes `head` with Release; the
//! consumer reads `head` with Acquire before touching the record.

use std::fs::{self, OpenOptions};
use std::io;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::{MmapMut, MmapOptions};

const MAGIC: u64 = u64::from_le_bytes(*b"PCNQUEUE");
const MAGIC_OFF: usize = 0;
const CAPACITY_OFF: usize = 8;
const CLOSED_OFF: usize = 16;
const HEAD_OFF: usize = 64;
const TAIL_OFF: usize = 128;
const DATA_OFF: usize = 192;

const LEN_SIZE: usize = 4;
const ALIGN: usize = 8;
const WRAP_MARK: u32 = u32::MAX;

/// Capacities are rounded up to a multiple of this.
pub const CAPACITY_GRANULE: usize = 4096;

fn record_len(len: usize) -> usize {
    (LEN_SIZE + len + ALIGN - 1) & !(ALIGN - 1)
}

/// Mapped ring file.
struct Ring {
    _map: MmapMut,
    base: *mut u8,
    capacity: usize,
}

// The mapping is owned by this value; concurrent access to the shared
// header goes through atomics and to records through the head/tail protocol.
unsafe impl Send for Ring {}

impl Ring {
    fn map(file: &fs::File, len: usize) -> io::Result<Ring> {
        let mut map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        let base = map.as_mut_ptr();
        Ok(Ring {
            _map: map,
            base,
            capacity: len - DATA_OFF,
        })
    }

    fn u64_at(&self, off: usize) -> &AtomicU64 {
        // offsets are 8-aligned inside a page-aligned mapping
        unsafe { &*(self.base.add(off) as *const AtomicU64) }
    }

    fn head(&self) -> &AtomicU64 {
        self.u64_at(HEAD_OFF)
    }

    fn tail(&self) -> &AtomicU64 {
        self.u64_at(TAIL_OFF)
    }

    fn closed(&self) -> &AtomicU32 {
        unsafe { &*(self.base.add(CLOSED_OFF) as *const AtomicU32) }
    }

    fn index(&self, pos: u64) -> usize {
        (pos % self.capacity as u64) as usize
    }

    /// Pointer into the data area. `idx < capacity`.
    fn data(&self, idx: usize) -> *mut u8 {
        unsafe { self.base.add(DATA_OFF + idx) }
    }

    fn read_len(&self, idx: usize) -> u32 {
        unsafe { ptr::read_unaligned(self.data(idx) as *const u32) }
    }

    fn write_len(&self, idx: usize, len: u32) {
        unsafe { ptr::write_unaligned(self.data(idx) as *mut u32, len) }
    }
}

/// Producer side of a queue. Creating it creates the endpoint file; dropping
/// it marks the ring closed and removes the file.
pub struct Master {
    ring: Ring,
    path: PathBuf,
    head: u64,
}

impl Master {
    pub fn create(path: &Path, capacity: usize) -> Result<Master, QueueError> {
        let capacity = capacity.max(CAPACITY_GRANULE).div_ceil(CAPACITY_GRANULE) * CAPACITY_GRANULE;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len((DATA_OFF + capacity) as u64)?;
        let ring = Ring::map(&file, DATA_OFF + capacity)?;
        ring.u64_at(CAPACITY_OFF)
            .store(capacity as u64, Ordering::Relaxed);
        ring.closed().store(0, Ordering::Relaxed);
        ring.head().store(0, Ordering::Relaxed);
        ring.tail().store(0, Ordering::Relaxed);
        ring.u64_at(MAGIC_OFF).store(MAGIC, Ordering::Release);
        Ok(Master {
            ring,
            path: path.to_path_buf(),
            head: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity
    }

    /// Largest frame accepted by [`Master::reserve`].
    pub fn max_frame(&self) -> usize {
        self.ring.capacity / 2 - LEN_SIZE
    }

    /// Bytes not yet released by the consumer.
    pub fn used(&self) -> usize {
        (self.head - self.ring.tail().load(Ordering::Acquire)) as usize
    }

    /// Whether a frame of `len` bytes could be reserved right now.
    pub fn has_room(&self, len: usize) -> bool {
        len <= self.max_frame() && self.placement(len).is_some()
    }

    /// Where a record of `len` bytes would start and how many bytes must be
    /// skipped at the end of the data area to get there.
    fn placement(&self, len: usize) -> Option<(usize, usize)> {
        let cap = self.ring.capacity;
        let rec = record_len(len);
        let free = cap - self.used();
        let idx = self.ring.index(self.head);
        let contig = cap - idx;
        if contig < rec {
            (free >= contig + rec).then_some((0, contig))
        } else {
            (free >= rec).then_some((idx, 0))
        }
    }

    /// Reserve space for a frame of up to `len` bytes. Nothing is visible to
    /// the consumer until [`Reservation::commit`].
    pub fn reserve(&mut self, len: usize) -> Result<Reservation<'_>, QueueError> {
        if len > self.max_frame() {
            return Err(QueueError::TooLarge {
                len,
                max: self.max_frame(),
            });
        }
        let (idx, skip) = self.placement(len).ok_or(QueueError::Full)?;
        if skip > 0 {
            self.ring.write_len(self.ring.index(self.head), WRAP_MARK);
            self.head += skip as u64;
        }
        Ok(Reservation {
            master: self,
            idx,
            len,
        })
    }

    /// Copy one frame into the ring.
    pub fn send(&mut self, frame: &[u8]) -> Result<(), QueueError> {
        let mut slot = self.reserve(frame.len())?;
        slot.copy_from_slice(frame);
        slot.commit(frame.len());
        Ok(())
    }

    /// Tell the consumer no more frames will follow.
    pub fn close(&self) {
        self.ring.closed().store(1, Ordering::Release);
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.close();
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("removing queue endpoint {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Space reserved in a [`Master`], written in place by the caller.
pub struct Reservation<'a> {
    master: &'a mut Master,
    idx: usize,
    len: usize,
}

impl Reservation<'_> {
    /// Publish the first `used` bytes of the reservation as one frame.
    pub fn commit(self, used: usize) {
        let used = used.min(self.len);
        self.master.ring.write_len(self.idx, used as u32);
        self.master.head += record_len(used) as u64;
        let head = self.master.head;
        self.master.ring.head().store(head, Ordering::Release);
    }
}

impl Deref for Reservation<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.master.ring.data(self.idx + LEN_SIZE), self.len) }
    }
}

impl DerefMut for Reservation<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.master.ring.data(self.idx + LEN_SIZE), self.len) }
    }
}

/// Slow-consumer callback: fires with the unread backlog in bytes once each
/// time the backlog rises above `threshold`.
pub struct ReapHook {
    threshold: usize,
    callback: Box<dyn FnMut(usize) + Send>,
}

impl ReapHook {
    pub fn new(threshold: usize, callback: impl FnMut(usize) + Send + 'static) -> Self {
        Self {
            threshold,
            callback: Box::new(callback),
        }
    }
}

/// Consumer side of a queue, attached to a master's endpoint.
pub struct Shadow {
    ring: Ring,
    tail: u64,
    reap: Option<ReapHook>,
    stalled: bool,
}

impl Shadow {
    pub fn connect(path: &Path, reap: Option<ReapHook>) -> Result<Shadow, QueueError> {
        let bad = || QueueError::BadEndpoint {
            path: path.to_path_buf(),
        };
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len <= DATA_OFF {
            return Err(bad());
        }
        let ring = Ring::map(&file, len)?;
        if ring.u64_at(MAGIC_OFF).load(Ordering::Acquire) != MAGIC
            || ring.u64_at(CAPACITY_OFF).load(Ordering::Relaxed) as usize != ring.capacity
        {
            return Err(bad());
        }
        let tail = ring.tail().load(Ordering::Acquire);
        Ok(Shadow {
            ring,
            tail,
            reap,
            stalled: false,
        })
    }

    /// Bytes published by the producer and not yet consumed.
    pub fn backlog(&self) -> usize {
        (self.ring.head().load(Ordering::Acquire) - self.tail) as usize
    }

    /// Run the reap check. Returns true when the callback fired.
    pub fn check_backlog(&mut self) -> bool {
        let Some(hook) = self.reap.as_mut() else {
            return false;
        };
        let backlog = (self.ring.head().load(Ordering::Acquire) - self.tail) as usize;
        if backlog <= hook.threshold {
            self.stalled = false;
            return false;
        }
        if self.stalled {
            return false;
        }
        self.stalled = true;
        (hook.callback)(backlog);
        true
    }

    /// Copy the oldest frame into `out`. Ok(false) when the ring is empty.
    pub fn recv(&mut self, out: &mut Vec<u8>) -> Result<bool, QueueError> {
        self.check_backlog();
        let cap = self.ring.capacity;
        let mut head = self.ring.head().load(Ordering::Acquire);
        loop {
            if self.tail == head {
                if self.ring.closed().load(Ordering::Acquire) == 0 {
                    return Ok(false);
                }
                head = self.ring.head().load(Ordering::Acquire);
                if self.tail == head {
                    return Err(QueueError::PeerClosed);
                }
            }
            let idx = self.ring.index(self.tail);
            let len = self.ring.read_len(idx);
            if len == WRAP_MARK {
                self.tail += (cap - idx) as u64;
                continue;
            }
            if len as usize > cap / 2 || idx + record_len(len as usize) > cap {
                return Err(QueueError::Corrupt {
                    pos: self.tail,
                    len,
                });
            }
            let frame =
                unsafe { slice::from_raw_parts(self.ring.data(idx + LEN_SIZE), len as usize) };
            out.clear();
            out.extend_from_slice(frame);
            self.tail += record_len(len as usize) as u64;
            self.ring.tail().store(self.tail, Ordering::Release);
            return Ok(true);
        }
    }
}

/// Error on a Transport Queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue full")]
    Full,
    #[error("frame of {len} bytes exceeds queue limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error("peer closed the queue")]
    PeerClosed,
    #[error("corrupt record at position {pos} (length {len})")]
    Corrupt { pos: u64, len: u32 },
    #[error("{path:?} is not a queue endpoint")]
    BadEndpoint { path: PathBuf },
    #[error("queue endpoint I/O: {0}")]
    Io(#[from] io::Error),
}
