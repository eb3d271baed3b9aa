//! Queue endpoint naming: "create a ring endpoint on port P of node N".
//!
//! Each endpoint is a file `pcnq.<node>.<port>` in the fabric directory. The
//! node owning the producer side creates it; the peer attaches as consumer.

use std::fs;
use std::path::{Path, PathBuf};

use crate::queue::{Master, QueueError, ReapHook, Shadow};

/// Directory holding queue endpoints shared by both ends of every link.
#[derive(Debug, Clone)]
pub struct Fabric {
    dir: PathBuf,
}

impl Fabric {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `/dev/shm` when available, otherwise the OS temp dir.
    pub fn default_dir() -> PathBuf {
        let shm = Path::new("/dev/shm");
        if shm.is_dir() {
            shm.to_path_buf()
        } else {
            std::env::temp_dir()
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn endpoint(&self, node: u32, port: u32) -> PathBuf {
        self.dir.join(format!("pcnq.{}.{}", node, port))
    }

    /// Create the producer endpoint owned by `node` on `port`.
    pub fn create_master(&self, node: u32, port: u32, capacity: usize) -> Result<Master, QueueError> {
        fs::create_dir_all(&self.dir)?;
        Master::create(&self.endpoint(node, port), capacity)
    }

    /// Attach as consumer of the endpoint `node` created on `port`.
    pub fn connect_shadow(
        &self,
        node: u32,
        port: u32,
        reap: Option<ReapHook>,
    ) -> Result<Shadow, QueueError> {
        Shadow::connect(&self.endpoint(node, port), reap)
    }
}

impl Default for Fabric {
    fn default() -> Self {
        Self::new(Self::default_dir())
    }
}

/// Fresh, unique fabric directory for a test.
#[cfg(test)]
pub(crate) fn scratch_fabric(label: &str) -> Fabric {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "pcn-test-{}-{}-{}",
        label,
        std::process::id(),
        NEXT.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = fs::remove_dir_all(&dir);
    Fabric::new(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_names_are_per_node_and_port() {
        let fabric = Fabric::new("/tmp/fab");
        assert_eq!(fabric.endpoint(0, 20001), PathBuf::from("/tmp/fab/pcnq.0.20001"));
        assert_ne!(fabric.endpoint(1, 20001), fabric.endpoint(0, 20001));
    }

    #[test]
    fn create_master_makes_directory() {
        let fabric = scratch_fabric("mkdir");
        assert!(!fabric.dir().exists());
        let m = fabric.create_master(2, 7, 4096).unwrap();
        assert!(fabric.endpoint(2, 7).exists());
        drop(m);
        assert!(!fabric.endpoint(2, 7).exists());
    }
}
