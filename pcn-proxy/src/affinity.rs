//! CPU pinning for network context threads.

use std::io;

/// Pin the calling thread to `cpu_idx` modulo the online CPU count.
/// Returns the CPU actually used.
pub fn pin_current_thread(cpu_idx: usize) -> io::Result<usize> {
    let nprocs = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if nprocs <= 0 {
        return Err(io::Error::last_os_error());
    }
    let cpu_idx = cpu_idx % nprocs as usize;
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu_idx, &mut cpuset);
        // pid 0 is the calling thread
        if libc::sched_setaffinity(0, std::mem::size_of_val(&cpuset), &cpuset) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(cpu_idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_wraps_around_cpu_count() {
        let handle = std::thread::spawn(|| pin_current_thread(10_000));
        match handle.join().unwrap() {
            Ok(cpu) => assert!(cpu < 10_000),
            // Restricted cpusets may refuse; the error must still be an OS error.
            Err(e) => assert!(e.raw_os_error().is_some()),
        }
    }
}
