//! CPU affinity for the engine worker and completion threads.
//!
//! A mask of 0 means "leave the thread unpinned". Pinning failure is never
//! fatal; callers log it and keep running on whatever cores the OS picks.

use std::io;

/// Core indices set in `mask`, lowest first.
pub fn cores_in_mask(mask: u64) -> Vec<usize> {
    (0..64).filter(|bit| mask & (1u64 << bit) != 0).collect()
}

/// Core for the `index`-th thread of a group pinned under `mask`.
///
/// Threads wrap around when there are more threads than cores in the mask.
pub fn core_for_thread(mask: u64, index: usize) -> Option<usize> {
    let cores = cores_in_mask(mask);
    if cores.is_empty() {
        return None;
    }
    Some(cores[index % cores.len()])
}

/// Restrict the calling thread to the cores in `mask`.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(mask: u64) -> io::Result<()> {
    let cores = cores_in_mask(mask);
    if cores.is_empty() {
        return Ok(());
    }

    let res = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for core in cores {
            libc::CPU_SET(core, &mut set);
        }
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set)
    };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_mask: u64) -> io::Result<()> {
    Ok(())
}

/// Pin the calling thread, logging instead of failing.
pub(crate) fn pin_or_warn(mask: u64, thread: &str) {
    if mask == 0 {
        return;
    }
    match pin_current_thread(mask) {
        Ok(()) => tracing::debug!("Pinned {} to cores {:?}", thread, cores_in_mask(mask)),
        Err(e) => tracing::warn!("Failed to pin {} to mask {:#x}: {}", thread, mask, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cores_in_mask() {
        assert!(cores_in_mask(0).is_empty());
        assert_eq!(cores_in_mask(0b1011), vec![0, 1, 3]);
        assert_eq!(cores_in_mask(1 << 63), vec![63]);
    }

    #[test]
    fn test_core_for_thread_wraps() {
        assert_eq!(core_for_thread(0, 0), None);
        assert_eq!(core_for_thread(0b0110, 0), Some(1));
        assert_eq!(core_for_thread(0b0110, 1), Some(2));
        assert_eq!(core_for_thread(0b0110, 2), Some(1));
    }

    #[test]
    fn test_zero_mask_is_noop() {
        assert!(pin_current_thread(0).is_ok());
    }
}
