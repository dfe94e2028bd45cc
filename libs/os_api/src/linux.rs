// linux thread affinity and executable memory

use std::io;
use std::ptr::{self, NonNull};

use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_EXEC, PROT_READ, PROT_WRITE};
use nix::sched::{CpuSet, sched_getaffinity, sched_setaffinity};
use nix::unistd::Pid;

use crate::ExecutableRegion;

pub struct OS;

/// Affinity of the calling thread captured before it was pinned.
#[derive(Clone)]
pub struct ThreadAffinity(CpuSet);

impl ThreadAffinity {
    /// Lowest `usize::BITS` CPUs of the captured set as a bit mask.
    pub fn mask(&self) -> usize {
        OS::mask_from_cpuset(&self.0)
    }
}

impl OS {
    // ---- helpers to reduce duplication ----
    fn cpuset_for_core(core: usize) -> Result<CpuSet, String> {
        let mut cpu_set = CpuSet::new();
        cpu_set
            .set(core)
            .map_err(|e| format!("core index {} out of range for affinity mask: {}", core, e))?;
        Ok(cpu_set)
    }

    fn mask_from_cpuset(set: &CpuSet) -> usize {
        let mut mask: usize = 0;
        for i in 0..usize::BITS as usize {
            if set.is_set(i).unwrap_or(false) {
                mask |= 1usize << i;
            }
        }
        mask
    }

    fn page_size() -> usize {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size <= 0 { 4096 } else { size as usize }
    }

    /// Restricts the calling thread to exactly one logical core.
    ///
    /// Returns the affinity that was in effect before, so the caller can put it
    /// back with [`OS::restore_current_thread`].
    pub fn pin_current_thread(core: usize) -> Result<ThreadAffinity, String> {
        // pid 0 addresses the calling thread, not the whole process
        let this_thread = Pid::from_raw(0);
        let previous = sched_getaffinity(this_thread).map_err(|e| e.to_string())?;
        let cpu_set = Self::cpuset_for_core(core)?;
        sched_setaffinity(this_thread, &cpu_set)
            .map_err(|e| format!("failed to pin thread to core {}: {}", core, e))?;
        Ok(ThreadAffinity(previous))
    }

    /// Puts back an affinity captured by [`OS::pin_current_thread`].
    pub fn restore_current_thread(previous: &ThreadAffinity) -> Result<(), String> {
        sched_setaffinity(Pid::from_raw(0), &previous.0)
            .map_err(|e| format!("failed to restore thread affinity: {}", e))
    }

    /// Gets the CPU affinity mask of the calling thread.
    /// Note: Only the lowest `usize::BITS` CPUs are represented in the returned mask.
    pub fn current_thread_affinity() -> Result<usize, String> {
        let set = sched_getaffinity(Pid::from_raw(0)).map_err(|e| e.to_string())?;
        Ok(Self::mask_from_cpuset(&set))
    }

    /// Copies `code` into a fresh anonymous mapping and flips it to read + execute.
    ///
    /// The mapping is never writable and executable at the same time.
    pub fn map_executable(code: &[u8]) -> Result<ExecutableRegion, String> {
        if code.is_empty() {
            return Err("refusing to map an empty code buffer".into());
        }
        let page = Self::page_size();
        let len = code.len().div_ceil(page) * page;

        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == MAP_FAILED {
            return Err(format!("mmap failed: {}", io::Error::last_os_error()));
        }

        unsafe {
            ptr::copy_nonoverlapping(code.as_ptr(), raw as *mut u8, code.len());
            if libc::mprotect(raw, len, PROT_READ | PROT_EXEC) != 0 {
                let err = io::Error::last_os_error();
                libc::munmap(raw, len);
                return Err(format!("mprotect(PROT_EXEC) denied: {}", err));
            }
        }

        let ptr = NonNull::new(raw as *mut u8).ok_or_else(|| "mmap returned null".to_string())?;
        Ok(ExecutableRegion::new(ptr, len))
    }

    /// Releases a region created by [`OS::map_executable`].
    pub fn unmap_executable(region: ExecutableRegion) -> Result<(), String> {
        let ret = unsafe { libc::munmap(region.as_ptr() as *mut libc::c_void, region.len()) };
        if ret == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error().to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_and_restore_round_trip() {
        let before = OS::current_thread_affinity().unwrap();
        let first_allowed = before.trailing_zeros() as usize;

        let previous = OS::pin_current_thread(first_allowed).unwrap();
        assert_eq!(OS::current_thread_affinity().unwrap(), 1usize << first_allowed);

        OS::restore_current_thread(&previous).unwrap();
        assert_eq!(OS::current_thread_affinity().unwrap(), before);
        assert_eq!(previous.mask(), before);
    }

    #[test]
    fn out_of_range_core_is_rejected() {
        assert!(OS::pin_current_thread(1 << 20).is_err());
    }

    #[test]
    fn map_executable_rounds_to_pages() {
        let region = OS::map_executable(&[0xC3]).unwrap();
        assert!(region.len() >= 1);
        assert_eq!(region.len() % OS::page_size(), 0);
        OS::unmap_executable(region).unwrap();
    }

    #[test]
    fn empty_code_is_rejected() {
        assert!(OS::map_executable(&[]).is_err());
    }
}
