use std::ffi::c_void;
use std::ptr::{self, NonNull};

use windows::Win32::System::Memory::{
    MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_PROTECTION_FLAGS, PAGE_READWRITE,
    VirtualAlloc, VirtualFree, VirtualProtect,
};
use windows::Win32::System::Threading::{GetCurrentThread, SetThreadAffinityMask};

use winreg::RegKey;
use winreg::enums::*;

use crate::ExecutableRegion;

// ---- internal error type (public API still returns String) ----
#[derive(Debug)]
enum OsError {
    Win(windows::core::Error),
    Msg(String),
}

impl std::fmt::Display for OsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OsError::Win(e) => write!(f, "{e}"),
            OsError::Msg(s) => write!(f, "{s}"),
        }
    }
}

impl From<windows::core::Error> for OsError {
    fn from(e: windows::core::Error) -> Self {
        Self::Win(e)
    }
}

pub struct OS;

/// Affinity mask of the calling thread captured before it was pinned.
///
/// **Note:** On systems with more than 64 logical CPUs (Processor Groups),
/// this only covers the current processor group.
#[derive(Clone, Copy)]
pub struct ThreadAffinity(usize);

impl ThreadAffinity {
    pub fn mask(&self) -> usize {
        self.0
    }
}

impl OS {
    // ---- helpers ----

    fn mask_for_core(core: usize) -> Result<usize, OsError> {
        1usize
            .checked_shl(core as u32)
            .ok_or_else(|| OsError::Msg(format!("core index {} out of range for affinity mask", core)))
    }

    fn set_thread_mask(mask: usize) -> Result<usize, OsError> {
        // SetThreadAffinityMask hands back the previous mask, or 0 on failure
        let previous = unsafe { SetThreadAffinityMask(GetCurrentThread(), mask) };
        if previous == 0 {
            return Err(OsError::Win(windows::core::Error::from_thread()));
        }
        Ok(previous)
    }

    /// Restricts the calling thread to exactly one logical core.
    pub fn pin_current_thread(core: usize) -> Result<ThreadAffinity, String> {
        (|| {
            let mask = Self::mask_for_core(core)?;
            Ok(ThreadAffinity(Self::set_thread_mask(mask)?))
        })()
        .map_err(|e: OsError| format!("Failed to pin thread to core {}: {}", core, e))
    }

    /// Puts back an affinity captured by [`OS::pin_current_thread`].
    pub fn restore_current_thread(previous: &ThreadAffinity) -> Result<(), String> {
        Self::set_thread_mask(previous.0)
            .map(|_| ())
            .map_err(|e| format!("Failed to restore thread affinity: {}", e))
    }

    /// Gets the CPU affinity mask of the calling thread.
    pub fn current_thread_affinity() -> Result<usize, String> {
        // There is no GetThreadAffinityMask; set-and-restore reads it back.
        (|| {
            let all = Self::set_thread_mask(usize::MAX).or_else(|_| Self::set_thread_mask(1))?;
            Self::set_thread_mask(all)?;
            Ok(all)
        })()
        .map_err(|e: OsError| format!("Failed to read thread affinity: {}", e))
    }

    /// Copies `code` into fresh pages and flips them to execute + read.
    pub fn map_executable(code: &[u8]) -> Result<ExecutableRegion, String> {
        (|| unsafe {
            if code.is_empty() {
                return Err(OsError::Msg("refusing to map an empty code buffer".into()));
            }
            let len = code.len();
            let raw = VirtualAlloc(None, len, MEM_COMMIT | MEM_RESERVE, PAGE_READWRITE);
            let ptr = NonNull::new(raw as *mut u8)
                .ok_or_else(|| OsError::Win(windows::core::Error::from_thread()))?;

            ptr::copy_nonoverlapping(code.as_ptr(), ptr.as_ptr(), len);

            let mut old = PAGE_PROTECTION_FLAGS(0);
            if let Err(e) = VirtualProtect(raw, len, PAGE_EXECUTE_READ, &mut old) {
                let _ = VirtualFree(raw, 0, MEM_RELEASE);
                return Err(e.into());
            }
            Ok(ExecutableRegion::new(ptr, len))
        })()
        .map_err(|e: OsError| format!("Failed to allocate executable memory: {}", e))
    }

    /// Releases a region created by [`OS::map_executable`].
    pub fn unmap_executable(region: ExecutableRegion) -> Result<(), String> {
        unsafe {
            VirtualFree(region.as_ptr() as *mut c_void, 0, MEM_RELEASE)
                .map_err(|e| format!("Failed to free executable memory: {}", e))
        }
    }

    pub fn get_cpu_model() -> String {
        Self::processor_registry_value::<String>(0, "ProcessorNameString")
            .map(|s| {
                s.trim_matches(|c: char| c.is_whitespace() || c == '\0')
                    .to_string()
            })
            .unwrap_or_else(|| "Unknown CPU".to_string())
    }

    /// Reported nominal clock speed of a logical processor in MHz.
    pub fn get_cpu_mhz(index: usize) -> Option<u32> {
        Self::processor_registry_value::<u32>(index, "~MHz")
    }

    fn processor_registry_value<T: winreg::types::FromRegValue>(
        index: usize,
        name: &str,
    ) -> Option<T> {
        let hklm = RegKey::predef(HKEY_LOCAL_MACHINE);
        hklm.open_subkey(format!(r"HARDWARE\DESCRIPTION\System\CentralProcessor\{}", index))
            .and_then(|key| key.get_value::<T, _>(name))
            .ok()
    }
}
