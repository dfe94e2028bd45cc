// Platforms without thread pinning or executable mappings wired up.

use crate::ExecutableRegion;

pub struct OS;

#[derive(Clone, Copy)]
pub struct ThreadAffinity;

impl ThreadAffinity {
    pub fn mask(&self) -> usize {
        0
    }
}

impl OS {
    pub fn pin_current_thread(_core: usize) -> Result<ThreadAffinity, String> {
        Err("thread affinity is not supported on this platform".into())
    }

    pub fn restore_current_thread(_previous: &ThreadAffinity) -> Result<(), String> {
        Ok(())
    }

    pub fn current_thread_affinity() -> Result<usize, String> {
        Err("thread affinity is not supported on this platform".into())
    }

    pub fn map_executable(_code: &[u8]) -> Result<ExecutableRegion, String> {
        Err("executable mappings are not supported on this platform".into())
    }

    pub fn unmap_executable(_region: ExecutableRegion) -> Result<(), String> {
        Ok(())
    }
}
