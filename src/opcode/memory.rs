use os_api::{ExecutableRegion, OS};

use crate::error::RegisterError;

/// Source of executable pages for the register-access stubs.
pub trait ExecutableMemory: Send + Sync {
    /// Maps `code` into memory that can be executed.
    fn allocate(&self, code: &[u8]) -> Result<ExecutableRegion, RegisterError>;

    /// Releases a region returned by [`ExecutableMemory::allocate`].
    fn free(&self, region: ExecutableRegion);
}

/// Executable memory from the operating system's anonymous mappings.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl ExecutableMemory for SystemMemory {
    fn allocate(&self, code: &[u8]) -> Result<ExecutableRegion, RegisterError> {
        OS::map_executable(code).map_err(RegisterError::Allocation)
    }

    fn free(&self, region: ExecutableRegion) {
        if let Err(e) = OS::unmap_executable(region) {
            tracing::warn!(error = %e, "failed to release executable region");
        }
    }
}
