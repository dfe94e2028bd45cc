use std::ptr::NonNull;

/// A page-aligned block of memory that holds machine code and is mapped
/// read + execute.
///
/// The region is created by `OS::map_executable` and must be handed back to
/// `OS::unmap_executable`; dropping it without unmapping leaks the mapping.
#[derive(Debug)]
pub struct ExecutableRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is never written after it is published.
unsafe impl Send for ExecutableRegion {}
unsafe impl Sync for ExecutableRegion {}

impl ExecutableRegion {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Start of the mapped code.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
