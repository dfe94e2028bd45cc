mod region;
pub use region::ExecutableRegion;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "linux")]
mod linux;
#[cfg(not(any(target_os = "windows", target_os = "linux")))]
mod unsupported;

// Export the implementation for the current platform under a shared interface
#[cfg(target_os = "windows")]
pub use windows::{OS, ThreadAffinity};
#[cfg(target_os = "linux")]
pub use linux::{OS, ThreadAffinity};
#[cfg(not(any(target_os = "windows", target_os = "linux")))]
pub use unsupported::{OS, ThreadAffinity};
