//! Register access layer.
//!
//! The identification and cycle-counter instructions are issued through a
//! small machine-code stub copied into an executable mapping. [`Opcode`] owns
//! that mapping and exposes the two primitives behind the [`Cpuid`] trait, so
//! the decoders never see how the instruction is reached.

mod memory;
mod recorded;
mod stubs;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RegisterError;

pub use memory::{ExecutableMemory, SystemMemory};
pub use recorded::RecordedCpuid;
pub use stubs::{Abi, PointerWidth, StubSet, host_target, stub_for};

/// Output of one identification instruction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Registers {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl Registers {
    pub const fn new(eax: u32, ebx: u32, ecx: u32, edx: u32) -> Self {
        Self { eax, ebx, ecx, edx }
    }

    pub fn is_zero(&self) -> bool {
        self.eax == 0 && self.ebx == 0 && self.ecx == 0 && self.edx == 0
    }
}

/// Hardware identification as the drivers see it.
pub trait Cpuid: Send + Sync {
    /// Issues the identification instruction for `leaf` / `subleaf` on the
    /// core the calling thread currently runs on.
    fn cpuid(&self, leaf: u32, subleaf: u32) -> Registers;

    /// Reads the time-stamp counter, `None` when it is unavailable.
    fn cycle_count(&self) -> Option<u64>;
}

type IdentifyFn = unsafe extern "C" fn(leaf: u32, subleaf: u32, out: *mut [u32; 4]);
type CycleCountFn = unsafe extern "C" fn() -> u64;

/// Offset of the cycle-count stub inside the mapped page.
const CYCLE_COUNT_OFFSET: usize = 64;
/// Filler between the stubs (`int3`).
const PADDING: u8 = 0xCC;

struct Loaded {
    region: os_api::ExecutableRegion,
    identify: IdentifyFn,
    cycle_count: CycleCountFn,
}

/// Owner of the executable stubs.
pub struct Opcode {
    memory: Box<dyn ExecutableMemory>,
    loaded: RwLock<Option<Loaded>>,
}

impl Default for Opcode {
    fn default() -> Self {
        Self::new()
    }
}

impl Opcode {
    pub fn new() -> Self {
        Self::with_memory(Box::new(SystemMemory))
    }

    pub fn with_memory(memory: Box<dyn ExecutableMemory>) -> Self {
        Self {
            memory,
            loaded: RwLock::new(None),
        }
    }

    /// Lays out both stubs in one buffer, cycle counter at [`CYCLE_COUNT_OFFSET`].
    fn assemble(stubs: &StubSet) -> Vec<u8> {
        let mut code = vec![PADDING; CYCLE_COUNT_OFFSET + stubs.cycle_count.len()];
        code[..stubs.identify.len()].copy_from_slice(stubs.identify);
        code[CYCLE_COUNT_OFFSET..].copy_from_slice(stubs.cycle_count);
        code
    }

    /// Maps the stubs for the running target. Calling it again while open does nothing.
    pub fn open(&self) -> Result<(), RegisterError> {
        let mut loaded = self.loaded.write();
        if loaded.is_some() {
            return Ok(());
        }

        let (width, abi) =
            host_target().ok_or(RegisterError::UnsupportedArchitecture(std::env::consts::ARCH))?;
        let stubs = stub_for(width, abi).ok_or(RegisterError::NoStub { width, abi })?;

        let region = self.memory.allocate(&Self::assemble(stubs))?;
        let base = region.as_ptr();
        // SAFETY: the region holds the stub bytes for this exact target and
        // stays mapped until `close` drops the function pointers with it.
        let (identify, cycle_count) = unsafe {
            (
                std::mem::transmute::<*const u8, IdentifyFn>(base),
                std::mem::transmute::<*const u8, CycleCountFn>(base.add(CYCLE_COUNT_OFFSET)),
            )
        };
        debug!(?width, ?abi, len = region.len(), "register access stubs mapped");

        *loaded = Some(Loaded {
            region,
            identify,
            cycle_count,
        });
        Ok(())
    }

    /// Unmaps the stubs. Safe to call when already closed.
    pub fn close(&self) {
        if let Some(loaded) = self.loaded.write().take() {
            self.memory.free(loaded.region);
        }
    }

    pub fn is_open(&self) -> bool {
        self.loaded.read().is_some()
    }

    /// Runs the identification stub, `None` while closed.
    pub fn identify(&self, leaf: u32, subleaf: u32) -> Option<Registers> {
        let loaded = self.loaded.read();
        let loaded = loaded.as_ref()?;
        let mut out = [0u32; 4];
        // SAFETY: see `open`; the read lock keeps the mapping alive for the call.
        unsafe { (loaded.identify)(leaf, subleaf, &mut out) };
        Some(Registers::new(out[0], out[1], out[2], out[3]))
    }

    pub fn read_cycle_counter(&self) -> Option<u64> {
        let loaded = self.loaded.read();
        let loaded = loaded.as_ref()?;
        // SAFETY: see `open`.
        Some(unsafe { (loaded.cycle_count)() })
    }
}

impl Cpuid for Opcode {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> Registers {
        self.identify(leaf, subleaf).unwrap_or_default()
    }

    fn cycle_count(&self) -> Option<u64> {
        self.read_cycle_counter()
    }
}

impl Drop for Opcode {
    fn drop(&mut self) {
        self.close();
    }
}
