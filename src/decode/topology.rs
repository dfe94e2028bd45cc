//! Physical core and node topology from APIC-style identifiers.

use crate::decode::LeafGate;
use crate::opcode::Registers;

/// Level types reported in ECX[15:8] of the x2APIC topology leaves.
const LEVEL_INVALID: u32 = 0;
const LEVEL_SMT: u32 = 1;
const LEVEL_CORE: u32 = 2;

const MAX_TOPOLOGY_SUBLEAVES: u32 = 8;

/// Smallest `s` with `1 << s >= n`.
pub fn ceil_log2(n: u32) -> u32 {
    if n <= 1 {
        0
    } else {
        u32::BITS - (n - 1).leading_zeros()
    }
}

/// Bit shift that splits an x2APIC id into its thread and core fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X2ApicLevels {
    /// Shift that drops the SMT bits, leaving a core-unique id.
    pub smt_shift: u32,
}

impl X2ApicLevels {
    pub fn core_id(&self, x2apic_id: u32) -> u32 {
        x2apic_id.checked_shr(self.smt_shift).unwrap_or(0)
    }
}

/// Walks leaf 0x1F (or 0xB) and collects the SMT shift.
///
/// Returns `None` when the leaf is unsupported or reports nothing usable,
/// which sends the caller to the legacy path.
pub fn x2apic_levels(gate: &LeafGate<'_>, leaf: u32) -> Option<X2ApicLevels> {
    let mut smt_shift = None;
    let mut enumerated = false;

    for subleaf in 0..MAX_TOPOLOGY_SUBLEAVES {
        let regs = gate.query(leaf, subleaf)?;
        let level_type = (regs.ecx >> 8) & 0xFF;
        if level_type == LEVEL_INVALID || regs.ebx & 0xFFFF == 0 {
            break;
        }
        let shift = regs.eax & 0x1F;
        if level_type == LEVEL_SMT {
            smt_shift = Some(shift);
        }
        enumerated = true;
    }

    // a core level without an SMT level means one thread per core
    let smt_shift = match smt_shift {
        Some(shift) => shift,
        None if enumerated => 0,
        None => return None,
    };
    Some(X2ApicLevels { smt_shift })
}

/// Whether a topology leaf describes itself at sub-leaf 0.
pub fn has_core_level(regs: &Registers) -> bool {
    let level_type = (regs.ecx >> 8) & 0xFF;
    (level_type == LEVEL_SMT || level_type == LEVEL_CORE) && regs.ebx & 0xFFFF != 0
}

/// Decoded AMD extended APIC leaf 0x8000001E.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmdTopology {
    pub extended_apic_id: u32,
    pub threads_per_core: u32,
    pub node_id: u32,
}

impl AmdTopology {
    pub fn decode(regs: &Registers) -> Self {
        Self {
            extended_apic_id: regs.eax,
            threads_per_core: ((regs.ebx >> 8) & 0xFF) + 1,
            node_id: regs.ecx & 0xFF,
        }
    }

    /// Core id, unique across the package: the APIC id with the thread bits dropped.
    pub fn core_id(&self) -> u32 {
        self.extended_apic_id >> ceil_log2(self.threads_per_core)
    }
}

/// Initial APIC id from leaf 1 EBX[31:24].
pub fn legacy_apic_id(leaf1_ebx: u32) -> u32 {
    leaf1_ebx >> 24
}

/// Addressable logical processors per package from leaf 1 EBX[23:16].
pub fn legacy_logical_count(leaf1_ebx: u32) -> u32 {
    (leaf1_ebx >> 16) & 0xFF
}

/// Addressable cores per package from Intel leaf 4 EAX[31:26].
pub fn intel_core_count(leaf4_eax: u32) -> u32 {
    (leaf4_eax >> 26) + 1
}

/// Cores per package from AMD leaf 0x80000008 ECX[7:0].
pub fn amd_core_count(ecx: u32) -> u32 {
    (ecx & 0xFF) + 1
}

/// Halves a raw core count that still includes SMT siblings.
///
/// Only applies when hyper-threading is flagged and the raw figure equals the
/// logical count; a best-effort correction for firmware that reports threads
/// where cores are expected.
pub fn smt_halving(raw: u32, logical: u32, htt: bool) -> u32 {
    if htt && raw > 1 && raw == logical {
        raw / 2
    } else {
        raw
    }
}
