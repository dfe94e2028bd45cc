//! Cache descriptor decoding: the structured per-cache leaves (Intel leaf 4,
//! AMD leaf 0x8000001D) and AMD's fixed-layout legacy leaves.

use crate::decode::LeafGate;
use crate::models::{CacheKind, CacheLevel, CacheRecord, FULLY_ASSOCIATIVE};
use crate::opcode::Registers;

/// Upper bound on sub-leaves walked before giving up on a missing terminator.
const MAX_CACHE_SUBLEAVES: u32 = 32;

/// Cache type field of a structured descriptor; 0 ends the list.
pub fn structured_type(regs: &Registers) -> u32 {
    regs.eax & 0x1F
}

/// Decodes one structured descriptor.
///
/// Returns `None` for the terminator and for levels/types this model does not
/// track.
pub fn structured_descriptor(regs: &Registers) -> Option<CacheRecord> {
    let kind = CacheKind::from_raw(structured_type(regs))?;
    let level = CacheLevel::from_raw((regs.eax >> 5) & 0x7)?;

    let fully_associative = regs.eax & (1 << 9) != 0;
    let shared_by = ((regs.eax >> 14) & 0xFFF) + 1;

    let line_size = (regs.ebx & 0xFFF) + 1;
    let partitions = ((regs.ebx >> 12) & 0x3FF) + 1;
    let ways = ((regs.ebx >> 22) & 0x3FF) + 1;
    let sets = regs.ecx.wrapping_add(1);

    let capacity = line_size as u64 * partitions as u64 * ways as u64 * sets as u64;

    Some(CacheRecord {
        level,
        kind,
        line_size,
        associativity: if fully_associative {
            FULLY_ASSOCIATIVE
        } else {
            ways
        },
        partitions,
        sets,
        capacity,
        wbinvd: regs.edx & 1 != 0,
        shared_by,
        times_observed: 1,
    })
}

/// Walks the sub-leaves of a structured cache leaf until the type reads "none".
pub fn structured_caches(gate: &LeafGate<'_>, leaf: u32) -> Vec<CacheRecord> {
    let mut caches = Vec::new();
    for subleaf in 0..MAX_CACHE_SUBLEAVES {
        let Some(regs) = gate.query(leaf, subleaf) else {
            break;
        };
        if structured_type(&regs) == 0 {
            break;
        }
        if let Some(cache) = structured_descriptor(&regs) {
            caches.push(cache);
        }
    }
    caches
}

/// Associativity encoding of the AMD L2/L3 legacy fields.
///
/// `None` means the cache is disabled; `Some(0)` means the value must come
/// from elsewhere.
pub fn legacy_associativity(code: u32) -> Option<u32> {
    match code {
        0x0 => None,
        0x1 => Some(1),
        0x2 => Some(2),
        0x3 => Some(3),
        0x4 => Some(4),
        0x5 => Some(6),
        0x6 => Some(8),
        0x8 => Some(16),
        0xA => Some(32),
        0xB => Some(48),
        0xC => Some(64),
        0xD => Some(96),
        0xE => Some(128),
        0xF => Some(FULLY_ASSOCIATIVE),
        _ => Some(0),
    }
}

fn legacy_record(
    level: CacheLevel,
    kind: CacheKind,
    capacity: u64,
    associativity: u32,
    line_size: u32,
) -> Option<CacheRecord> {
    if capacity == 0 || line_size == 0 {
        return None;
    }
    let sets = match associativity {
        0 => 0,
        FULLY_ASSOCIATIVE => 1,
        ways => (capacity / (line_size as u64 * ways as u64)) as u32,
    };
    Some(CacheRecord {
        level,
        kind,
        line_size,
        associativity,
        partitions: 1,
        sets,
        capacity,
        wbinvd: false,
        shared_by: 0,
        times_observed: 1,
    })
}

/// L1 descriptor from extended leaf 0x80000005 ECX (data) or EDX (instruction).
///
/// Size in KB at bits 31:24, associativity at 23:16 (0xFF = fully), line size at 7:0.
pub fn legacy_l1(reg: u32, kind: CacheKind) -> Option<CacheRecord> {
    let capacity = ((reg >> 24) & 0xFF) as u64 * 1024;
    let associativity = match (reg >> 16) & 0xFF {
        0xFF => FULLY_ASSOCIATIVE,
        ways => ways,
    };
    legacy_record(CacheLevel::L1, kind, capacity, associativity, reg & 0xFF)
}

/// L2 descriptor from extended leaf 0x80000006 ECX. Size in KB at bits 31:16.
pub fn legacy_l2(ecx: u32) -> Option<CacheRecord> {
    let capacity = ((ecx >> 16) & 0xFFFF) as u64 * 1024;
    let associativity = legacy_associativity((ecx >> 12) & 0xF)?;
    legacy_record(CacheLevel::L2, CacheKind::Unified, capacity, associativity, ecx & 0xFF)
}

/// L3 descriptor from extended leaf 0x80000006 EDX. Size in 512 KB units at bits 31:18.
pub fn legacy_l3(edx: u32) -> Option<CacheRecord> {
    let capacity = ((edx >> 18) & 0x3FFF) as u64 * 512 * 1024;
    let associativity = legacy_associativity((edx >> 12) & 0xF)?;
    legacy_record(CacheLevel::L3, CacheKind::Unified, capacity, associativity, edx & 0xFF)
}

/// All caches the legacy leaves describe, skipping leaves above the maximum.
pub fn legacy_caches(gate: &LeafGate<'_>) -> Vec<CacheRecord> {
    let mut caches = Vec::new();
    if let Some(l1) = gate.query(0x8000_0005, 0) {
        caches.extend(legacy_l1(l1.ecx, CacheKind::Data));
        caches.extend(legacy_l1(l1.edx, CacheKind::Instruction));
    }
    if let Some(l2l3) = gate.query(0x8000_0006, 0) {
        caches.extend(legacy_l2(l2l3.ecx));
        caches.extend(legacy_l3(l2l3.edx));
    }
    caches
}
