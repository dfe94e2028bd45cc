//! Bit-exact decoding of identification-instruction output.
//!
//! Everything here is a pure function of register values. The drivers in
//! `crate::providers` decide which leaves to issue; these functions only
//! interpret what came back.

pub mod cache;
pub mod topology;

use crate::opcode::{Cpuid, Registers};

/// First leaf of the extended range.
pub const EXTENDED_BASE: u32 = 0x8000_0000;

/// Assembles the 12-byte vendor signature from leaf 0 (EBX, EDX, ECX order).
///
/// Each register holds four characters in little-endian byte order. Bytes map
/// one-to-one onto chars so the result is always exactly 12 characters.
pub fn vendor_signature(leaf0: &Registers) -> String {
    [leaf0.ebx, leaf0.edx, leaf0.ecx]
        .iter()
        .flat_map(|r| r.to_le_bytes())
        .map(char::from)
        .collect()
}

/// Brand string from extended leaves 0x80000002..=0x80000004.
pub fn brand_string(parts: &[Registers; 3]) -> String {
    let bytes: Vec<u8> = parts
        .iter()
        .flat_map(|r| [r.eax, r.ebx, r.ecx, r.edx])
        .flat_map(|r| r.to_le_bytes())
        .take_while(|b| *b != 0)
        .collect();
    String::from_utf8_lossy(&bytes).trim().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Signature {
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
}

/// Decodes family, model and stepping from leaf 1 EAX.
///
/// Family 0xF adds the extended family byte; families 6 and 0xF prepend the
/// extended model nibble.
pub fn signature(eax: u32) -> Signature {
    let stepping = eax & 0xF;
    let base_model = (eax >> 4) & 0xF;
    let base_family = (eax >> 8) & 0xF;
    let ext_model = (eax >> 16) & 0xF;
    let ext_family = (eax >> 20) & 0xFF;

    let family = if base_family == 0xF {
        base_family + ext_family
    } else {
        base_family
    };
    let model = if base_family == 0x6 || base_family == 0xF {
        (ext_model << 4) + base_model
    } else {
        base_model
    };

    Signature {
        family,
        model,
        stepping,
    }
}

/// Issues leaves only up to the maximum levels the processor reported.
pub struct LeafGate<'a> {
    cpuid: &'a dyn Cpuid,
    max_standard: u32,
    max_extended: u32,
}

impl<'a> LeafGate<'a> {
    pub fn new(cpuid: &'a dyn Cpuid, max_standard: u32, max_extended: u32) -> Self {
        Self {
            cpuid,
            max_standard,
            max_extended,
        }
    }

    /// Reads the maximum standard and extended levels straight from the hardware.
    pub fn probe(cpuid: &'a dyn Cpuid) -> Self {
        let max_standard = cpuid.cpuid(0, 0).eax;
        let max_extended = cpuid.cpuid(EXTENDED_BASE, 0).eax;
        Self::new(cpuid, max_standard, max_extended)
    }

    pub fn max_standard(&self) -> u32 {
        self.max_standard
    }

    pub fn max_extended(&self) -> u32 {
        self.max_extended
    }

    pub fn supports(&self, leaf: u32) -> bool {
        if leaf >= EXTENDED_BASE {
            self.max_extended >= EXTENDED_BASE && leaf <= self.max_extended
        } else {
            leaf <= self.max_standard
        }
    }

    /// Issues `leaf` / `subleaf`, or `None` when it lies beyond the reported maximum.
    pub fn query(&self, leaf: u32, subleaf: u32) -> Option<Registers> {
        self.supports(leaf).then(|| self.cpuid.cpuid(leaf, subleaf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::RecordedCpuid;

    fn pack(s: &[u8; 4]) -> u32 {
        u32::from_le_bytes(*s)
    }

    #[test]
    fn vendor_is_ebx_edx_ecx() {
        let regs = Registers::new(0x16, pack(b"Genu"), pack(b"ntel"), pack(b"ineI"));
        assert_eq!(vendor_signature(&regs), "GenuineIntel");

        let amd = Registers::new(0x10, pack(b"Auth"), pack(b"cAMD"), pack(b"enti"));
        assert_eq!(vendor_signature(&amd), "AuthenticAMD");
    }

    #[test]
    fn vendor_is_always_twelve_chars() {
        for regs in [
            Registers::default(),
            Registers::new(0, u32::MAX, 0x8080_8080, 0x0102_0304),
        ] {
            assert_eq!(vendor_signature(&regs).chars().count(), 12);
        }
    }

    #[test]
    fn family_15_adds_extended_family() {
        // AMD Zen 3: base family F, ext family A, ext model 2, model 1
        let sig = signature(0x00A2_0F10);
        assert_eq!(sig.family, 0xF + 0xA);
        assert_eq!(sig.model, 0x21);
        assert_eq!(sig.stepping, 0);
    }

    #[test]
    fn family_6_extends_model() {
        let sig = signature((0xA << 16) | (6 << 8) | (5 << 4) | 3);
        assert_eq!(sig.family, 6);
        assert_eq!(sig.model, 0xA5);
        assert_eq!(sig.stepping, 3);
    }

    #[test]
    fn other_families_ignore_extensions() {
        let sig = signature((0x3 << 20) | (0xA << 16) | (5 << 8) | (2 << 4) | 1);
        assert_eq!(sig.family, 5);
        assert_eq!(sig.model, 2);
    }

    #[test]
    fn brand_string_stops_at_nul_and_trims() {
        let text = b"  Intel(R) Core(TM) i7\0garbage garbage garbage!!";
        let mut words = [0u32; 12];
        for (i, chunk) in text.chunks(4).enumerate() {
            words[i] = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        let parts = [
            Registers::new(words[0], words[1], words[2], words[3]),
            Registers::new(words[4], words[5], words[6], words[7]),
            Registers::new(words[8], words[9], words[10], words[11]),
        ];
        assert_eq!(brand_string(&parts), "Intel(R) Core(TM) i7");
    }

    #[test]
    fn gate_refuses_leaves_above_maximum() {
        let cpu = RecordedCpuid::new()
            .leaf(0, 0, Registers::new(4, 0, 0, 0))
            .leaf(7, 0, Registers::new(0, 0xFFFF, 0, 0))
            .leaf(EXTENDED_BASE, 0, Registers::new(0x8000_0004, 0, 0, 0));
        let gate = LeafGate::probe(&cpu);
        assert_eq!(gate.max_standard(), 4);
        assert_eq!(gate.query(7, 0), None);
        assert!(gate.query(4, 0).is_some());
        assert!(gate.query(0x8000_0004, 0).is_some());
        assert_eq!(gate.query(0x8000_0008, 0), None);
    }

    #[test]
    fn gate_rejects_extended_range_without_base_leaf() {
        let cpu = RecordedCpuid::new().leaf(0, 0, Registers::new(1, 0, 0, 0));
        let gate = LeafGate::probe(&cpu);
        assert!(!gate.supports(EXTENDED_BASE));
        assert!(!gate.supports(0x8000_0001));
    }
}
