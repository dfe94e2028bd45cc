//! Named feature bits reported by the identification instruction.
//!
//! Every mask is built with `from_bits_retain`, so bits without a name here are
//! still carried through merges and serialization.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Leaf 1, EDX.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct StandardEdx: u32 {
        const FPU = 1 << 0;
        const VME = 1 << 1;
        const DE = 1 << 2;
        const PSE = 1 << 3;
        const TSC = 1 << 4;
        const MSR = 1 << 5;
        const PAE = 1 << 6;
        const MCE = 1 << 7;
        const CX8 = 1 << 8;
        const APIC = 1 << 9;
        const SEP = 1 << 11;
        const MTRR = 1 << 12;
        const PGE = 1 << 13;
        const MCA = 1 << 14;
        const CMOV = 1 << 15;
        const PAT = 1 << 16;
        const PSE36 = 1 << 17;
        const PSN = 1 << 18;
        const CLFSH = 1 << 19;
        const DS = 1 << 21;
        const ACPI = 1 << 22;
        const MMX = 1 << 23;
        const FXSR = 1 << 24;
        const SSE = 1 << 25;
        const SSE2 = 1 << 26;
        const SS = 1 << 27;
        const HTT = 1 << 28;
        const TM = 1 << 29;
        const IA64 = 1 << 30;
        const PBE = 1 << 31;
    }
}

bitflags! {
    /// Leaf 1, ECX.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct StandardEcx: u32 {
        const SSE3 = 1 << 0;
        const PCLMULQDQ = 1 << 1;
        const DTES64 = 1 << 2;
        const MONITOR = 1 << 3;
        const DS_CPL = 1 << 4;
        const VMX = 1 << 5;
        const SMX = 1 << 6;
        const EST = 1 << 7;
        const TM2 = 1 << 8;
        const SSSE3 = 1 << 9;
        const CNXT_ID = 1 << 10;
        const SDBG = 1 << 11;
        const FMA = 1 << 12;
        const CX16 = 1 << 13;
        const XTPR = 1 << 14;
        const PDCM = 1 << 15;
        const PCID = 1 << 17;
        const DCA = 1 << 18;
        const SSE4_1 = 1 << 19;
        const SSE4_2 = 1 << 20;
        const X2APIC = 1 << 21;
        const MOVBE = 1 << 22;
        const POPCNT = 1 << 23;
        const TSC_DEADLINE = 1 << 24;
        const AES = 1 << 25;
        const XSAVE = 1 << 26;
        const OSXSAVE = 1 << 27;
        const AVX = 1 << 28;
        const F16C = 1 << 29;
        const RDRAND = 1 << 30;
        const HYPERVISOR = 1 << 31;
    }
}

bitflags! {
    /// Leaf 7 sub-leaf 0, EBX.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ExtendedEbx: u32 {
        const FSGSBASE = 1 << 0;
        const TSC_ADJUST = 1 << 1;
        const SGX = 1 << 2;
        const BMI1 = 1 << 3;
        const HLE = 1 << 4;
        const AVX2 = 1 << 5;
        const FDP_EXCPTN_ONLY = 1 << 6;
        const SMEP = 1 << 7;
        const BMI2 = 1 << 8;
        const ERMS = 1 << 9;
        const INVPCID = 1 << 10;
        const RTM = 1 << 11;
        const PQM = 1 << 12;
        const FPU_CS_DS_DEPRECATED = 1 << 13;
        const MPX = 1 << 14;
        const PQE = 1 << 15;
        const AVX512F = 1 << 16;
        const AVX512DQ = 1 << 17;
        const RDSEED = 1 << 18;
        const ADX = 1 << 19;
        const SMAP = 1 << 20;
        const AVX512_IFMA = 1 << 21;
        const PCOMMIT = 1 << 22;
        const CLFLUSHOPT = 1 << 23;
        const CLWB = 1 << 24;
        const INTEL_PT = 1 << 25;
        const AVX512PF = 1 << 26;
        const AVX512ER = 1 << 27;
        const AVX512CD = 1 << 28;
        const SHA = 1 << 29;
        const AVX512BW = 1 << 30;
        const AVX512VL = 1 << 31;
    }
}

bitflags! {
    /// Leaf 7 sub-leaf 0, ECX.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ExtendedEcx: u32 {
        const PREFETCHWT1 = 1 << 0;
        const AVX512_VBMI = 1 << 1;
        const UMIP = 1 << 2;
        const PKU = 1 << 3;
        const OSPKE = 1 << 4;
        const WAITPKG = 1 << 5;
        const AVX512_VBMI2 = 1 << 6;
        const CET_SS = 1 << 7;
        const GFNI = 1 << 8;
        const VAES = 1 << 9;
        const VPCLMULQDQ = 1 << 10;
        const AVX512_VNNI = 1 << 11;
        const AVX512_BITALG = 1 << 12;
        const TME_EN = 1 << 13;
        const AVX512_VPOPCNTDQ = 1 << 14;
        const LA57 = 1 << 16;
        const RDPID = 1 << 22;
        const KL = 1 << 23;
        const BUS_LOCK_DETECT = 1 << 24;
        const CLDEMOTE = 1 << 25;
        const MOVDIRI = 1 << 27;
        const MOVDIR64B = 1 << 28;
        const ENQCMD = 1 << 29;
        const SGX_LC = 1 << 30;
        const PKS = 1 << 31;
    }
}

bitflags! {
    /// Leaf 7 sub-leaf 0, EDX.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ExtendedEdx: u32 {
        const AVX512_4VNNIW = 1 << 2;
        const AVX512_4FMAPS = 1 << 3;
        const FSRM = 1 << 4;
        const UINTR = 1 << 5;
        const AVX512_VP2INTERSECT = 1 << 8;
        const SRBDS_CTRL = 1 << 9;
        const MD_CLEAR = 1 << 10;
        const SERIALIZE = 1 << 14;
        const HYBRID = 1 << 15;
        const TSXLDTRK = 1 << 16;
        const PCONFIG = 1 << 18;
        const CET_IBT = 1 << 20;
        const AMX_BF16 = 1 << 22;
        const AVX512_FP16 = 1 << 23;
        const AMX_TILE = 1 << 24;
        const AMX_INT8 = 1 << 25;
        const IBRS_IBPB = 1 << 26;
        const STIBP = 1 << 27;
        const L1D_FLUSH = 1 << 28;
        const ARCH_CAPABILITIES = 1 << 29;
        const CORE_CAPABILITIES = 1 << 30;
        const SSBD = 1 << 31;
    }
}

bitflags! {
    /// Extended leaf 0x80000001, ECX.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ExtendedProcessorEcx: u32 {
        const LAHF_LM = 1 << 0;
        const CMP_LEGACY = 1 << 1;
        const SVM = 1 << 2;
        const EXTAPIC = 1 << 3;
        const CR8_LEGACY = 1 << 4;
        const ABM = 1 << 5;
        const SSE4A = 1 << 6;
        const MISALIGNSSE = 1 << 7;
        const PREFETCHW = 1 << 8;
        const OSVW = 1 << 9;
        const IBS = 1 << 10;
        const XOP = 1 << 11;
        const SKINIT = 1 << 12;
        const WDT = 1 << 13;
        const LWP = 1 << 15;
        const FMA4 = 1 << 16;
        const TCE = 1 << 17;
        const NODEID_MSR = 1 << 19;
        const TBM = 1 << 21;
        const TOPOEXT = 1 << 22;
        const PERFCTR_CORE = 1 << 23;
        const PERFCTR_NB = 1 << 24;
        const DBX = 1 << 26;
        const PERFTSC = 1 << 27;
        const PCX_L2I = 1 << 28;
        const MONITORX = 1 << 29;
        const ADDR_MASK_EXT = 1 << 30;
    }
}

bitflags! {
    /// Extended leaf 0x80000001, EDX.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct ExtendedProcessorEdx: u32 {
        const SYSCALL = 1 << 11;
        const MP = 1 << 19;
        const NX = 1 << 20;
        const MMXEXT = 1 << 22;
        const FXSR_OPT = 1 << 25;
        const PDPE1GB = 1 << 26;
        const RDTSCP = 1 << 27;
        const LM = 1 << 29;
        const THREEDNOWEXT = 1 << 30;
        const THREEDNOW = 1 << 31;
    }
}

bitflags! {
    /// Extended leaf 0x80000007, EDX (advanced power management).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct PowerManagementEdx: u32 {
        const TS = 1 << 0;
        const FID = 1 << 1;
        const VID = 1 << 2;
        const TTP = 1 << 3;
        const HTC = 1 << 4;
        const STC = 1 << 5;
        const MUL100 = 1 << 6;
        const HWPSTATE = 1 << 7;
        const INVARIANT_TSC = 1 << 8;
        const CPB = 1 << 9;
        const EFF_FREQ_RO = 1 << 10;
        const PROC_FEEDBACK = 1 << 11;
        const PROC_POWER_REPORTING = 1 << 12;
    }
}

/// All feature masks captured for one processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub standard_edx: StandardEdx,
    pub standard_ecx: StandardEcx,
    pub extended_ebx: ExtendedEbx,
    pub extended_ecx: ExtendedEcx,
    pub extended_edx: ExtendedEdx,
    pub processor_ecx: ExtendedProcessorEcx,
    pub processor_edx: ExtendedProcessorEdx,
    pub power_edx: PowerManagementEdx,
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self {
            standard_edx: StandardEdx::empty(),
            standard_ecx: StandardEcx::empty(),
            extended_ebx: ExtendedEbx::empty(),
            extended_ecx: ExtendedEcx::empty(),
            extended_edx: ExtendedEdx::empty(),
            processor_ecx: ExtendedProcessorEcx::empty(),
            processor_edx: ExtendedProcessorEdx::empty(),
            power_edx: PowerManagementEdx::empty(),
        }
    }
}

impl FeatureSet {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Bitwise union with `other`, unknown bits included.
    pub fn union_with(&mut self, other: &FeatureSet) {
        self.standard_edx |= other.standard_edx;
        self.standard_ecx |= other.standard_ecx;
        self.extended_ebx |= other.extended_ebx;
        self.extended_ecx |= other.extended_ecx;
        self.extended_edx |= other.extended_edx;
        self.processor_ecx |= other.processor_ecx;
        self.processor_edx |= other.processor_edx;
        self.power_edx |= other.power_edx;
    }

    /// Names of every known flag that is set, in register order.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        names.extend(self.standard_edx.iter_names().map(|(n, _)| n));
        names.extend(self.standard_ecx.iter_names().map(|(n, _)| n));
        names.extend(self.extended_ebx.iter_names().map(|(n, _)| n));
        names.extend(self.extended_ecx.iter_names().map(|(n, _)| n));
        names.extend(self.extended_edx.iter_names().map(|(n, _)| n));
        names.extend(self.processor_ecx.iter_names().map(|(n, _)| n));
        names.extend(self.processor_edx.iter_names().map(|(n, _)| n));
        names.extend(self.power_edx.iter_names().map(|(n, _)| n));
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_bits_are_retained() {
        // bit 10 of leaf 1 EDX is reserved
        let edx = StandardEdx::from_bits_retain(1 << 10 | 1 << 28);
        assert!(edx.contains(StandardEdx::HTT));
        assert_eq!(edx.bits(), 1 << 10 | 1 << 28);
    }

    #[test]
    fn union_is_idempotent() {
        let mut a = FeatureSet {
            standard_ecx: StandardEcx::AVX | StandardEcx::from_bits_retain(1 << 16),
            ..FeatureSet::default()
        };
        let copy = a;
        a.union_with(&copy);
        assert_eq!(a, copy);
    }

    #[test]
    fn names_follow_register_order() {
        let set = FeatureSet {
            standard_edx: StandardEdx::SSE2,
            extended_ebx: ExtendedEbx::AVX2,
            ..FeatureSet::default()
        };
        assert_eq!(set.names(), vec!["SSE2", "AVX2"]);
    }
}
