use serde::{Deserialize, Serialize};

use crate::models::cache::CacheRecord;
use crate::models::flags::FeatureSet;

/// Vendor family derived from the 12-byte signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Vendor {
    Intel,
    Amd,
    Hygon,
    Centaur,
    Zhaoxin,
    Hypervisor,
    #[default]
    Unknown,
}

impl Vendor {
    pub fn from_signature(signature: &str) -> Self {
        match signature {
            "GenuineIntel" | "GenuineIotel" => Vendor::Intel,
            "AuthenticAMD" | "AMDisbetter!" => Vendor::Amd,
            "HygonGenuine" => Vendor::Hygon,
            "CentaurHauls" | "VIA VIA VIA " => Vendor::Centaur,
            "  Shanghai  " => Vendor::Zhaoxin,
            "KVMKVMKVM\0\0\0" | "Microsoft Hv" | "VMwareVMware" | "XenVMMXenVMM" | " lrpepyh  vr"
            | "TCGTCGTCGTCG" | "VBoxVBoxVBox" | "bhyve bhyve " => Vendor::Hypervisor,
            _ => Vendor::Unknown,
        }
    }

    /// Vendors that follow AMD's extended leaf layout.
    pub fn uses_amd_leaves(&self) -> bool {
        matches!(self, Vendor::Amd | Vendor::Hygon)
    }
}

/// How far identification of a processor has progressed. Each stage unlocks
/// the leaves the next one needs.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum ProbeStage {
    #[default]
    Unidentified,
    VendorKnown,
    LevelsKnown,
    FeaturesKnown,
    TopologyKnown,
}

/// Which algorithm produced the physical core count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TopologySource {
    #[default]
    Unknown,
    /// Raw count from a fixed leaf, possibly SMT-halved.
    Legacy,
    /// Intel x2APIC leaves 0x1F / 0xB.
    ExtendedTopology,
    /// AMD leaf 0x8000001E.
    AmdExtended,
}

/// One logical execution unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreRecord {
    /// Logical index assigned at enumeration, never renumbered.
    pub index: usize,
    /// Physical core (topology unit) this logical core belongs to.
    pub core_id: u32,
    pub node_id: u32,
    pub apic_id: u32,
    pub normal_clock_mhz: u32,
    pub max_clock_mhz: u32,
    pub reference_clock_mhz: u32,
}

impl CoreRecord {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }
}

/// One physical processor package.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorRecord {
    /// Raw 12-character vendor signature.
    pub vendor: String,
    pub vendor_kind: Vendor,
    /// Brand string.
    pub name: String,
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
    pub max_standard_level: u32,
    pub max_extended_level: u32,
    pub features: FeatureSet,
    pub physical_cores: u32,
    pub logical_cores: u32,
    pub nodes: u32,
    pub logical_cores_per_node: u32,
    pub cores: Vec<CoreRecord>,
    pub caches: Vec<CacheRecord>,
    pub stage: ProbeStage,
    #[serde(default)]
    pub topology_source: TopologySource,
}

impl ProcessorRecord {
    /// Creates a processor with `logical` freshly enumerated cores.
    pub fn with_cores(logical: usize) -> Self {
        Self {
            logical_cores: logical as u32,
            cores: (0..logical).map(CoreRecord::new).collect(),
            ..Default::default()
        }
    }

    /// Returns the core with `index`, creating it on first sight.
    pub fn core_mut(&mut self, index: usize) -> &mut CoreRecord {
        let pos = match self.cores.binary_search_by_key(&index, |c| c.index) {
            Ok(pos) => pos,
            Err(pos) => {
                self.cores.insert(pos, CoreRecord::new(index));
                pos
            }
        };
        &mut self.cores[pos]
    }

    pub fn advance(&mut self, stage: ProbeStage) {
        if stage > self.stage {
            self.stage = stage;
        }
    }

    /// Threads per physical core, 1 when topology is unresolved.
    pub fn threads_per_core(&self) -> u32 {
        if self.physical_cores == 0 || self.logical_cores < self.physical_cores {
            return 1;
        }
        (self.logical_cores / self.physical_cores).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_signatures_classify() {
        assert_eq!(Vendor::from_signature("GenuineIntel"), Vendor::Intel);
        assert_eq!(Vendor::from_signature("AuthenticAMD"), Vendor::Amd);
        assert_eq!(Vendor::from_signature("HygonGenuine"), Vendor::Hygon);
        assert_eq!(Vendor::from_signature("Microsoft Hv"), Vendor::Hypervisor);
        assert_eq!(Vendor::from_signature("NoSuchVendor"), Vendor::Unknown);
        assert!(Vendor::Hygon.uses_amd_leaves());
    }

    #[test]
    fn core_mut_keeps_cores_ordered() {
        let mut cpu = ProcessorRecord::with_cores(2);
        cpu.core_mut(5).core_id = 3;
        cpu.core_mut(3);
        let indices: Vec<usize> = cpu.cores.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![0, 1, 3, 5]);
        assert_eq!(cpu.core_mut(5).core_id, 3);
    }

    #[test]
    fn stage_never_regresses() {
        let mut cpu = ProcessorRecord::default();
        cpu.advance(ProbeStage::FeaturesKnown);
        cpu.advance(ProbeStage::VendorKnown);
        assert_eq!(cpu.stage, ProbeStage::FeaturesKnown);
    }
}
