//! Vendor-neutral identification and the topology steps every vendor shares.

use std::collections::HashSet;

use async_trait::async_trait;
use tracing::debug;

use super::{CoreContext, InformationProvider, PerCoreMode, ProbeContext};
use crate::decode::cache::structured_type;
use crate::decode::topology::{
    amd_core_count, intel_core_count, legacy_apic_id, legacy_logical_count, smt_halving,
};
use crate::decode::{EXTENDED_BASE, LeafGate, brand_string, signature, vendor_signature};
use crate::error::ProbeError;
use crate::merge::{self, ProcessorField};
use crate::models::flags::{
    ExtendedEbx, ExtendedEcx, ExtendedEdx, ExtendedProcessorEcx, ExtendedProcessorEdx,
    PowerManagementEdx, StandardEcx, StandardEdx,
};
use crate::models::{
    CacheLevel, CoreRecord, MachineProfile, ProbeStage, ProcessorRecord, TopologySource, Vendor,
};
use crate::opcode::Cpuid;

/// Vendors with a driver of their own that resolves topology.
const DEDICATED: &[Vendor] = &[Vendor::Intel, Vendor::Amd, Vendor::Hygon];

/// Vendor, levels, signature, feature masks and brand string.
pub struct CommonProvider;

/// Runs the identification sequence on the calling thread.
pub fn identify(cpuid: &dyn Cpuid, cpu: &mut ProcessorRecord) -> Result<(), ProbeError> {
    let leaf0 = cpuid.cpuid(0, 0);
    if leaf0.is_zero() {
        return Err(ProbeError::Unsupported(
            "leaf 0 returned no vendor signature".into(),
        ));
    }
    cpu.vendor = vendor_signature(&leaf0);
    cpu.vendor_kind = Vendor::from_signature(&cpu.vendor);
    cpu.max_standard_level = leaf0.eax;
    cpu.advance(ProbeStage::VendorKnown);

    let max_extended = cpuid.cpuid(EXTENDED_BASE, 0).eax;
    cpu.max_extended_level = if max_extended >= EXTENDED_BASE {
        max_extended
    } else {
        0
    };
    cpu.advance(ProbeStage::LevelsKnown);

    let gate = LeafGate::new(cpuid, cpu.max_standard_level, cpu.max_extended_level);

    if let Some(leaf1) = gate.query(1, 0) {
        let sig = signature(leaf1.eax);
        cpu.family = sig.family;
        cpu.model = sig.model;
        cpu.stepping = sig.stepping;
        cpu.features.standard_edx = StandardEdx::from_bits_retain(leaf1.edx);
        cpu.features.standard_ecx = StandardEcx::from_bits_retain(leaf1.ecx);
    }
    if let Some(leaf7) = gate.query(7, 0) {
        cpu.features.extended_ebx = ExtendedEbx::from_bits_retain(leaf7.ebx);
        cpu.features.extended_ecx = ExtendedEcx::from_bits_retain(leaf7.ecx);
        cpu.features.extended_edx = ExtendedEdx::from_bits_retain(leaf7.edx);
    }
    if let Some(ext1) = gate.query(0x8000_0001, 0) {
        cpu.features.processor_ecx = ExtendedProcessorEcx::from_bits_retain(ext1.ecx);
        cpu.features.processor_edx = ExtendedProcessorEdx::from_bits_retain(ext1.edx);
    }
    if let Some(ext7) = gate.query(0x8000_0007, 0) {
        cpu.features.power_edx = PowerManagementEdx::from_bits_retain(ext7.edx);
    }
    if let (Some(a), Some(b), Some(c)) = (
        gate.query(0x8000_0002, 0),
        gate.query(0x8000_0003, 0),
        gate.query(0x8000_0004, 0),
    ) {
        let brand = brand_string(&[a, b, c]);
        if !brand.is_empty() {
            cpu.name = brand;
        }
    }
    cpu.advance(ProbeStage::FeaturesKnown);
    Ok(())
}

/// Topology figures a resolution step offers to the processor record.
const TOPOLOGY_FIELDS: [ProcessorField; 3] = [
    ProcessorField::PhysicalCores,
    ProcessorField::Nodes,
    ProcessorField::TopologySource,
];

/// Counts distinct core and node ids gathered per core.
///
/// Fails when two logical cores report the same APIC id, which happens when
/// the per-core work did not actually run on distinct cores. A node count is
/// only offered when some core reported a node other than 0.
pub(crate) fn rich_topology(
    cpu: &mut ProcessorRecord,
    source: TopologySource,
) -> Result<(), ProbeError> {
    if cpu.cores.is_empty() {
        return Err(ProbeError::InconsistentTopology(
            "no logical cores enumerated".into(),
        ));
    }
    let apic_ids: HashSet<u32> = cpu.cores.iter().map(|c| c.apic_id).collect();
    if apic_ids.len() != cpu.cores.len() {
        return Err(ProbeError::InconsistentTopology(format!(
            "{} logical cores report only {} distinct APIC ids",
            cpu.cores.len(),
            apic_ids.len()
        )));
    }
    let core_ids: HashSet<u32> = cpu.cores.iter().map(|c| c.core_id).collect();
    let node_ids: HashSet<u32> = cpu.cores.iter().map(|c| c.node_id).collect();
    let derived = ProcessorRecord {
        physical_cores: core_ids.len() as u32,
        nodes: if node_ids.iter().any(|&n| n != 0) {
            node_ids.len() as u32
        } else {
            0
        },
        topology_source: source,
        ..Default::default()
    };
    merge::reconcile_fields(cpu, &derived, &TOPOLOGY_FIELDS);
    Ok(())
}

/// Raw physical core count from the simplest leaf the vendor offers.
fn legacy_core_count(vendor: Vendor, gate: &LeafGate<'_>) -> Option<u32> {
    let vendor_count = match vendor {
        Vendor::Intel => gate
            .query(4, 0)
            .filter(|r| structured_type(r) != 0)
            .map(|r| intel_core_count(r.eax)),
        Vendor::Amd | Vendor::Hygon => gate
            .query(0x8000_0008, 0)
            .map(|r| amd_core_count(r.ecx)),
        _ => None,
    };
    vendor_count.or_else(|| {
        gate.query(1, 0)
            .map(|r| legacy_logical_count(r.ebx))
            .filter(|&n| n > 0)
    })
}

/// Fallback when no topology leaf can be trusted.
pub(crate) fn legacy_topology(cpu: &mut ProcessorRecord, gate: &LeafGate<'_>) {
    let logical = cpu.cores.len() as u32;
    let htt = cpu.features.standard_edx.contains(StandardEdx::HTT);
    let derived = ProcessorRecord {
        physical_cores: legacy_core_count(cpu.vendor_kind, gate)
            .map(|raw| smt_halving(raw, logical, htt))
            .unwrap_or(0),
        topology_source: TopologySource::Legacy,
        ..Default::default()
    };
    merge::reconcile_fields(cpu, &derived, &TOPOLOGY_FIELDS);

    let physical = cpu.physical_cores;
    if physical > 0 && logical >= physical {
        let threads = logical / physical;
        for core in &mut cpu.cores {
            core.core_id = core.index as u32 / threads;
            core.node_id = 0;
        }
    }
}

/// Enforces `1 <= physical <= logical` and derives per-node figures.
pub fn clamp_counts(cpu: &mut ProcessorRecord) {
    let logical = if cpu.cores.is_empty() {
        cpu.logical_cores
    } else {
        cpu.cores.len() as u32
    }
    .max(1);
    cpu.logical_cores = logical;
    cpu.physical_cores = cpu.physical_cores.clamp(1, logical);
    cpu.nodes = cpu.nodes.clamp(1, logical);
    cpu.logical_cores_per_node = logical / cpu.nodes;
}

/// Fills missing sharing widths and turns observation tallies into instance counts.
pub(crate) fn normalize_caches(cpu: &mut ProcessorRecord) {
    let logical = cpu.logical_cores.max(1);
    let threads = cpu.threads_per_core();
    for cache in &mut cpu.caches {
        if cache.shared_by == 0 {
            cache.shared_by = match cache.level {
                CacheLevel::L3 => logical,
                CacheLevel::L1 | CacheLevel::L2 => threads,
            };
        }
        cache.normalize_instances();
    }
}

/// Topology resolution shared by the vendor drivers.
///
/// `rich` names the topology leaf the vendor supports; without one, or when
/// its per-core results contradict each other, the legacy count is used.
pub(crate) fn resolve_topology(
    cpu: &mut ProcessorRecord,
    gate: &LeafGate<'_>,
    rich: Option<TopologySource>,
) {
    match rich.map(|source| rich_topology(cpu, source)) {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            debug!(error = %e, "falling back to legacy topology");
            legacy_topology(cpu, gate);
        }
        None => legacy_topology(cpu, gate),
    }
    clamp_counts(cpu);
    normalize_caches(cpu);
    cpu.advance(ProbeStage::TopologyKnown);
}

#[async_trait]
impl InformationProvider for CommonProvider {
    fn name(&self) -> &'static str {
        "common"
    }

    fn is_applicable(&self, _profile: &MachineProfile, ctx: &ProbeContext) -> bool {
        ctx.cpuid.is_some()
    }

    async fn gather_per_processor(
        &self,
        ctx: &ProbeContext,
        cpu_index: usize,
        profile: &mut MachineProfile,
    ) -> Result<(), ProbeError> {
        let cpuid = ctx.cpuid.as_deref().ok_or_else(|| {
            ProbeError::Unsupported("identification instruction unavailable".into())
        })?;
        identify(cpuid, profile.cpu_mut(cpu_index))
    }

    fn per_core_mode(&self, _ctx: &ProbeContext) -> PerCoreMode {
        PerCoreMode::Parallel
    }

    fn gather_per_core(&self, ctx: &CoreContext, core: &mut CoreRecord) -> Result<(), ProbeError> {
        if let Some(leaf1) = ctx.gate().and_then(|gate| gate.query(1, 0)) {
            core.apic_id = legacy_apic_id(leaf1.ebx);
        }
        Ok(())
    }

    async fn post_update(
        &self,
        ctx: &ProbeContext,
        profile: &mut MachineProfile,
    ) -> Result<(), ProbeError> {
        for cpu in profile
            .cpus
            .iter_mut()
            .filter(|cpu| cpu.stage >= ProbeStage::FeaturesKnown)
            .filter(|cpu| !DEDICATED.contains(&cpu.vendor_kind))
        {
            if let Some(gate) = ctx.gate(cpu) {
                resolve_topology(cpu, &gate, None);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cache::l1_data;
    use crate::opcode::{RecordedCpuid, Registers};

    fn pack(s: &[u8; 4]) -> u32 {
        u32::from_le_bytes(*s)
    }

    fn intel_leaf0(max: u32) -> Registers {
        Registers::new(max, pack(b"Genu"), pack(b"ntel"), pack(b"ineI"))
    }

    #[test]
    fn identify_walks_the_stages() {
        let cpu_id = RecordedCpuid::new()
            .leaf(0, 0, intel_leaf0(7))
            .leaf(1, 0, Registers::new(0x000A_0653, 0, 1 << 28, 1 << 28 | 1 << 26))
            .leaf(7, 0, Registers::new(0, 1 << 5, 0, 0));
        let mut cpu = ProcessorRecord::with_cores(4);
        identify(&cpu_id, &mut cpu).unwrap();

        assert_eq!(cpu.vendor, "GenuineIntel");
        assert_eq!(cpu.vendor_kind, Vendor::Intel);
        assert_eq!(cpu.model, 0xA5);
        assert_eq!(cpu.max_extended_level, 0);
        assert!(cpu.features.standard_edx.contains(StandardEdx::HTT));
        assert!(cpu.features.extended_ebx.contains(ExtendedEbx::AVX2));
        assert_eq!(cpu.stage, ProbeStage::FeaturesKnown);
    }

    #[test]
    fn identify_skips_a_silent_processor() {
        let mut cpu = ProcessorRecord::default();
        let err = identify(&RecordedCpuid::new(), &mut cpu).unwrap_err();
        assert!(matches!(err, ProbeError::Unsupported(_)));
        assert_eq!(cpu.stage, ProbeStage::Unidentified);
    }

    #[test]
    fn duplicate_apic_ids_are_inconsistent() {
        let mut cpu = ProcessorRecord::with_cores(2);
        assert!(matches!(
            rich_topology(&mut cpu, TopologySource::ExtendedTopology),
            Err(ProbeError::InconsistentTopology(_))
        ));
    }

    #[test]
    fn rich_topology_counts_distinct_ids() {
        let mut cpu = ProcessorRecord::with_cores(4);
        for core in &mut cpu.cores {
            core.apic_id = core.index as u32;
            core.core_id = core.index as u32 / 2;
        }
        rich_topology(&mut cpu, TopologySource::ExtendedTopology).unwrap();
        assert_eq!(cpu.physical_cores, 2);
        assert_eq!(cpu.nodes, 0);
        clamp_counts(&mut cpu);
        assert_eq!(cpu.nodes, 1);
    }

    #[test]
    fn platform_node_count_outlives_rich_topology() {
        let mut cpu = ProcessorRecord::with_cores(4);
        cpu.nodes = 2;
        for core in &mut cpu.cores {
            core.apic_id = core.index as u32;
            core.core_id = core.index as u32;
        }
        rich_topology(&mut cpu, TopologySource::ExtendedTopology).unwrap();
        clamp_counts(&mut cpu);
        assert_eq!(cpu.nodes, 2);
        assert_eq!(cpu.logical_cores_per_node, 2);
        assert_eq!(cpu.topology_source, TopologySource::ExtendedTopology);
    }

    #[test]
    fn distinct_node_ids_are_counted() {
        let mut cpu = ProcessorRecord::with_cores(4);
        for core in &mut cpu.cores {
            core.apic_id = core.index as u32;
            core.node_id = core.index as u32 / 2;
        }
        rich_topology(&mut cpu, TopologySource::AmdExtended).unwrap();
        assert_eq!(cpu.nodes, 2);
    }

    #[test]
    fn legacy_topology_keeps_a_known_physical_count() {
        let cpu_id = RecordedCpuid::new()
            .leaf(0, 0, intel_leaf0(1))
            .leaf(1, 0, Registers::new(0, 8 << 16, 0, 1 << 28));
        let mut cpu = ProcessorRecord::with_cores(8);
        identify(&cpu_id, &mut cpu).unwrap();
        cpu.physical_cores = 2;
        cpu.nodes = 2;
        let gate = LeafGate::new(&cpu_id, 1, 0);
        resolve_topology(&mut cpu, &gate, None);

        assert_eq!(cpu.physical_cores, 2);
        assert_eq!(cpu.nodes, 2);
        assert_eq!(cpu.cores[7].core_id, 1);
        assert_eq!(cpu.topology_source, TopologySource::Legacy);
    }

    #[test]
    fn legacy_topology_halves_smt_count() {
        let cpu_id = RecordedCpuid::new()
            .leaf(0, 0, intel_leaf0(1))
            .leaf(1, 0, Registers::new(0, 8 << 16, 0, 1 << 28));
        let mut cpu = ProcessorRecord::with_cores(8);
        identify(&cpu_id, &mut cpu).unwrap();
        let gate = LeafGate::new(&cpu_id, 1, 0);
        resolve_topology(&mut cpu, &gate, None);

        assert_eq!(cpu.physical_cores, 4);
        assert_eq!(cpu.topology_source, TopologySource::Legacy);
        assert_eq!(cpu.cores[7].core_id, 3);
        assert_eq!(cpu.stage, ProbeStage::TopologyKnown);
    }

    #[test]
    fn clamp_enforces_core_invariant() {
        let mut cpu = ProcessorRecord::with_cores(4);
        cpu.physical_cores = 9;
        cpu.nodes = 2;
        clamp_counts(&mut cpu);
        assert_eq!(cpu.physical_cores, 4);
        assert_eq!(cpu.logical_cores_per_node, 2);

        let mut empty = ProcessorRecord::default();
        clamp_counts(&mut empty);
        assert_eq!((empty.logical_cores, empty.physical_cores), (1, 1));
    }

    #[test]
    fn unknown_sharing_is_derived_from_topology() {
        let mut cpu = ProcessorRecord::with_cores(8);
        cpu.physical_cores = 4;
        let mut l1 = l1_data();
        l1.shared_by = 0;
        l1.times_observed = 8;
        let mut l3 = l1_data();
        l3.level = CacheLevel::L3;
        l3.shared_by = 0;
        l3.times_observed = 8;
        cpu.caches = vec![l1, l3];

        normalize_caches(&mut cpu);
        assert_eq!(cpu.caches[0].shared_by, 2);
        assert_eq!(cpu.caches[0].times_observed, 4);
        assert_eq!(cpu.caches[1].shared_by, 8);
        assert_eq!(cpu.caches[1].times_observed, 1);
    }
}
