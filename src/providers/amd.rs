use async_trait::async_trait;

use super::common::resolve_topology;
use super::{CoreContext, InformationProvider, PerCoreMode, ProbeContext, has_vendor};
use crate::decode::LeafGate;
use crate::decode::cache::{legacy_caches, structured_caches};
use crate::decode::topology::AmdTopology;
use crate::error::ProbeError;
use crate::models::flags::ExtendedProcessorEcx;
use crate::models::{CoreRecord, MachineProfile, ProcessorRecord, TopologySource, Vendor};

/// Cache properties leaf, valid with TOPOEXT.
const CACHE_LEAF: u32 = 0x8000_001D;
/// Extended APIC id / compute unit / node leaf, valid with TOPOEXT.
const TOPOLOGY_LEAF: u32 = 0x8000_001E;

/// Caches and compute-unit topology on AMD and Hygon parts.
pub struct AmdProvider;

fn has_topology_extensions(cpu: &ProcessorRecord, gate: &LeafGate<'_>, leaf: u32) -> bool {
    cpu.features
        .processor_ecx
        .contains(ExtendedProcessorEcx::TOPOEXT)
        && gate.supports(leaf)
}

#[async_trait]
impl InformationProvider for AmdProvider {
    fn name(&self) -> &'static str {
        "amd"
    }

    fn is_applicable(&self, profile: &MachineProfile, ctx: &ProbeContext) -> bool {
        ctx.cpuid.is_some() && has_vendor(profile, &[Vendor::Amd, Vendor::Hygon])
    }

    fn per_core_mode(&self, _ctx: &ProbeContext) -> PerCoreMode {
        PerCoreMode::Parallel
    }

    fn gather_per_core(&self, ctx: &CoreContext, core: &mut CoreRecord) -> Result<(), ProbeError> {
        if !ctx.processor.vendor_kind.uses_amd_leaves() {
            return Ok(());
        }
        let gate = ctx.gate().ok_or_else(|| {
            ProbeError::Unsupported("identification instruction unavailable".into())
        })?;

        let mut caches = if has_topology_extensions(&ctx.processor, &gate, CACHE_LEAF) {
            structured_caches(&gate, CACHE_LEAF)
        } else {
            Vec::new()
        };
        if caches.is_empty() {
            caches = legacy_caches(&gate);
        }
        for cache in caches {
            ctx.record_cache(cache);
        }

        if has_topology_extensions(&ctx.processor, &gate, TOPOLOGY_LEAF) {
            if let Some(regs) = gate.query(TOPOLOGY_LEAF, 0) {
                let topology = AmdTopology::decode(&regs);
                core.apic_id = topology.extended_apic_id;
                core.core_id = topology.core_id();
                core.node_id = topology.node_id;
            }
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
            .filter(|cpu| cpu.vendor_kind.uses_amd_leaves())
        {
            let Some(gate) = ctx.gate(cpu) else {
                continue;
            };
            let rich = has_topology_extensions(cpu, &gate, TOPOLOGY_LEAF)
                .then_some(TopologySource::AmdExtended);
            resolve_topology(cpu, &gate, rich);
        }
        Ok(())
    }
}
