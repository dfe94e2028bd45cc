use async_trait::async_trait;

use super::common::resolve_topology;
use super::{CoreContext, InformationProvider, PerCoreMode, ProbeContext, has_vendor};
use crate::decode::LeafGate;
use crate::decode::cache::{legacy_l2, structured_caches};
use crate::decode::topology::{has_core_level, x2apic_levels};
use crate::error::ProbeError;
use crate::merge::{MergePolicy, Mergeable};
use crate::models::{CoreRecord, MachineProfile, TopologySource, Vendor};

/// Deterministic cache parameters leaf.
const CACHE_LEAF: u32 = 4;
/// V2 extended topology leaf, preferred over 0xB when it describes itself.
const TOPOLOGY_LEAVES: [u32; 2] = [0x1F, 0xB];
/// Processor frequency information leaf.
const FREQUENCY_LEAF: u32 = 0x16;

/// Caches, x2APIC topology and nominal frequencies on Intel parts.
pub struct IntelProvider;

fn topology_leaf(gate: &LeafGate<'_>) -> Option<u32> {
    TOPOLOGY_LEAVES
        .into_iter()
        .find(|&leaf| gate.query(leaf, 0).is_some_and(|r| has_core_level(&r)))
}

#[async_trait]
impl InformationProvider for IntelProvider {
    fn name(&self) -> &'static str {
        "intel"
    }

    fn is_applicable(&self, profile: &MachineProfile, ctx: &ProbeContext) -> bool {
        ctx.cpuid.is_some() && has_vendor(profile, &[Vendor::Intel])
    }

    fn per_core_mode(&self, _ctx: &ProbeContext) -> PerCoreMode {
        PerCoreMode::Parallel
    }

    fn gather_per_core(&self, ctx: &CoreContext, core: &mut CoreRecord) -> Result<(), ProbeError> {
        if ctx.processor.vendor_kind != Vendor::Intel {
            return Ok(());
        }
        let gate = ctx.gate().ok_or_else(|| {
            ProbeError::Unsupported("identification instruction unavailable".into())
        })?;

        let mut caches = structured_caches(&gate, CACHE_LEAF);
        if caches.is_empty() {
            caches.extend(
                gate.query(0x8000_0006, 0)
                    .and_then(|r| legacy_l2(r.ecx)),
            );
        }
        for cache in caches {
            ctx.record_cache(cache);
        }

        if let Some(leaf) = topology_leaf(&gate) {
            if let (Some(levels), Some(regs)) = (x2apic_levels(&gate, leaf), gate.query(leaf, 0)) {
                core.apic_id = regs.edx;
                core.core_id = levels.core_id(regs.edx);
            }
        }

        if let Some(freq) = gate.query(FREQUENCY_LEAF, 0) {
            let p = MergePolicy::FirstWriterWins;
            core.normal_clock_mhz.merge_with(&(freq.eax & 0xFFFF), p);
            core.max_clock_mhz.merge_with(&(freq.ebx & 0xFFFF), p);
            core.reference_clock_mhz.merge_with(&(freq.ecx & 0xFFFF), p);
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
            .filter(|cpu| cpu.vendor_kind == Vendor::Intel)
        {
            let Some(gate) = ctx.gate(cpu) else {
                continue;
            };
            let rich = topology_leaf(&gate)
                .and_then(|leaf| x2apic_levels(&gate, leaf))
                .map(|_| TopologySource::ExtendedTopology);
            resolve_topology(cpu, &gate, rich);
        }
        Ok(())
    }
}
