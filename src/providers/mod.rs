//! Probe drivers.
//!
//! Each driver contributes to the profile through four hooks that the
//! [`crate::gatherer::Gatherer`] calls in a fixed order: every applicable
//! driver's per-processor hook followed by its per-core fan-out, then every
//! post-update hook once all per-core work has joined.

pub mod amd;
pub mod clock;
pub mod common;
pub mod intel;
#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(windows)]
pub mod windows;

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::affinity::PinnedRunner;
use crate::config::DiscoveryOptions;
use crate::decode::LeafGate;
use crate::error::ProbeError;
use crate::models::cache::record_observation;
use crate::models::{CacheRecord, CoreRecord, MachineProfile, ProcessorRecord, Vendor};
use crate::opcode::Cpuid;

/// How a driver wants its per-core hook scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerCoreMode {
    /// No per-core work.
    Skip,
    /// All cores at once, joined before the next driver.
    Parallel,
    /// One core at a time.
    Serialized,
}

/// State shared by every hook of one discovery run.
pub struct ProbeContext {
    /// `None` when the register access layer could not be opened.
    pub cpuid: Option<Arc<dyn Cpuid>>,
    pub runner: PinnedRunner,
    pub options: DiscoveryOptions,
}

impl ProbeContext {
    /// Gate limited to the levels already recorded on `cpu`.
    pub fn gate<'a>(&'a self, cpu: &ProcessorRecord) -> Option<LeafGate<'a>> {
        let cpuid = self.cpuid.as_deref()?;
        Some(LeafGate::new(
            cpuid,
            cpu.max_standard_level,
            cpu.max_extended_level,
        ))
    }
}

/// What a per-core hook sees while running pinned to its core.
pub struct CoreContext {
    pub cpu_index: usize,
    /// Processor state as it stood when the fan-out started.
    pub processor: Arc<ProcessorRecord>,
    pub cpuid: Option<Arc<dyn Cpuid>>,
    /// Cache list shared by all cores of the processor.
    pub caches: Arc<Mutex<Vec<CacheRecord>>>,
    pub options: DiscoveryOptions,
}

impl CoreContext {
    pub fn gate(&self) -> Option<LeafGate<'_>> {
        let cpuid = self.cpuid.as_deref()?;
        Some(LeafGate::new(
            cpuid,
            self.processor.max_standard_level,
            self.processor.max_extended_level,
        ))
    }

    /// Adds one cache observation to the shared list.
    pub fn record_cache(&self, cache: CacheRecord) {
        record_observation(&mut self.caches.lock(), cache);
    }
}

#[async_trait]
pub trait InformationProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_applicable(&self, profile: &MachineProfile, ctx: &ProbeContext) -> bool;

    async fn gather_per_processor(
        &self,
        _ctx: &ProbeContext,
        _cpu_index: usize,
        _profile: &mut MachineProfile,
    ) -> Result<(), ProbeError> {
        Ok(())
    }

    fn per_core_mode(&self, _ctx: &ProbeContext) -> PerCoreMode {
        PerCoreMode::Skip
    }

    /// Runs on a worker pinned to `core.index`.
    fn gather_per_core(&self, _ctx: &CoreContext, _core: &mut CoreRecord) -> Result<(), ProbeError> {
        Ok(())
    }

    async fn post_update(
        &self,
        _ctx: &ProbeContext,
        _profile: &mut MachineProfile,
    ) -> Result<(), ProbeError> {
        Ok(())
    }
}

/// Drivers registered by default, in run order.
pub fn default_providers() -> Vec<Arc<dyn InformationProvider>> {
    let mut providers: Vec<Arc<dyn InformationProvider>> = vec![
        Arc::new(common::CommonProvider),
        Arc::new(clock::ClockProvider),
        Arc::new(intel::IntelProvider),
        Arc::new(amd::AmdProvider),
    ];
    #[cfg(target_os = "linux")]
    providers.push(Arc::new(linux::LinuxProvider::new()));
    #[cfg(windows)]
    providers.push(Arc::new(windows::WindowsProvider));
    providers
}

/// Whether any processor in `profile` was identified as one of `vendors`.
pub(crate) fn has_vendor(profile: &MachineProfile, vendors: &[Vendor]) -> bool {
    profile
        .cpus
        .iter()
        .any(|cpu| vendors.contains(&cpu.vendor_kind))
}
