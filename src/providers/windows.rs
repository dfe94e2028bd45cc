//! Windows platform source: the processor registry hive.

use async_trait::async_trait;
use os_api::OS;

use super::{InformationProvider, ProbeContext};
use crate::error::ProbeError;
use crate::merge;
use crate::models::{MachineProfile, ProcessorRecord};

const UNKNOWN_MODEL: &str = "Unknown CPU";

/// Brand string and nominal clock per logical processor from the registry.
pub struct WindowsProvider;

#[async_trait]
impl InformationProvider for WindowsProvider {
    fn name(&self) -> &'static str {
        "windows"
    }

    fn is_applicable(&self, _profile: &MachineProfile, _ctx: &ProbeContext) -> bool {
        true
    }

    async fn gather_per_processor(
        &self,
        _ctx: &ProbeContext,
        cpu_index: usize,
        profile: &mut MachineProfile,
    ) -> Result<(), ProbeError> {
        let logical = profile.cpu_mut(cpu_index).cores.len();

        let mut cpu = ProcessorRecord::default();
        let model = OS::get_cpu_model();
        if model != UNKNOWN_MODEL {
            cpu.name = model;
        }
        for index in 0..logical {
            if let Some(mhz) = OS::get_cpu_mhz(index) {
                cpu.core_mut(index).normal_clock_mhz = mhz;
            }
        }

        let mut partial = MachineProfile::default();
        *partial.cpu_mut(cpu_index) = cpu;
        merge::reconcile(profile, &partial);
        Ok(())
    }
}
