use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{CoreContext, InformationProvider, PerCoreMode, ProbeContext};
use crate::error::ProbeError;
use crate::models::{CoreRecord, MachineProfile};
use crate::opcode::Cpuid;

/// Estimates each core's clock by sampling the cycle counter across a sleep.
///
/// Only runs when `measure_clock_speed` is requested; cores are sampled one
/// at a time.
pub struct ClockProvider;

/// Cycles per microsecond over `interval`, i.e. MHz.
pub fn measure_clock_mhz(cpuid: &dyn Cpuid, interval: Duration) -> Option<u32> {
    let start = Instant::now();
    let before = cpuid.cycle_count()?;
    std::thread::sleep(interval);
    let after = cpuid.cycle_count()?;
    let micros = start.elapsed().as_micros() as u64;
    if micros == 0 {
        return None;
    }
    u32::try_from(after.saturating_sub(before) / micros).ok()
}

fn has_cycle_counter(ctx: &ProbeContext) -> bool {
    ctx.cpuid
        .as_deref()
        .is_some_and(|cpuid| cpuid.cycle_count().is_some())
}

#[async_trait]
impl InformationProvider for ClockProvider {
    fn name(&self) -> &'static str {
        "clock"
    }

    fn is_applicable(&self, _profile: &MachineProfile, ctx: &ProbeContext) -> bool {
        ctx.options.measure_clock_speed
    }

    async fn gather_per_processor(
        &self,
        ctx: &ProbeContext,
        cpu_index: usize,
        _profile: &mut MachineProfile,
    ) -> Result<(), ProbeError> {
        if !has_cycle_counter(ctx) {
            warn!(cpu_index, "cycle counter unavailable, clock speed measurement skipped");
        }
        Ok(())
    }

    fn per_core_mode(&self, ctx: &ProbeContext) -> PerCoreMode {
        if has_cycle_counter(ctx) {
            PerCoreMode::Serialized
        } else {
            PerCoreMode::Skip
        }
    }

    fn gather_per_core(&self, ctx: &CoreContext, core: &mut CoreRecord) -> Result<(), ProbeError> {
        let cpuid = ctx.cpuid.as_deref().ok_or_else(|| {
            ProbeError::Unsupported("cycle counter unavailable".into())
        })?;
        let interval = Duration::from_millis(ctx.options.clock_sample_interval_ms);
        let mhz = measure_clock_mhz(cpuid, interval)
            .ok_or_else(|| ProbeError::Unsupported("cycle counter unavailable".into()))?;
        debug!(cpu = ctx.cpu_index, core = core.index, mhz, "measured clock");
        if core.normal_clock_mhz == 0 {
            core.normal_clock_mhz = mhz;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::RecordedCpuid;

    #[test]
    fn recorded_counter_measures_its_rate() {
        let cpuid = RecordedCpuid::new().with_tsc_mhz(3000);
        let mhz = measure_clock_mhz(&cpuid, Duration::from_millis(20)).unwrap();
        assert!((2700..=3000).contains(&mhz), "measured {mhz} MHz");
    }

    #[test]
    fn missing_counter_gives_none() {
        let cpuid = RecordedCpuid::new();
        assert_eq!(measure_clock_mhz(&cpuid, Duration::from_millis(1)), None);
    }
}
