//! Discovery orchestration and the process-wide profile memo.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::affinity::PinnedRunner;
use crate::config::DiscoveryOptions;
use crate::error::{Phase, ProbeError};
use crate::models::{CoreRecord, MachineProfile, Platform, ProcessorRecord};
use crate::opcode::{Cpuid, Opcode};
use crate::providers::common::clamp_counts;
use crate::providers::{
    CoreContext, InformationProvider, PerCoreMode, ProbeContext, default_providers,
};

static GLOBAL_CACHE: Lazy<Arc<ProfileCache>> = Lazy::new(|| Arc::new(ProfileCache::new()));

/// Finished profiles keyed by whether clock speeds were measured.
#[derive(Default)]
pub struct ProfileCache {
    entries: Mutex<HashMap<bool, Arc<MachineProfile>>>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache shared by every default [`Gatherer`] in the process.
    pub fn global() -> Arc<ProfileCache> {
        Arc::clone(&GLOBAL_CACHE)
    }

    pub fn get(&self, measure_clock_speed: bool) -> Option<Arc<MachineProfile>> {
        self.entries.lock().get(&measure_clock_speed).cloned()
    }

    pub fn insert(&self, measure_clock_speed: bool, profile: Arc<MachineProfile>) {
        self.entries.lock().insert(measure_clock_speed, profile);
    }
}

/// Where identification answers come from.
enum CpuidSource {
    /// Map the stubs and ask the processor.
    Hardware,
    Fixed(Arc<dyn Cpuid>),
    Disabled,
}

/// Runs the registered drivers and assembles a [`MachineProfile`].
pub struct Gatherer {
    providers: Vec<Arc<dyn InformationProvider>>,
    cpuid: CpuidSource,
    logical_cores: usize,
    runner: Option<PinnedRunner>,
    cache: Arc<ProfileCache>,
}

impl Default for Gatherer {
    fn default() -> Self {
        Self::new()
    }
}

impl Gatherer {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> GathererBuilder {
        GathererBuilder::default()
    }

    /// Returns the memoized profile for the measurement flag, or runs discovery.
    pub async fn gather(&self, options: &DiscoveryOptions) -> Arc<MachineProfile> {
        let key = options.measure_clock_speed;
        if !options.invalidate_cache {
            if let Some(profile) = self.cache.get(key) {
                debug!(measure_clock_speed = key, "returning memoized profile");
                return profile;
            }
        }
        let profile = Arc::new(self.discover(options).await);
        self.cache.insert(key, Arc::clone(&profile));
        profile
    }

    fn open_cpuid(&self) -> Option<Arc<dyn Cpuid>> {
        match &self.cpuid {
            CpuidSource::Hardware => {
                let platform = Platform::current();
                if !platform.is_x86() {
                    debug!(
                        arch = %platform.arch,
                        "no identification instruction on this architecture"
                    );
                    return None;
                }
                let opcode = Opcode::new();
                match opcode.open() {
                    Ok(()) => Some(Arc::new(opcode) as Arc<dyn Cpuid>),
                    Err(e) => {
                        warn!(error = %e, "identification instruction unavailable, continuing without it");
                        None
                    }
                }
            }
            CpuidSource::Fixed(cpuid) => Some(Arc::clone(cpuid)),
            CpuidSource::Disabled => None,
        }
    }

    /// One full discovery run, bypassing the memo.
    ///
    /// Drivers gather in order and each one's per-core work is joined before
    /// the next starts. Post-update hooks run once every driver has gathered,
    /// then the core counts are clamped. A failing or panicking driver is
    /// logged and skipped.
    pub async fn discover(&self, options: &DiscoveryOptions) -> MachineProfile {
        let ctx = ProbeContext {
            cpuid: self.open_cpuid(),
            runner: self
                .runner
                .clone()
                .unwrap_or_else(|| PinnedRunner::new(options.pin_threads)),
            options: options.clone(),
        };

        let mut profile = MachineProfile::new(Platform::current());
        profile
            .cpus
            .push(ProcessorRecord::with_cores(self.logical_cores));

        let mut applied = Vec::new();
        for provider in &self.providers {
            let driver = provider.name();
            if !provider.is_applicable(&profile, &ctx) {
                debug!(driver, "driver not applicable");
                continue;
            }
            info!(driver, "gathering");
            for cpu_index in 0..profile.cpus.len() {
                let outcome =
                    AssertUnwindSafe(provider.gather_per_processor(&ctx, cpu_index, &mut profile))
                        .catch_unwind()
                        .await;
                if let Err(e) = contain(outcome) {
                    report(e.in_driver(driver, Phase::PerProcessor));
                }
                let mode = provider.per_core_mode(&ctx);
                self.fan_out(provider, &ctx, cpu_index, &mut profile, mode)
                    .await;
            }
            applied.push(Arc::clone(provider));
        }

        for provider in &applied {
            let outcome = AssertUnwindSafe(provider.post_update(&ctx, &mut profile))
                .catch_unwind()
                .await;
            if let Err(e) = contain(outcome) {
                report(e.in_driver(provider.name(), Phase::PostUpdate));
            }
        }

        for cpu in &mut profile.cpus {
            clamp_counts(cpu);
        }
        profile
    }

    /// Runs `provider`'s per-core hook on every core of one processor and
    /// waits for all of them.
    ///
    /// A core whose task died keeps the record it had before the fan-out.
    async fn fan_out(
        &self,
        provider: &Arc<dyn InformationProvider>,
        ctx: &ProbeContext,
        cpu_index: usize,
        profile: &mut MachineProfile,
        mode: PerCoreMode,
    ) {
        if mode == PerCoreMode::Skip {
            return;
        }
        let driver = provider.name();
        let cpu = profile.cpu_mut(cpu_index);
        let originals = std::mem::take(&mut cpu.cores);
        let caches = Arc::new(Mutex::new(std::mem::take(&mut cpu.caches)));
        let core_ctx = CoreContext {
            cpu_index,
            processor: Arc::new(cpu.clone()),
            cpuid: ctx.cpuid.clone(),
            caches: Arc::clone(&caches),
            options: ctx.options.clone(),
        };

        let jobs: Vec<(usize, CoreRecord)> =
            originals.iter().map(|c| (c.index, c.clone())).collect();
        let hook = Arc::clone(provider);
        let work = move |_core: usize, mut record: CoreRecord| {
            let outcome = hook.gather_per_core(&core_ctx, &mut record);
            (record, outcome)
        };
        let results = match mode {
            PerCoreMode::Serialized => ctx.runner.run_serialized(jobs, work).await,
            _ => ctx.runner.run_all(jobs, work).await,
        };

        let mut cores = Vec::with_capacity(originals.len());
        for (original, result) in originals.into_iter().zip(results) {
            match result {
                Ok(pinned) => {
                    let (record, outcome) = pinned.value;
                    if let Err(e) = outcome {
                        let e = e.in_driver(driver, Phase::PerCore);
                        error!(core = record.index, error = %e, "driver failed");
                    }
                    cores.push(record);
                }
                Err(join) => {
                    let e = ProbeError::from(join).in_driver(driver, Phase::PerCore);
                    error!(core = original.index, error = %e, "driver failed");
                    cores.push(original);
                }
            }
        }

        let cpu = profile.cpu_mut(cpu_index);
        cpu.cores = cores;
        cpu.caches = std::mem::take(&mut *caches.lock());
    }
}

fn report(e: ProbeError) {
    error!(error = %e, "driver failed");
}

/// Turns a panic caught inside a driver hook into an ordinary failure.
fn contain(
    outcome: Result<Result<(), ProbeError>, Box<dyn Any + Send>>,
) -> Result<(), ProbeError> {
    outcome.unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        Err(ProbeError::Panicked(message))
    })
}

/// Configures a [`Gatherer`].
#[derive(Default)]
pub struct GathererBuilder {
    providers: Option<Vec<Arc<dyn InformationProvider>>>,
    extra: Vec<Arc<dyn InformationProvider>>,
    cpuid: Option<CpuidSource>,
    logical_cores: Option<usize>,
    runner: Option<PinnedRunner>,
    cache: Option<Arc<ProfileCache>>,
}

impl GathererBuilder {
    /// Replaces the default driver list.
    pub fn providers(mut self, providers: Vec<Arc<dyn InformationProvider>>) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Registers one more driver after the others.
    pub fn provider(mut self, provider: Arc<dyn InformationProvider>) -> Self {
        self.extra.push(provider);
        self
    }

    /// Answers identification from `cpuid` instead of the hardware.
    pub fn cpuid(mut self, cpuid: Arc<dyn Cpuid>) -> Self {
        self.cpuid = Some(CpuidSource::Fixed(cpuid));
        self
    }

    /// Runs without any identification data.
    pub fn without_cpuid(mut self) -> Self {
        self.cpuid = Some(CpuidSource::Disabled);
        self
    }

    pub fn logical_cores(mut self, count: usize) -> Self {
        self.logical_cores = Some(count);
        self
    }

    pub fn runner(mut self, runner: PinnedRunner) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Memoizes into `cache` instead of the process-wide one.
    pub fn cache(mut self, cache: Arc<ProfileCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Gatherer {
        let mut providers = self.providers.unwrap_or_else(default_providers);
        providers.extend(self.extra);
        Gatherer {
            providers,
            cpuid: self.cpuid.unwrap_or(CpuidSource::Hardware),
            logical_cores: self.logical_cores.unwrap_or_else(num_cpus::get).max(1),
            runner: self.runner,
            cache: self.cache.unwrap_or_else(ProfileCache::global),
        }
    }
}

/// Discovers the machine with the default drivers and the process-wide memo.
///
/// The first call for a given `measure_clock_speed` setting runs every
/// applicable driver; later calls return the same shared profile until
/// `invalidate_cache` is set, which forces a fresh run and replaces the entry.
///
/// # Returns
///
/// The reconciled profile, shared with every other caller that asked with the
/// same clock setting.
pub async fn get_machine_information(options: &DiscoveryOptions) -> Arc<MachineProfile> {
    Gatherer::new().gather(options).await
}
