use std::sync::Arc;

use async_trait::async_trait;
use cpu_topology::affinity::PinnedRunner;
use cpu_topology::log_manager::LogManager;
use cpu_topology::models::{CacheKind, CacheLevel, MachineProfile, TopologySource, Vendor};
use cpu_topology::opcode::{RecordedCpuid, Registers};
use cpu_topology::providers::amd::AmdProvider;
use cpu_topology::providers::clock::ClockProvider;
use cpu_topology::providers::common::CommonProvider;
use cpu_topology::providers::intel::IntelProvider;
use cpu_topology::{
    DiscoveryOptions, Gatherer, InformationProvider, ProbeContext, ProbeError, ProfileCache,
};
use tracing_subscriber::layer::SubscriberExt;

#[cfg(target_os = "linux")]
use cpu_topology::providers::linux::LinuxProvider;

const HTT: u32 = 1 << 28;
const TOPOEXT: u32 = 1 << 22;

fn vendor_leaf(max: u32, signature: &[u8; 12]) -> Registers {
    let word = |i: usize| u32::from_le_bytes([
        signature[i],
        signature[i + 1],
        signature[i + 2],
        signature[i + 3],
    ]);
    Registers::new(max, word(0), word(8), word(4))
}

fn descriptor(kind: u32, level: u32, sharing: u32, ways: u32, line: u32, sets: u32) -> Registers {
    Registers::new(
        kind | (level << 5) | ((sharing - 1) << 14),
        (line - 1) | ((ways - 1) << 22),
        sets - 1,
        0,
    )
}

fn gatherer(cpuid: RecordedCpuid, cores: usize) -> Gatherer {
    Gatherer::builder()
        .providers(vec![
            Arc::new(CommonProvider),
            Arc::new(ClockProvider),
            Arc::new(IntelProvider),
            Arc::new(AmdProvider),
        ])
        .cpuid(Arc::new(cpuid))
        .logical_cores(cores)
        .runner(PinnedRunner::unpinned())
        .cache(Arc::new(ProfileCache::new()))
        .build()
}

async fn discover(cpuid: RecordedCpuid, cores: usize) -> MachineProfile {
    gatherer(cpuid, cores)
        .discover(&DiscoveryOptions::default())
        .await
}

/// 4 cores / 8 threads that only answer up to leaf 1.
fn legacy_intel() -> RecordedCpuid {
    RecordedCpuid::new()
        .leaf(0, 0, vendor_leaf(1, b"GenuineIntel"))
        .leaf(1, 0, Registers::new((0xA << 16) | (6 << 8) | (5 << 4) | 3, 8 << 16, 0, HTT))
}

#[tokio::test]
async fn smt_part_with_only_basic_leaves() {
    let profile = discover(legacy_intel(), 8).await;
    let cpu = &profile.cpus[0];

    assert_eq!(cpu.vendor_kind, Vendor::Intel);
    assert_eq!(cpu.family, 6);
    assert_eq!(cpu.model, 0xA5);
    assert_eq!(cpu.stepping, 3);
    assert_eq!(cpu.logical_cores, 8);
    assert_eq!(cpu.physical_cores, 4);
    assert_eq!(cpu.topology_source, TopologySource::Legacy);
}

#[tokio::test]
async fn intel_structured_caches_and_x2apic_topology() {
    let mut cpuid = RecordedCpuid::new()
        .leaf(0, 0, vendor_leaf(0xB, b"GenuineIntel"))
        .leaf(1, 0, Registers::new(0x000A_0655, 16 << 16, 0, HTT))
        .leaf(4, 0, descriptor(1, 1, 2, 8, 64, 64))
        .leaf(4, 1, descriptor(2, 1, 2, 8, 64, 64))
        .leaf(4, 2, descriptor(3, 2, 2, 4, 64, 1024))
        .leaf(4, 3, descriptor(3, 3, 16, 16, 64, 8192))
        .leaf(0xB, 0, Registers::new(1, 2, 1 << 8, 0))
        .leaf(0xB, 1, Registers::new(3, 8, (2 << 8) | 1, 0));
    for core in 0..8 {
        cpuid = cpuid.core_leaf(core, 0xB, 0, Registers::new(1, 2, 1 << 8, core as u32));
    }

    let profile = discover(cpuid, 8).await;
    let cpu = &profile.cpus[0];

    assert_eq!(cpu.topology_source, TopologySource::ExtendedTopology);
    assert_eq!(cpu.physical_cores, 4);
    assert_eq!(cpu.nodes, 1);
    assert_eq!(cpu.logical_cores_per_node, 8);
    let core_ids: Vec<u32> = cpu.cores.iter().map(|c| c.core_id).collect();
    assert_eq!(core_ids, vec![0, 0, 1, 1, 2, 2, 3, 3]);

    assert_eq!(cpu.caches.len(), 4);
    let l1d = cpu
        .caches
        .iter()
        .find(|c| c.level == CacheLevel::L1 && c.kind == CacheKind::Data)
        .unwrap();
    assert_eq!(l1d.capacity, 32 * 1024);
    assert_eq!(l1d.times_observed, 4);
    let l3 = cpu.caches.iter().find(|c| c.level == CacheLevel::L3).unwrap();
    assert_eq!(l3.capacity, 8 * 1024 * 1024);
    assert_eq!(l3.times_observed, 1);
}

#[tokio::test]
async fn intel_without_cache_leaf_falls_back_to_extended_l2() {
    let cpuid = legacy_intel()
        .leaf(0x8000_0000, 0, Registers::new(0x8000_0006, 0, 0, 0))
        .leaf(0x8000_0006, 0, Registers::new(0, 0, (256 << 16) | (0x6 << 12) | 64, 0));

    let profile = discover(cpuid, 8).await;
    let cpu = &profile.cpus[0];

    assert_eq!(cpu.physical_cores, 4);
    assert_eq!(cpu.caches.len(), 1);
    let l2 = &cpu.caches[0];
    assert_eq!(l2.level, CacheLevel::L2);
    assert_eq!(l2.kind, CacheKind::Unified);
    assert_eq!(l2.capacity, 256 * 1024);
    assert_eq!(l2.associativity, 8);
    assert_eq!(l2.shared_by, 2);
    assert_eq!(l2.times_observed, 4);
}

#[tokio::test]
async fn amd_legacy_cache_leaves() {
    let cpuid = RecordedCpuid::new()
        .leaf(0, 0, vendor_leaf(1, b"AuthenticAMD"))
        .leaf(1, 0, Registers::new((8 << 20) | (0xF << 8) | (1 << 4), 16 << 16, 0, HTT))
        .leaf(0x8000_0000, 0, Registers::new(0x8000_0008, 0, 0, 0))
        .leaf(0x8000_0005, 0, Registers::new(0, 0, 0x2008_0140, 0x2008_0140))
        .leaf(0x8000_0006, 0, Registers::new(0, 0, 0x0200_6140, (32 << 18) | (0x9 << 12) | 64))
        .leaf(0x8000_0008, 0, Registers::new(0, 0, 7, 0));

    let profile = discover(cpuid, 16).await;
    let cpu = &profile.cpus[0];

    assert_eq!(cpu.family, 0x17);
    assert_eq!(cpu.physical_cores, 8);
    assert_eq!(cpu.topology_source, TopologySource::Legacy);
    assert_eq!(cpu.caches.len(), 4);

    let l2 = cpu.caches.iter().find(|c| c.level == CacheLevel::L2).unwrap();
    assert_eq!(l2.capacity, 512 * 1024);
    assert_eq!(l2.associativity, 8);
    assert_eq!(l2.shared_by, 2);
    assert_eq!(l2.times_observed, 8);

    let l3 = cpu.caches.iter().find(|c| c.level == CacheLevel::L3).unwrap();
    assert_eq!(l3.capacity, 16 * 1024 * 1024);
    assert_eq!(l3.shared_by, 16);
    assert_eq!(l3.times_observed, 1);
}

#[tokio::test]
async fn amd_topology_extensions_report_nodes() {
    let mut cpuid = RecordedCpuid::new()
        .leaf(0, 0, vendor_leaf(1, b"AuthenticAMD"))
        .leaf(1, 0, Registers::new(0x00A2_0F10, 4 << 16, 0, HTT))
        .leaf(0x8000_0000, 0, Registers::new(0x8000_001E, 0, 0, 0))
        .leaf(0x8000_0001, 0, Registers::new(0, 0, TOPOEXT, 0))
        .leaf(0x8000_001D, 0, descriptor(1, 1, 2, 8, 64, 64))
        .leaf(0x8000_001D, 1, descriptor(3, 2, 2, 8, 64, 1024))
        .leaf(0x8000_001D, 2, descriptor(3, 3, 4, 16, 64, 16384));
    for core in 0..4u32 {
        let node = core / 2;
        cpuid = cpuid.core_leaf(
            core as usize,
            0x8000_001E,
            0,
            Registers::new(core, (1 << 8) | (core / 2), (1 << 8) | node, 0),
        );
    }

    let profile = discover(cpuid, 4).await;
    let cpu = &profile.cpus[0];

    assert_eq!(cpu.topology_source, TopologySource::AmdExtended);
    assert_eq!(cpu.physical_cores, 2);
    assert_eq!(cpu.nodes, 2);
    assert_eq!(cpu.logical_cores_per_node, 2);
    assert_eq!(cpu.cores[3].node_id, 1);
    let l3 = cpu.caches.iter().find(|c| c.level == CacheLevel::L3).unwrap();
    assert_eq!(l3.times_observed, 1);
}

#[tokio::test]
async fn clock_measurement_fills_every_core() {
    let options = DiscoveryOptions {
        measure_clock_speed: true,
        clock_sample_interval_ms: 20,
        ..Default::default()
    };
    let profile = gatherer(legacy_intel().with_tsc_mhz(2000), 2)
        .discover(&options)
        .await;
    for core in &profile.cpus[0].cores {
        assert!(
            (1800..=2000).contains(&core.normal_clock_mhz),
            "core {} measured {} MHz",
            core.index,
            core.normal_clock_mhz
        );
    }
}

#[tokio::test]
async fn clock_measurement_without_counter_is_skipped_with_warning() {
    let log = LogManager::new();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(log.clone()));

    let options = DiscoveryOptions {
        measure_clock_speed: true,
        ..Default::default()
    };
    let profile = gatherer(legacy_intel(), 2).discover(&options).await;

    assert!(profile.cpus[0].cores.iter().all(|c| c.normal_clock_mhz == 0));
    assert!(
        log.entries()
            .iter()
            .any(|e| e.contains("WARN") && e.contains("clock speed measurement skipped"))
    );
}

struct Failing;

#[async_trait]
impl InformationProvider for Failing {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn is_applicable(&self, _: &MachineProfile, _: &ProbeContext) -> bool {
        true
    }

    async fn gather_per_processor(
        &self,
        _: &ProbeContext,
        _: usize,
        _: &mut MachineProfile,
    ) -> Result<(), ProbeError> {
        Err(ProbeError::Unsupported("no sensors".into()))
    }
}

#[tokio::test]
async fn failing_driver_is_logged_and_skipped() {
    let log = LogManager::new();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(log.clone()));

    let gatherer = Gatherer::builder()
        .providers(vec![
            Arc::new(Failing),
            Arc::new(CommonProvider),
            Arc::new(IntelProvider),
        ])
        .cpuid(Arc::new(legacy_intel()))
        .logical_cores(8)
        .runner(PinnedRunner::unpinned())
        .cache(Arc::new(ProfileCache::new()))
        .build();
    let profile = gatherer.discover(&DiscoveryOptions::default()).await;

    assert_eq!(profile.cpus[0].physical_cores, 4);
    let entries = log.entries();
    assert!(entries.iter().any(|e| e.contains("ERROR")
        && e.contains("driver failing failed during per-processor: unsupported: no sensors")));
    assert!(entries.iter().any(|e| e.contains("INFO :: gathering driver=intel")));
}

#[cfg(target_os = "linux")]
fn write(root: &std::path::Path, relative: &str, content: &str) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// Four processors in cpuinfo, two NUMA nodes and two identical cards.
#[cfg(target_os = "linux")]
fn sysfs_fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let cpuinfo: String = (0..4)
        .map(|i| {
            format!(
                "processor\t: {i}\nvendor_id\t: GenuineIntel\n\
                 model name\t: Intel(R) Xeon(R) Gold 6230 CPU @ 2.10GHz\ncpu MHz\t\t: 2100.000\n\n"
            )
        })
        .collect();
    write(root, "proc/cpuinfo", &cpuinfo);
    write(root, "sys/devices/system/node/node0/cpulist", "0-1\n");
    write(root, "sys/devices/system/node/node1/cpulist", "2-3\n");
    for (card, slot) in [("card0", "0000:3b:00.0"), ("card1", "0000:5e:00.0")] {
        write(root, &format!("sys/class/drm/{card}/device/vendor"), "0x10de\n");
        write(root, &format!("sys/class/drm/{card}/device/device"), "0x1eb8\n");
        write(
            root,
            &format!("sys/class/drm/{card}/device/uevent"),
            &format!("DRIVER=nvidia\nPCI_SLOT_NAME={slot}\n"),
        );
    }
    dir
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn platform_source_joins_the_vendor_drivers() {
    let mut cpuid = RecordedCpuid::new()
        .leaf(0, 0, vendor_leaf(0xB, b"GenuineIntel"))
        .leaf(1, 0, Registers::new(0x0005_0657, 4 << 16, 0, HTT))
        .leaf(0xB, 0, Registers::new(1, 2, 1 << 8, 0))
        .leaf(0xB, 1, Registers::new(3, 8, (2 << 8) | 1, 0));
    for core in 0..2 {
        cpuid = cpuid.core_leaf(core, 0xB, 0, Registers::new(1, 2, 1 << 8, core as u32 * 2));
    }
    let dir = sysfs_fixture();

    let profile = Gatherer::builder()
        .providers(vec![
            Arc::new(CommonProvider),
            Arc::new(IntelProvider),
            Arc::new(LinuxProvider::with_root(dir.path())),
        ])
        .cpuid(Arc::new(cpuid))
        .logical_cores(2)
        .runner(PinnedRunner::unpinned())
        .cache(Arc::new(ProfileCache::new()))
        .build()
        .discover(&DiscoveryOptions::default())
        .await;
    let cpu = &profile.cpus[0];

    assert_eq!(cpu.cores.len(), 2);
    assert_eq!(cpu.logical_cores, 2);
    assert_eq!(cpu.name, "Intel(R) Xeon(R) Gold 6230 CPU @ 2.10GHz");
    assert_eq!(cpu.topology_source, TopologySource::ExtendedTopology);
    assert_eq!(cpu.physical_cores, 2);
    assert_eq!(cpu.nodes, 2);
    assert_eq!(cpu.logical_cores_per_node, 1);
    assert!(cpu.cores.iter().all(|c| c.normal_clock_mhz == 2100));

    assert_eq!(profile.gpus.len(), 2);
    assert_ne!(profile.gpus[0].pci_slot, profile.gpus[1].pci_slot);
}
