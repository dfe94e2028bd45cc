//! Linux platform source: procfs and sysfs.
//!
//! Everything read here lands in a partial profile that is reconciled into
//! the canonical one, so values decoded from the processor itself take
//! precedence wherever both exist.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::{InformationProvider, ProbeContext};
use crate::error::ProbeError;
use crate::merge;
use crate::models::devices::gpu_vendor_name;
use crate::models::{DiskRecord, GpuRecord, MachineProfile, ProcessorRecord, Vendor};

static CPUINFO_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^:]+?)\s*:\s*(.*?)\s*$").expect("valid cpuinfo regex"));
static NODE_DIR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^node\d+$").expect("valid node regex"));
static CARD_DIR: Lazy<Regex> = Lazy::new(|| Regex::new(r"^card\d+$").expect("valid card regex"));

/// Block devices that are not disks.
const VIRTUAL_BLOCK_PREFIXES: &[&str] = &["loop", "ram", "zram", "dm-", "sr", "md"];

/// `/proc/cpuinfo` split into one key/value map per logical processor.
pub fn parse_cpuinfo(content: &str) -> Vec<BTreeMap<String, String>> {
    let mut blocks: Vec<BTreeMap<String, String>> = Vec::new();
    for line in content.lines() {
        let Some(caps) = CPUINFO_LINE.captures(line) else {
            continue;
        };
        let key = caps[1].trim().to_string();
        if key == "processor" || blocks.is_empty() {
            blocks.push(BTreeMap::new());
        }
        if let Some(block) = blocks.last_mut() {
            block.insert(key, caps[2].to_string());
        }
    }
    blocks
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn read_u64(path: &Path) -> Option<u64> {
    read_trimmed(path)?.parse().ok()
}

fn read_hex(path: &Path) -> Option<u32> {
    let raw = read_trimmed(path)?;
    u32::from_str_radix(raw.trim_start_matches("0x"), 16).ok()
}

/// Sorted entry names of `dir` matching `pattern`.
fn matching_entries(dir: &Path, pattern: &Regex) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter_map(|e| e.file_name().into_string().ok())
                .filter(|name| pattern.is_match(name))
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Reads procfs/sysfs under a configurable root.
pub struct LinuxProvider {
    root: PathBuf,
}

impl Default for LinuxProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxProvider {
    pub fn new() -> Self {
        Self::with_root("/")
    }

    /// Reads from a directory tree laid out like `/`, for fixtures.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Processor fields from `/proc/cpuinfo` and cpufreq.
    ///
    /// Only the first `logical` cores are described; cpuinfo blocks for
    /// processors outside the affinity mask are read for the name and vendor
    /// only. The package core count is only taken when the processor could not
    /// be asked directly.
    fn read_processor(
        &self,
        logical: usize,
        with_core_count: bool,
    ) -> Result<ProcessorRecord, ProbeError> {
        let mut cpu = ProcessorRecord::with_cores(logical);

        for core in &mut cpu.cores {
            let freq = self.path(&format!("sys/devices/system/cpu/cpu{}/cpufreq", core.index));
            if let Some(khz) = read_u64(&freq.join("base_frequency")) {
                core.normal_clock_mhz = (khz / 1000) as u32;
            }
            if let Some(khz) = read_u64(&freq.join("cpuinfo_max_freq")) {
                core.max_clock_mhz = (khz / 1000) as u32;
            }
        }

        let nodes = matching_entries(&self.path("sys/devices/system/node"), &NODE_DIR).len();
        cpu.nodes = nodes as u32;

        let cpuinfo_path = self.path("proc/cpuinfo");
        let content = fs::read_to_string(&cpuinfo_path).map_err(|source| ProbeError::Io {
            path: cpuinfo_path.display().to_string(),
            source,
        })?;
        for block in parse_cpuinfo(&content) {
            if cpu.name.is_empty() {
                if let Some(name) = block.get("model name") {
                    cpu.name = name.clone();
                }
            }
            if cpu.vendor.is_empty() {
                if let Some(vendor) = block.get("vendor_id") {
                    cpu.vendor = vendor.clone();
                    cpu.vendor_kind = Vendor::from_signature(vendor);
                }
            }
            if with_core_count && cpu.physical_cores == 0 {
                if let Some(cores) = block.get("cpu cores").and_then(|c| c.parse().ok()) {
                    cpu.physical_cores = cores;
                }
            }
            let index = block.get("processor").and_then(|p| p.parse::<usize>().ok());
            let mhz = block.get("cpu MHz").and_then(|m| m.parse::<f64>().ok());
            let core = index.and_then(|i| cpu.cores.get_mut(i));
            if let (Some(core), Some(mhz)) = (core, mhz) {
                if core.normal_clock_mhz == 0 {
                    core.normal_clock_mhz = mhz.round() as u32;
                }
            }
        }
        Ok(cpu)
    }

    /// GPUs bound to a DRM driver.
    fn read_gpus(&self) -> Vec<GpuRecord> {
        let drm = self.path("sys/class/drm");
        matching_entries(&drm, &CARD_DIR)
            .into_iter()
            .map(|card| {
                let device = drm.join(&card).join("device");
                let vendor_id = read_hex(&device.join("vendor")).unwrap_or(0);
                let uevent = read_trimmed(&device.join("uevent")).unwrap_or_default();
                let uevent_value = |key: &str| {
                    uevent
                        .lines()
                        .find_map(|l| l.strip_prefix(key)?.strip_prefix('='))
                        .unwrap_or_default()
                        .to_string()
                };
                let mut gpu = GpuRecord {
                    name: uevent_value("DRIVER"),
                    vendor: gpu_vendor_name(vendor_id).unwrap_or_default().to_string(),
                    vendor_id,
                    device_id: read_hex(&device.join("device")).unwrap_or(0),
                    caption: card,
                    pci_slot: uevent_value("PCI_SLOT_NAME"),
                    ..Default::default()
                };
                gpu.refresh_identity();
                gpu
            })
            .collect()
    }

    /// Physical block devices with their size in bytes.
    fn read_disks(&self) -> Vec<DiskRecord> {
        let block = self.path("sys/block");
        let Ok(entries) = fs::read_dir(&block) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().into_string().ok())
            .filter(|name| !VIRTUAL_BLOCK_PREFIXES.iter().any(|p| name.starts_with(p)))
            .collect();
        names.sort();

        names
            .into_iter()
            .map(|name| {
                let dir = block.join(&name);
                DiskRecord {
                    model: read_trimmed(&dir.join("device/model")).unwrap_or_default(),
                    serial: read_trimmed(&dir.join("device/serial"))
                        .or_else(|| read_trimmed(&dir.join("serial")))
                        .unwrap_or_default(),
                    size: read_u64(&dir.join("size")).unwrap_or(0) * 512,
                    caption: name.clone(),
                    name,
                }
            })
            .collect()
    }
}

#[async_trait]
impl InformationProvider for LinuxProvider {
    fn name(&self) -> &'static str {
        "linux"
    }

    fn is_applicable(&self, _profile: &MachineProfile, _ctx: &ProbeContext) -> bool {
        true
    }

    async fn gather_per_processor(
        &self,
        ctx: &ProbeContext,
        cpu_index: usize,
        profile: &mut MachineProfile,
    ) -> Result<(), ProbeError> {
        let logical = profile.cpu_mut(cpu_index).cores.len();
        let mut partial = MachineProfile::default();

        let processor = self.read_processor(logical, ctx.cpuid.is_none());
        if cpu_index == 0 {
            partial.gpus = self.read_gpus();
            partial.disks = self.read_disks();
            debug!(
                gpus = partial.gpus.len(),
                disks = partial.disks.len(),
                "read platform devices"
            );
        }

        let result = processor.map(|cpu| *partial.cpu_mut(cpu_index) = cpu);
        merge::reconcile(profile, &partial);
        result
    }
}
