use serde::{Deserialize, Serialize};

use crate::models::cpu::ProcessorRecord;
use crate::models::devices::{DiskRecord, DisplayRecord, GpuRecord, RamRecord};

/// Identification of the platform the profile was taken on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub arch: String,
    pub pointer_width: u32,
}

impl Platform {
    pub fn current() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            pointer_width: usize::BITS,
        }
    }

    pub fn is_x86(&self) -> bool {
        self.arch == "x86" || self.arch == "x86_64"
    }
}

/// Everything discovered about the machine in one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineProfile {
    pub platform: Platform,
    pub cpus: Vec<ProcessorRecord>,
    #[serde(default)]
    pub gpus: Vec<GpuRecord>,
    #[serde(default)]
    pub disks: Vec<DiskRecord>,
    #[serde(default)]
    pub displays: Vec<DisplayRecord>,
    #[serde(default)]
    pub ram_sticks: Vec<RamRecord>,
}

impl MachineProfile {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            ..Default::default()
        }
    }

    /// Returns the processor at `index`, creating empty records up to it.
    pub fn cpu_mut(&mut self, index: usize) -> &mut ProcessorRecord {
        while self.cpus.len() <= index {
            self.cpus.push(ProcessorRecord::default());
        }
        &mut self.cpus[index]
    }

    pub fn total_logical_cores(&self) -> usize {
        self.cpus.iter().map(|c| c.cores.len()).sum()
    }
}
