use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::affinity;
use crate::opcode::{Cpuid, Registers};

/// One captured leaf. `core` is `None` for leaves that read the same on every core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafEntry {
    #[serde(default)]
    pub core: Option<usize>,
    pub leaf: u32,
    #[serde(default)]
    pub subleaf: u32,
    #[serde(flatten)]
    pub registers: Registers,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Dump {
    #[serde(default)]
    tsc_mhz: Option<u64>,
    entries: Vec<LeafEntry>,
}

/// Identification answered from a captured table instead of the hardware.
///
/// Per-core entries are looked up for the core the calling thread has been
/// pinned to by [`crate::affinity::PinnedRunner`]; anything missing reads as
/// all zeroes, the way real parts answer reserved leaves.
#[derive(Debug, Clone)]
pub struct RecordedCpuid {
    leaves: BTreeMap<(Option<usize>, u32, u32), Registers>,
    tsc_mhz: Option<u64>,
    started: Instant,
}

impl Default for RecordedCpuid {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordedCpuid {
    pub fn new() -> Self {
        Self {
            leaves: BTreeMap::new(),
            tsc_mhz: None,
            started: Instant::now(),
        }
    }

    /// Leaf that answers identically on every core.
    pub fn leaf(mut self, leaf: u32, subleaf: u32, registers: Registers) -> Self {
        self.leaves.insert((None, leaf, subleaf), registers);
        self
    }

    /// Leaf that answers differently on `core`.
    pub fn core_leaf(mut self, core: usize, leaf: u32, subleaf: u32, registers: Registers) -> Self {
        self.leaves.insert((Some(core), leaf, subleaf), registers);
        self
    }

    /// Emulates a time-stamp counter ticking at `mhz`.
    pub fn with_tsc_mhz(mut self, mhz: u64) -> Self {
        self.tsc_mhz = Some(mhz);
        self
    }

    /// Number of cores the capture has per-core entries for.
    pub fn core_count(&self) -> Option<usize> {
        self.leaves.keys().filter_map(|(core, _, _)| *core).max().map(|c| c + 1)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let dump: Dump = serde_json::from_str(json)?;
        let mut recorded = Self::new();
        recorded.tsc_mhz = dump.tsc_mhz;
        for entry in dump.entries {
            recorded
                .leaves
                .insert((entry.core, entry.leaf, entry.subleaf), entry.registers);
        }
        Ok(recorded)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let dump = Dump {
            tsc_mhz: self.tsc_mhz,
            entries: self
                .leaves
                .iter()
                .map(|(&(core, leaf, subleaf), &registers)| LeafEntry {
                    core,
                    leaf,
                    subleaf,
                    registers,
                })
                .collect(),
        };
        serde_json::to_string_pretty(&dump)
    }
}

impl Cpuid for RecordedCpuid {
    fn cpuid(&self, leaf: u32, subleaf: u32) -> Registers {
        affinity::current_core()
            .and_then(|core| self.leaves.get(&(Some(core), leaf, subleaf)))
            .or_else(|| self.leaves.get(&(None, leaf, subleaf)))
            .copied()
            .unwrap_or_default()
    }

    fn cycle_count(&self) -> Option<u64> {
        let mhz = self.tsc_mhz?;
        let nanos = self.started.elapsed().as_nanos() as u64;
        Some(nanos.saturating_mul(mhz) / 1000)
    }
}
