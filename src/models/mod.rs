/// Cache descriptors and the observation tally
pub mod cache;
/// Processor and logical core records
pub mod cpu;
/// Records handed in by non-CPU collaborators
pub mod devices;
/// Named feature bitmasks
pub mod flags;
/// Whole-machine profile
pub mod machine;

pub use cache::{CacheKey, CacheKind, CacheLevel, CacheRecord, FULLY_ASSOCIATIVE};
pub use cpu::{CoreRecord, ProbeStage, ProcessorRecord, TopologySource, Vendor};
pub use devices::{DiskRecord, DisplayRecord, GpuRecord, RamRecord};
pub use flags::FeatureSet;
pub use machine::{MachineProfile, Platform};
