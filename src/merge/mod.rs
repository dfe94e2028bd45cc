//! Reconciliation of partial profiles into a canonical one.
//!
//! Every field has a declared [`MergePolicy`]. Scalars are first-writer-wins
//! with zero, blank strings and `None` counting as unset, so a driver that ran
//! on a narrower path can fill gaps but never overwrite concrete data.

mod identity;

use crate::models::{
    CacheRecord, CoreRecord, FeatureSet, MachineProfile, Platform, ProbeStage, ProcessorRecord,
    TopologySource, Vendor,
};

pub use identity::{Identity, merge_list};

/// How a source value is folded into a destination value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Source fills the destination only while it is unset.
    FirstWriterWins,
    /// Bitwise OR.
    Union,
    /// The larger value wins.
    MaxWins,
    /// Values are added.
    Sum,
}

/// A value that may be "not known yet".
pub trait Unset {
    fn is_unset(&self) -> bool;
}

/// A field value that can absorb another under a policy.
pub trait Mergeable: Unset {
    fn merge_with(&mut self, src: &Self, policy: MergePolicy);
}

macro_rules! numeric_mergeable {
    ($($ty:ty),*) => {$(
        impl Unset for $ty {
            fn is_unset(&self) -> bool {
                *self == 0
            }
        }

        impl Mergeable for $ty {
            fn merge_with(&mut self, src: &Self, policy: MergePolicy) {
                match policy {
                    MergePolicy::FirstWriterWins => {
                        if self.is_unset() {
                            *self = *src;
                        }
                    }
                    MergePolicy::Union => *self |= *src,
                    MergePolicy::MaxWins => *self = (*self).max(*src),
                    MergePolicy::Sum => *self = self.saturating_add(*src),
                }
            }
        }
    )*};
}

numeric_mergeable!(u32, u64, usize);

impl Unset for str {
    fn is_unset(&self) -> bool {
        self.trim().is_empty()
    }
}

impl Unset for String {
    fn is_unset(&self) -> bool {
        self.as_str().is_unset()
    }
}

impl Mergeable for String {
    fn merge_with(&mut self, src: &Self, _policy: MergePolicy) {
        if self.is_unset() && !src.is_unset() {
            self.clone_from(src);
        }
    }
}

impl Unset for bool {
    fn is_unset(&self) -> bool {
        !*self
    }
}

impl Mergeable for bool {
    fn merge_with(&mut self, src: &Self, _policy: MergePolicy) {
        *self |= *src;
    }
}

impl<T: Clone> Unset for Option<T> {
    fn is_unset(&self) -> bool {
        self.is_none()
    }
}

impl<T: Clone> Mergeable for Option<T> {
    fn merge_with(&mut self, src: &Self, _policy: MergePolicy) {
        if self.is_none() {
            self.clone_from(src);
        }
    }
}

impl Unset for FeatureSet {
    fn is_unset(&self) -> bool {
        self.is_empty()
    }
}

impl Mergeable for FeatureSet {
    fn merge_with(&mut self, src: &Self, policy: MergePolicy) {
        match policy {
            MergePolicy::FirstWriterWins => {
                if self.is_empty() {
                    *self = *src;
                }
            }
            _ => self.union_with(src),
        }
    }
}

impl Unset for ProbeStage {
    fn is_unset(&self) -> bool {
        *self == ProbeStage::Unidentified
    }
}

impl Mergeable for ProbeStage {
    fn merge_with(&mut self, src: &Self, policy: MergePolicy) {
        match policy {
            MergePolicy::MaxWins | MergePolicy::Sum | MergePolicy::Union => {
                *self = (*self).max(*src)
            }
            MergePolicy::FirstWriterWins => {
                if self.is_unset() {
                    *self = *src;
                }
            }
        }
    }
}

macro_rules! enum_first_writer {
    ($($ty:ty => $unset:expr),*) => {$(
        impl Unset for $ty {
            fn is_unset(&self) -> bool {
                *self == $unset
            }
        }

        impl Mergeable for $ty {
            fn merge_with(&mut self, src: &Self, _policy: MergePolicy) {
                if self.is_unset() {
                    *self = *src;
                }
            }
        }
    )*};
}

enum_first_writer!(Vendor => Vendor::Unknown, TopologySource => TopologySource::Unknown);

/// Fields of [`ProcessorRecord`] with their precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorField {
    Vendor,
    VendorKind,
    Name,
    Family,
    Model,
    Stepping,
    MaxStandardLevel,
    MaxExtendedLevel,
    Features,
    PhysicalCores,
    LogicalCores,
    Nodes,
    LogicalCoresPerNode,
    TopologySource,
    Stage,
}

impl ProcessorField {
    pub const ALL: [ProcessorField; 15] = [
        ProcessorField::Vendor,
        ProcessorField::VendorKind,
        ProcessorField::Name,
        ProcessorField::Family,
        ProcessorField::Model,
        ProcessorField::Stepping,
        ProcessorField::MaxStandardLevel,
        ProcessorField::MaxExtendedLevel,
        ProcessorField::Features,
        ProcessorField::PhysicalCores,
        ProcessorField::LogicalCores,
        ProcessorField::Nodes,
        ProcessorField::LogicalCoresPerNode,
        ProcessorField::TopologySource,
        ProcessorField::Stage,
    ];

    pub const fn policy(self) -> MergePolicy {
        match self {
            ProcessorField::Features => MergePolicy::Union,
            ProcessorField::Stage => MergePolicy::MaxWins,
            _ => MergePolicy::FirstWriterWins,
        }
    }

    fn apply(self, dst: &mut ProcessorRecord, src: &ProcessorRecord) {
        let p = self.policy();
        match self {
            ProcessorField::Vendor => dst.vendor.merge_with(&src.vendor, p),
            ProcessorField::VendorKind => dst.vendor_kind.merge_with(&src.vendor_kind, p),
            ProcessorField::Name => dst.name.merge_with(&src.name, p),
            ProcessorField::Family => dst.family.merge_with(&src.family, p),
            ProcessorField::Model => dst.model.merge_with(&src.model, p),
            ProcessorField::Stepping => dst.stepping.merge_with(&src.stepping, p),
            ProcessorField::MaxStandardLevel => {
                dst.max_standard_level.merge_with(&src.max_standard_level, p)
            }
            ProcessorField::MaxExtendedLevel => {
                dst.max_extended_level.merge_with(&src.max_extended_level, p)
            }
            ProcessorField::Features => dst.features.merge_with(&src.features, p),
            ProcessorField::PhysicalCores => dst.physical_cores.merge_with(&src.physical_cores, p),
            ProcessorField::LogicalCores => dst.logical_cores.merge_with(&src.logical_cores, p),
            ProcessorField::Nodes => dst.nodes.merge_with(&src.nodes, p),
            ProcessorField::LogicalCoresPerNode => dst
                .logical_cores_per_node
                .merge_with(&src.logical_cores_per_node, p),
            ProcessorField::TopologySource => {
                dst.topology_source.merge_with(&src.topology_source, p)
            }
            ProcessorField::Stage => dst.stage.merge_with(&src.stage, p),
        }
    }
}

/// Fields of [`CoreRecord`] with their precedence. The index is the identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreField {
    CoreId,
    NodeId,
    ApicId,
    NormalClock,
    MaxClock,
    ReferenceClock,
}

impl CoreField {
    pub const ALL: [CoreField; 6] = [
        CoreField::CoreId,
        CoreField::NodeId,
        CoreField::ApicId,
        CoreField::NormalClock,
        CoreField::MaxClock,
        CoreField::ReferenceClock,
    ];

    pub const fn policy(self) -> MergePolicy {
        MergePolicy::FirstWriterWins
    }

    fn apply(self, dst: &mut CoreRecord, src: &CoreRecord) {
        let p = self.policy();
        match self {
            CoreField::CoreId => dst.core_id.merge_with(&src.core_id, p),
            CoreField::NodeId => dst.node_id.merge_with(&src.node_id, p),
            CoreField::ApicId => dst.apic_id.merge_with(&src.apic_id, p),
            CoreField::NormalClock => dst.normal_clock_mhz.merge_with(&src.normal_clock_mhz, p),
            CoreField::MaxClock => dst.max_clock_mhz.merge_with(&src.max_clock_mhz, p),
            CoreField::ReferenceClock => dst
                .reference_clock_mhz
                .merge_with(&src.reference_clock_mhz, p),
        }
    }
}

/// Fields of [`CacheRecord`] outside its canonical key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheField {
    LineSize,
    Associativity,
    Partitions,
    Sets,
    Wbinvd,
    SharedBy,
    TimesObserved,
}

impl CacheField {
    pub const ALL: [CacheField; 7] = [
        CacheField::LineSize,
        CacheField::Associativity,
        CacheField::Partitions,
        CacheField::Sets,
        CacheField::Wbinvd,
        CacheField::SharedBy,
        CacheField::TimesObserved,
    ];

    pub const fn policy(self) -> MergePolicy {
        match self {
            CacheField::Wbinvd => MergePolicy::Union,
            CacheField::TimesObserved => MergePolicy::Sum,
            _ => MergePolicy::FirstWriterWins,
        }
    }

    fn apply(self, dst: &mut CacheRecord, src: &CacheRecord) {
        let p = self.policy();
        match self {
            CacheField::LineSize => dst.line_size.merge_with(&src.line_size, p),
            CacheField::Associativity => dst.associativity.merge_with(&src.associativity, p),
            CacheField::Partitions => dst.partitions.merge_with(&src.partitions, p),
            CacheField::Sets => dst.sets.merge_with(&src.sets, p),
            CacheField::Wbinvd => dst.wbinvd.merge_with(&src.wbinvd, p),
            CacheField::SharedBy => dst.shared_by.merge_with(&src.shared_by, p),
            CacheField::TimesObserved => dst.times_observed.merge_with(&src.times_observed, p),
        }
    }
}

/// Folds one processor record into another.
pub fn reconcile_processor(dst: &mut ProcessorRecord, src: &ProcessorRecord) {
    reconcile_fields(dst, src, &ProcessorField::ALL);
    for core in &src.cores {
        reconcile_core(dst.core_mut(core.index), core);
    }
    merge_list(&mut dst.caches, &src.caches);
}

/// Folds only `fields` of `src`, each under its own policy.
pub fn reconcile_fields(
    dst: &mut ProcessorRecord,
    src: &ProcessorRecord,
    fields: &[ProcessorField],
) {
    for field in fields {
        field.apply(dst, src);
    }
}

pub fn reconcile_core(dst: &mut CoreRecord, src: &CoreRecord) {
    for field in CoreField::ALL {
        field.apply(dst, src);
    }
}

pub fn reconcile_cache(dst: &mut CacheRecord, src: &CacheRecord) {
    for field in CacheField::ALL {
        field.apply(dst, src);
    }
}

fn reconcile_platform(dst: &mut Platform, src: &Platform) {
    let p = MergePolicy::FirstWriterWins;
    dst.os.merge_with(&src.os, p);
    dst.arch.merge_with(&src.arch, p);
    dst.pointer_width.merge_with(&src.pointer_width, p);
}

/// Folds a partial `src` profile into the canonical `dst`.
///
/// Processors pair up by position, everything else by identity. Nothing
/// present on either side is dropped.
pub fn reconcile(dst: &mut MachineProfile, src: &MachineProfile) {
    reconcile_platform(&mut dst.platform, &src.platform);
    for (index, cpu) in src.cpus.iter().enumerate() {
        reconcile_processor(dst.cpu_mut(index), cpu);
    }
    merge_list(&mut dst.gpus, &src.gpus);
    merge_list(&mut dst.disks, &src.disks);
    merge_list(&mut dst.displays, &src.displays);
    merge_list(&mut dst.ram_sticks, &src.ram_sticks);
}
