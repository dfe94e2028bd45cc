//! Identity rules for list-valued fields.

use tracing::debug;

use super::{Mergeable, MergePolicy, Unset, reconcile_cache};
use crate::models::{CacheRecord, DiskRecord, DisplayRecord, GpuRecord, RamRecord};

/// An entity that can be recognized across two profiles and field-merged.
pub trait Identity {
    /// Whether `self` and `other` describe the same physical thing.
    fn same_entity(&self, other: &Self) -> bool;

    /// Folds `src` into `self` with the scalar rules.
    fn absorb(&mut self, src: &Self);
}

/// Merges `src` into `dst` by identity. Entities seen on one side only are
/// carried over as they are.
///
/// Matching is one-to-one: each entry already in `dst` absorbs at most one
/// `src` item, and items appended by this call are never matched again, so
/// two identical devices listed by the same source stay two entries.
pub fn merge_list<T: Identity + Clone>(dst: &mut Vec<T>, src: &[T]) {
    let existing = dst.len();
    let mut consumed = vec![false; existing];
    for item in src {
        let matched = (0..existing).find(|&i| !consumed[i] && dst[i].same_entity(item));
        match matched {
            Some(i) => {
                consumed[i] = true;
                dst[i].absorb(item);
            }
            None => dst.push(item.clone()),
        }
    }
}

fn both_set(a: &str, b: &str) -> bool {
    !a.is_unset() && !b.is_unset()
}

fn same_text(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// Compares a composite fallback key, refusing to match two blank keys.
fn same_pair(a: (&str, &str), b: (&str, &str)) -> bool {
    let blank = |(x, y): (&str, &str)| x.is_unset() && y.is_unset();
    !blank(a) && !blank(b) && same_text(a.0, b.0) && same_text(a.1, b.1)
}

impl Identity for CacheRecord {
    fn same_entity(&self, other: &Self) -> bool {
        if self.key() != other.key() || !self.compatible_sharing(other) {
            return false;
        }
        if !self.same_structure(other) {
            debug!(
                level = ?self.level,
                kind = ?self.kind,
                "merging caches with matching key but different layout"
            );
        }
        true
    }

    fn absorb(&mut self, src: &Self) {
        reconcile_cache(self, src);
    }
}

impl GpuRecord {
    /// Caption, or the name when no caption was reported.
    fn label(&self) -> &str {
        if self.caption.is_unset() {
            &self.name
        } else {
            &self.caption
        }
    }
}

impl Identity for GpuRecord {
    fn same_entity(&self, other: &Self) -> bool {
        if self.has_device_identifier() && other.has_device_identifier() {
            let same_slot = !both_set(&self.pci_slot, &other.pci_slot)
                || same_text(&self.pci_slot, &other.pci_slot);
            return self.vendor_id == other.vendor_id
                && self.device_id == other.device_id
                && same_slot;
        }
        let (a, b) = (self.vendor_key(), other.vendor_key());
        same_pair((a.as_str(), self.label()), (b.as_str(), other.label()))
    }

    fn absorb(&mut self, src: &Self) {
        let p = MergePolicy::FirstWriterWins;
        self.name.merge_with(&src.name, p);
        self.vendor.merge_with(&src.vendor, p);
        self.vendor_id.merge_with(&src.vendor_id, p);
        self.device_id.merge_with(&src.device_id, p);
        self.caption.merge_with(&src.caption, p);
        self.pci_slot.merge_with(&src.pci_slot, p);
        self.driver_version.merge_with(&src.driver_version, p);
        self.memory_total.merge_with(&src.memory_total, p);
        self.refresh_identity();
    }
}

impl Identity for DiskRecord {
    fn same_entity(&self, other: &Self) -> bool {
        if both_set(&self.serial, &other.serial) {
            return same_text(&self.serial, &other.serial);
        }
        same_pair(
            (&self.model, &self.caption),
            (&other.model, &other.caption),
        )
    }

    fn absorb(&mut self, src: &Self) {
        let p = MergePolicy::FirstWriterWins;
        self.name.merge_with(&src.name, p);
        self.model.merge_with(&src.model, p);
        self.serial.merge_with(&src.serial, p);
        self.caption.merge_with(&src.caption, p);
        self.size.merge_with(&src.size, p);
    }
}

impl Identity for DisplayRecord {
    fn same_entity(&self, other: &Self) -> bool {
        if both_set(&self.product_code, &other.product_code) {
            return same_pair(
                (&self.manufacturer, &self.product_code),
                (&other.manufacturer, &other.product_code),
            );
        }
        same_pair((&self.name, &self.caption), (&other.name, &other.caption))
    }

    fn absorb(&mut self, src: &Self) {
        let p = MergePolicy::FirstWriterWins;
        self.name.merge_with(&src.name, p);
        self.manufacturer.merge_with(&src.manufacturer, p);
        self.product_code.merge_with(&src.product_code, p);
        self.caption.merge_with(&src.caption, p);
        self.width.merge_with(&src.width, p);
        self.height.merge_with(&src.height, p);
        self.refresh_rate.merge_with(&src.refresh_rate, p);
    }
}

impl Identity for RamRecord {
    fn same_entity(&self, other: &Self) -> bool {
        if both_set(&self.serial, &other.serial) {
            return same_text(&self.serial, &other.serial);
        }
        both_set(&self.bank_label, &other.bank_label)
            && same_text(&self.bank_label, &other.bank_label)
    }

    fn absorb(&mut self, src: &Self) {
        let p = MergePolicy::FirstWriterWins;
        self.bank_label.merge_with(&src.bank_label, p);
        self.serial.merge_with(&src.serial, p);
        self.part_number.merge_with(&src.part_number, p);
        self.capacity.merge_with(&src.capacity, p);
        self.speed_mhz.merge_with(&src.speed_mhz, p);
    }
}
