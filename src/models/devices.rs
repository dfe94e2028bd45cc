//! Records produced by the non-CPU collaborators. They only need stable
//! identity to be folded into a profile.

use serde::{Deserialize, Serialize};

/// PCI vendor ids the GPU merge understands, with their canonical names.
const GPU_VENDORS: &[(u32, &str)] = &[
    (0x1002, "AMD"),
    (0x10DE, "NVIDIA"),
    (0x8086, "Intel"),
    (0x1AF4, "Red Hat"),
    (0x15AD, "VMware"),
    (0x1234, "QEMU"),
];

/// Canonical vendor name for a PCI vendor id.
pub fn gpu_vendor_name(vendor_id: u32) -> Option<&'static str> {
    GPU_VENDORS
        .iter()
        .find(|(id, _)| *id == vendor_id)
        .map(|(_, name)| *name)
}

/// Recognizes the free-form vendor strings drivers and OS tools report.
pub fn recognize_gpu_vendor(vendor: &str) -> Option<(u32, &'static str)> {
    let lower = vendor.trim().to_lowercase();
    let name = if lower.contains("nvidia") {
        "NVIDIA"
    } else if lower == "amd"
        || lower == "ati"
        || lower.contains("advanced micro devices")
        || lower.starts_with("amd ")
        || lower.starts_with("ati ")
    {
        "AMD"
    } else if lower.contains("intel") {
        "Intel"
    } else if lower.contains("vmware") {
        "VMware"
    } else if lower.contains("red hat") {
        "Red Hat"
    } else if lower.contains("qemu") {
        "QEMU"
    } else {
        return None;
    };
    GPU_VENDORS.iter().find(|(_, n)| *n == name).copied()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuRecord {
    pub name: String,
    pub vendor: String,
    /// PCI vendor id, 0 when unknown.
    pub vendor_id: u32,
    /// PCI device id, 0 when unknown.
    pub device_id: u32,
    pub caption: String,
    /// PCI bus address, tells apart several cards of the same model.
    #[serde(default)]
    pub pci_slot: String,
    pub driver_version: String,
    pub memory_total: u64,
}

impl GpuRecord {
    pub fn has_device_identifier(&self) -> bool {
        self.vendor_id != 0 && self.device_id != 0
    }

    /// Fills the vendor id from a recognized vendor name, or the canonical
    /// vendor name from a known vendor id.
    pub fn refresh_identity(&mut self) {
        if self.vendor_id == 0 {
            if let Some((id, name)) = recognize_gpu_vendor(&self.vendor) {
                self.vendor_id = id;
                self.vendor = name.to_string();
            }
        } else if let Some(name) = gpu_vendor_name(self.vendor_id) {
            self.vendor = name.to_string();
        }
    }

    /// Vendor name normalized for comparison.
    pub fn vendor_key(&self) -> String {
        recognize_gpu_vendor(&self.vendor)
            .map(|(_, name)| name.to_string())
            .or_else(|| gpu_vendor_name(self.vendor_id).map(str::to_string))
            .unwrap_or_else(|| self.vendor.trim().to_lowercase())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskRecord {
    pub name: String,
    pub model: String,
    pub serial: String,
    pub caption: String,
    /// Size in bytes.
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplayRecord {
    pub name: String,
    pub manufacturer: String,
    pub product_code: String,
    pub caption: String,
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RamRecord {
    pub bank_label: String,
    pub serial: String,
    pub part_number: String,
    /// Size in bytes.
    pub capacity: u64,
    pub speed_mhz: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_strings_are_recognized() {
        assert_eq!(recognize_gpu_vendor("AMD"), Some((0x1002, "AMD")));
        assert_eq!(
            recognize_gpu_vendor("Advanced Micro Devices, Inc. [AMD/ATI]"),
            Some((0x1002, "AMD"))
        );
        assert_eq!(recognize_gpu_vendor("NVIDIA Corporation"), Some((0x10DE, "NVIDIA")));
        assert_eq!(recognize_gpu_vendor("Mesa"), None);
    }

    #[test]
    fn refresh_identity_derives_both_directions() {
        let mut by_name = GpuRecord {
            vendor: "nvidia corporation".into(),
            ..Default::default()
        };
        by_name.refresh_identity();
        assert_eq!(by_name.vendor_id, 0x10DE);
        assert_eq!(by_name.vendor, "NVIDIA");

        let mut by_id = GpuRecord {
            vendor_id: 0x8086,
            ..Default::default()
        };
        by_id.refresh_identity();
        assert_eq!(by_id.vendor, "Intel");
    }
}
