use cpu_topology::merge::reconcile;
use cpu_topology::models::{
    CacheKind, CacheLevel, CacheRecord, GpuRecord, MachineProfile, ProcessorRecord,
};

fn l1_data() -> CacheRecord {
    CacheRecord {
        level: CacheLevel::L1,
        kind: CacheKind::Data,
        line_size: 64,
        associativity: 8,
        partitions: 1,
        sets: 64,
        capacity: 32 * 1024,
        wbinvd: false,
        shared_by: 2,
        times_observed: 1,
    }
}

fn profile_with_cache(cache: CacheRecord) -> MachineProfile {
    MachineProfile {
        cpus: vec![ProcessorRecord {
            caches: vec![cache],
            ..Default::default()
        }],
        ..Default::default()
    }
}

#[test]
fn identical_caches_from_two_passes_merge() {
    let mut dst = profile_with_cache(l1_data());
    reconcile(&mut dst, &profile_with_cache(l1_data()));

    let caches = &dst.cpus[0].caches;
    assert_eq!(caches.len(), 1);
    assert_eq!(caches[0].times_observed, 2);
}

#[test]
fn gpu_found_twice_is_one_entity() {
    let mut dst = MachineProfile {
        gpus: vec![GpuRecord {
            name: "Mesa Driver".into(),
            vendor: "AMD".into(),
            ..Default::default()
        }],
        ..Default::default()
    };
    let src = MachineProfile {
        gpus: vec![GpuRecord {
            name: "Mesa Driver".into(),
            vendor: "AMD".into(),
            vendor_id: 0x1002,
            device_id: 0x744C,
            driver_version: "24.0.5".into(),
            ..Default::default()
        }],
        ..Default::default()
    };
    reconcile(&mut dst, &src);

    assert_eq!(dst.gpus.len(), 1);
    assert_eq!(dst.gpus[0].vendor_id, 0x1002);
    assert_eq!(dst.gpus[0].device_id, 0x744C);
    assert_eq!(dst.gpus[0].driver_version, "24.0.5");

    // a second pass from the identified source changes nothing
    let snapshot = dst.clone();
    reconcile(&mut dst, &src);
    assert_eq!(dst.gpus, snapshot.gpus);
}

#[test]
fn concrete_values_are_first_writer_wins() {
    let mut dst = MachineProfile {
        cpus: vec![ProcessorRecord {
            name: "AMD Ryzen 9 7950X".into(),
            physical_cores: 16,
            ..Default::default()
        }],
        ..Default::default()
    };
    let src = MachineProfile {
        cpus: vec![ProcessorRecord {
            name: "AMD Ryzen 9 7950X 16-Core Processor".into(),
            physical_cores: 32,
            nodes: 1,
            ..Default::default()
        }],
        ..Default::default()
    };
    reconcile(&mut dst, &src);
    assert_eq!(dst.cpus[0].name, "AMD Ryzen 9 7950X");
    assert_eq!(dst.cpus[0].physical_cores, 16);
    assert_eq!(dst.cpus[0].nodes, 1);
}
