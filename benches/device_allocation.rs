//! Benchmark for device name allocation
//!
//! Every attach re-reads the live domain XML and scans it for the smallest
//! free `sdX` name, so both steps sit on the publish path.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kvm_csi_driver::agent::topology::{next_free_device, DomainDescription};
use kvm_csi_driver::agent::{AgentConfig, StorageAgent};
use kvm_csi_driver::domain::{Hypervisor, StorageAgentApi, VolumeAttachment};
use kvm_csi_driver::mock::MemoryHypervisor;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn device_names(count: usize) -> Vec<String> {
    (b'a'..=b'z')
        .take(count)
        .map(|letter| format!("sd{}", letter as char))
        .collect()
}

fn domain_xml(rt: &tokio::runtime::Runtime, occupied: usize) -> String {
    let hypervisor = MemoryHypervisor::new();
    let names = device_names(occupied);
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    hypervisor.define_domain("vm-bench", &refs);
    rt.block_on(hypervisor.domain_xml("vm-bench"))
        .expect("domain is defined")
}

fn bench_parse_domain(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("device_allocation");

    for occupied in [1, 12, 25] {
        let xml = domain_xml(&rt, occupied);
        group.bench_with_input(BenchmarkId::new("parse_domain_xml", occupied), &xml, |b, xml| {
            b.iter(|| DomainDescription::parse(black_box(xml)).unwrap());
        });
    }

    group.finish();
}

fn bench_next_free_device(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("device_allocation");

    for occupied in [1, 12, 25, 26] {
        let description = DomainDescription::parse(&domain_xml(&rt, occupied)).unwrap();
        group.bench_with_input(
            BenchmarkId::new("next_free_device", occupied),
            &description,
            |b, description| {
                b.iter(|| next_free_device(black_box(&description.devices.disks)));
            },
        );
    }

    group.finish();
}

fn bench_attach_detach(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let images = tempfile::tempdir().unwrap();
    let hypervisor = Arc::new(MemoryHypervisor::new());
    hypervisor.define_domain("vm-bench", &["sda"]);

    let agent = StorageAgent::new(
        &AgentConfig {
            images_root: images.path().to_path_buf(),
            image_owner: None,
            ..Default::default()
        },
        hypervisor,
        CancellationToken::new(),
    );
    rt.block_on(agent.create_image("pvc-bench", 1 << 30)).unwrap();
    let attachment = VolumeAttachment::new("pvc-bench", "/mnt/pvc-bench", "vm-bench");

    c.bench_function("attach_detach_cycle", |b| {
        b.iter(|| {
            rt.block_on(async {
                let device = agent.attach_volume(&attachment).await.unwrap();
                agent.detach_volume(&attachment).await.unwrap();
                black_box(device)
            })
        });
    });
}

criterion_group!(
    benches,
    bench_parse_domain,
    bench_next_free_device,
    bench_attach_detach,
);
criterion_main!(benches);
