/*
 * SPDX-FileCopyrightText: 2020 Stalwart Labs Ltd <hello@stalw.art>
 *
 * SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-SEL
 */

use backup_engine::{
    artifact::{BackupArtifact, CollectionDataset, DocumentDataset, DocumentRecord},
    compression::CompressionLevel,
    BackupTier, CompressionType,
};
use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

fn sample_artifact(documents: usize) -> BackupArtifact {
    let bins: CollectionDataset = (0..documents)
        .map(|i| {
            let fields = json!({
                "fill": i % 100,
                "zone": format!("zone-{}", i % 12),
                "lastPickup": "2026-10-01T06:30:00Z",
                "sensors": {"temperature": 21.5, "battery": 87}
            });
            (
                format!("bin-{:06}", i),
                DocumentRecord {
                    fields: fields.as_object().cloned().unwrap_or_default(),
                    create_time: Some(Utc::now()),
                    update_time: Some(Utc::now()),
                },
            )
        })
        .collect();

    let mut dataset = DocumentDataset::new();
    dataset.insert("bins".to_string(), bins);
    BackupArtifact::new(
        BackupTier::Manual,
        Utc::now(),
        Some(dataset),
        Some(json!({"status": "ok", "routes": {"north": [1, 2, 3]}})),
    )
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("artifact_serialization");

    for size in [100, 1_000, 10_000] {
        let artifact = sample_artifact(size);
        let bytes = artifact.to_json_bytes().unwrap_or_default();

        group.bench_with_input(BenchmarkId::new("encode", size), &artifact, |b, artifact| {
            b.iter(|| black_box(artifact.to_json_bytes()))
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &bytes, |b, bytes| {
            b.iter(|| black_box(BackupArtifact::from_json_bytes(bytes)))
        });
    }

    group.finish();
}

fn bench_compression(c: &mut Criterion) {
    let mut group = c.benchmark_group("artifact_compression");
    let bytes = sample_artifact(5_000).to_json_bytes().unwrap_or_default();

    for compression in [CompressionType::Gzip, CompressionType::Zstd, CompressionType::Lz4] {
        let name = format!("{:?}", compression);
        group.bench_with_input(BenchmarkId::new("compress", &name), &bytes, |b, bytes| {
            b.iter(|| black_box(compression.compress(bytes, CompressionLevel::Balanced)))
        });

        let compressed = compression
            .compress(&bytes, CompressionLevel::Balanced)
            .unwrap_or_default();
        group.bench_with_input(
            BenchmarkId::new("decompress", &name),
            &compressed,
            |b, compressed| b.iter(|| black_box(compression.decompress(compressed))),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_serialization, bench_compression);
criterion_main!(benches);
