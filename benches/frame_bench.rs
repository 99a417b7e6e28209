// Benchmark for per-tick work: trajectory sampling, frame building and checksums
// Run with: cargo bench

use criterion::{criterion_group, criterion_main, Criterion};
use std::collections::BTreeMap;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use limb_rs::command::{CommandBuilder, CommandFrame, Crc32Codec, GainTable, IntegrityCodec};
use limb_rs::motion::TrajectoryPlanner;
use limb_rs::safety::SafetyLimits;
use limb_rs::state_feed::{FeedSnapshot, JointState};
use limb_rs::{JointId, JOINT_COUNT};

fn bench_build_frame(c: &mut Criterion) {
    let mut builder = CommandBuilder::new(Arc::new(Crc32Codec));
    let gains = GainTable::default();
    let hold = [0.1; JOINT_COUNT];
    let active: BTreeMap<_, _> = JointId::all().step_by(2).map(|joint| (joint, 0.25)).collect();
    c.bench_function("build 29-joint frame", |b| {
        b.iter(|| black_box(builder.build(&hold, &active, &gains)));
    });
}

fn bench_checksum(c: &mut Criterion) {
    let mut builder = CommandBuilder::new(Arc::new(Crc32Codec));
    let frame = builder.build_hold(&[0.0; JOINT_COUNT], &GainTable::default());
    let bytes = frame.to_bytes();
    c.bench_function("crc32 over frame payload", |b| {
        b.iter(|| black_box(Crc32Codec.checksum(&frame.payload_bytes())));
    });
    c.bench_function("decode and verify frame", |b| {
        b.iter(|| black_box(CommandFrame::decode(&bytes, &Crc32Codec).is_ok()));
    });
}

fn bench_trajectory_advance(c: &mut Criterion) {
    let snapshot = FeedSnapshot {
        joints: vec![JointState::default(); JOINT_COUNT],
        sequence: 1,
        received_at: None,
    };
    let targets: Vec<_> = JointId::all().map(|joint| (joint, 0.5)).collect();
    let mut planner = TrajectoryPlanner::new(SafetyLimits::default());
    let start = Instant::now();
    let _ = planner.begin(&targets, Duration::from_secs(3600), start, &snapshot);
    let mut offset = 0u64;
    c.bench_function("advance 29 active joints", |b| {
        b.iter(|| {
            offset += 1;
            black_box(planner.advance(start + Duration::from_micros(offset)))
        });
    });
}

criterion_group!(benches, bench_build_frame, bench_checksum, bench_trajectory_advance);
criterion_main!(benches);
