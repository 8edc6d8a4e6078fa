//! Benchmarks for exec buffer and command round trips.
//!
//! Run with: cargo bench -p accel_sched --bench command_ops

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use accel_sched::{
    ArgValue, CommandState, Device, ExecBufferPool, Kernel, Opcode, Run, Runtime, SchedConfig,
    SimDevice,
};

fn bench_exec_buffer_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("exec_buffer_pool");
    let device: Arc<dyn Device> = Arc::new(SimDevice::new(0, 1));

    for size in [1024usize, 4096, 16384].iter() {
        let pool = ExecBufferPool::new(*size);
        // Warm the free list so iterations measure reuse.
        let warm = pool.acquire(&device).unwrap();
        pool.release(warm);

        group.bench_with_input(BenchmarkId::new("acquire_release", size), size, |bench, _| {
            bench.iter(|| {
                let buffer = pool.acquire(&device).unwrap();
                black_box(buffer.handle());
                pool.release(buffer);
            })
        });
    }

    group.finish();
}

fn bench_command_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("command_round_trip");

    for (name, config) in [
        ("sws", SchedConfig::default()),
        ("kds", SchedConfig::default().with_kds(true)),
        ("mbs", SchedConfig::default().with_ert(true)),
    ] {
        let runtime = Runtime::new(config).unwrap();
        let device: Arc<dyn Device> = Arc::new(SimDevice::new(0, 4));
        runtime.init_device(&device).unwrap();

        let cmd = runtime.command(&device, Opcode::StartCu).unwrap();
        cmd.set_cu_mask(&[0, 1, 2, 3]).unwrap();
        cmd.set_payload_len(17).unwrap();

        group.bench_function(BenchmarkId::new("run_wait", name), |bench| {
            bench.iter(|| {
                cmd.run().unwrap();
                let state = cmd.wait(None).unwrap();
                assert_eq!(state, CommandState::Completed);
                black_box(state)
            })
        });

        drop(cmd);
        runtime.shutdown().unwrap();
    }

    group.finish();
}

fn bench_kernel_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("kernel_run");

    let runtime = Runtime::new(SchedConfig::default()).unwrap();
    let sim = Arc::new(SimDevice::new(0, 2));
    let device: Arc<dyn Device> = sim.clone();
    runtime.init_device(&device).unwrap();
    let kernel = Kernel::open(&runtime, &device, &sim.uuid(), "vadd", accel_sched::AccessMode::Shared).unwrap();
    let run = Run::new(&kernel).unwrap();

    group.bench_function("set_args", |bench| {
        bench.iter(|| {
            run.set_arg(0, ArgValue::Buffer(black_box(0x1000))).unwrap();
            run.set_arg(1, ArgValue::Buffer(black_box(0x2000))).unwrap();
            run.set_arg(2, ArgValue::Buffer(black_box(0x3000))).unwrap();
            run.set_arg(3, ArgValue::Scalar(&black_box(256u32).to_le_bytes())).unwrap();
        })
    });

    group.bench_function("start_wait", |bench| {
        bench.iter(|| {
            run.start().unwrap();
            black_box(run.wait(None).unwrap())
        })
    });

    group.finish();
    drop(run);
    drop(kernel);
    runtime.shutdown().unwrap();
}

criterion_group!(
    benches,
    bench_exec_buffer_pool,
    bench_command_round_trip,
    bench_kernel_run,
);

criterion_main!(benches);
