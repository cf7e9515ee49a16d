// Criterion microbenchmarks for the block pipeline.
//
// - `decode`: building a fresh block from a page of straight-line code.
// - `dispatch`: running a hot cached loop through `ExecDriver::execute`.
//
// The default profile is short enough for CI. Set `BLOCKVM_BENCH_PROFILE=full` for longer
// local runs.

#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use blockvm_cpu_core::codeblock::{CodeBlockManager, BLOCK_LIMIT};
#[cfg(not(target_arch = "wasm32"))]
use blockvm_cpu_core::exec::{ExecConfig, ExecDriver, Vcpu};
#[cfg(not(target_arch = "wasm32"))]
use blockvm_cpu_core::interrupts::InterruptQueue;
#[cfg(not(target_arch = "wasm32"))]
use blockvm_cpu_core::jit::JitConfig;
#[cfg(not(target_arch = "wasm32"))]
use blockvm_cpu_core::mem::PhysicalMemory;
#[cfg(not(target_arch = "wasm32"))]
use blockvm_cpu_core::state::{CpuState, SegReg, Segment};
#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

#[cfg(not(target_arch = "wasm32"))]
const CODE: u64 = 0x1000;

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("BLOCKVM_BENCH_PROFILE").as_deref() {
        Ok("full") => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
        _ => Criterion::default()
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(20)
            .noise_threshold(0.05),
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_decode(c: &mut Criterion) {
    // inc ax; add ax, bx; xor cx, cx; mov dx, 0x1234
    const PATTERN: &[u8] = &[0x40, 0x01, 0xD8, 0x31, 0xC9, 0xBA, 0x34, 0x12];
    let mut mem = PhysicalMemory::new(0x10000);
    let mut page = Vec::with_capacity(0x1000);
    while page.len() + PATTERN.len() <= 0x1000 {
        page.extend_from_slice(PATTERN);
    }
    mem.load(CODE, &page);

    let mut manager = CodeBlockManager::new(BLOCK_LIMIT, JitConfig::default());
    let count = manager
        .real_mode_code_block_at(&mut mem, CODE)
        .map(|b| b.instruction_count())
        .unwrap_or(0);

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Elements(u64::from(count)));
    group.bench_function("real_mode_block", |b| {
        b.iter(|| {
            let block = manager.real_mode_code_block_at(&mut mem, black_box(CODE));
            black_box(block.is_ok())
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_dispatch(c: &mut Criterion) {
    const BLOCKS: u32 = 1024;

    // l: inc ax; inc bx; jmp l
    let mut mem = PhysicalMemory::new(0x10000);
    mem.load(CODE, &[0x40, 0x43, 0xEB, 0xFC]);
    let mut cpu = CpuState::new();
    cpu.segments[SegReg::Cs as usize] = Segment::real(0);
    cpu.set_eip(CODE as u32);
    let mut vcpu = Vcpu::new(cpu, mem);
    let mut irq = InterruptQueue::default();
    let mut driver = ExecDriver::new(ExecConfig {
        blocks_per_call: BLOCKS,
        ..ExecConfig::default()
    });

    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(u64::from(BLOCKS) * 3));
    group.bench_function("cached_loop", |b| {
        b.iter(|| black_box(driver.execute(&mut vcpu, &mut irq).unwrap_or(0)))
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_decode, bench_dispatch
}

#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
