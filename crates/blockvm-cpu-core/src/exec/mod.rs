//! The outer execution loop.
//!
//! [`ExecDriver::execute`] fetches the code block at the current instruction
//! pointer, runs it, and repeats for a bounded number of dispatches. Every
//! [`ExecConfig::quantum`] retired instructions it polls the interrupt source
//! and delivers at most one external interrupt. A guest fault leaves EIP on
//! the faulting instruction and is handed to the mode's exception delivery. A
//! mode switch ends the call so the embedding re-enters in the new mode.

use std::collections::hash_map::Entry;
use std::collections::VecDeque;

use blockvm_x86::DecodeMode;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

use crate::codeblock::{
    BlockExit, CodeBlock, CodeBlockError, CodeBlockManager, Outcome, BLOCK_LIMIT,
};
use crate::exception::CpuExit;
use crate::interrupts::{deliver, deliver_exception, InterruptKind, InterruptSource};
use crate::jit::{JitConfig, JitStats};
use crate::mem::{MemoryBus, PAGE_SIZE};
use crate::state::{CpuMode, CpuState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecConfig {
    /// Block dispatches per [`ExecDriver::execute`] call.
    pub blocks_per_call: u32,
    /// Retired instructions between interrupt/device-poll checkpoints.
    pub quantum: u64,
    pub block_limit: usize,
    /// Cached code blocks kept before the oldest is evicted.
    pub max_cached_blocks: usize,
    pub jit: JitConfig,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            blocks_per_call: 100,
            quantum: 4096,
            block_limit: BLOCK_LIMIT,
            max_cached_blocks: 4096,
            jit: JitConfig::default(),
        }
    }
}

/// Processor state, the bus it runs against, and the sticky exit that stops it.
#[derive(Debug)]
pub struct Vcpu<B> {
    pub cpu: CpuState,
    pub bus: B,
    pub exit: Option<CpuExit>,
}

impl<B: MemoryBus> Vcpu<B> {
    pub fn new(cpu: CpuState, bus: B) -> Self {
        Self {
            cpu,
            bus,
            exit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("no factory capable of producing a {mode:?} code block at {address:#x}")]
    FactoryExhausted { mode: CpuMode, address: u64 },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExecStats {
    pub blocks: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub faults_delivered: u64,
    pub interrupts_delivered: u64,
    pub mode_switches: u64,
    pub quantum_boundaries: u64,
    pub invalidated_blocks: u64,
    pub evicted_blocks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BlockKey {
    linear: u64,
    mode: CpuMode,
    bitness: u32,
}

/// What a single dispatch did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Block {
        entry_linear: u64,
        outcome: Outcome,
        retired: u32,
    },
    /// The CPU is halted and no interrupt woke it.
    Idle,
    Exited(CpuExit),
}

pub struct ExecDriver {
    config: ExecConfig,
    manager: CodeBlockManager,
    blocks: FxHashMap<BlockKey, CodeBlock>,
    /// Insertion order of `blocks`, oldest first.
    order: VecDeque<BlockKey>,
    /// Pages holding bytes of at least one cached block.
    code_pages: FxHashSet<u64>,
    writes: Vec<(u64, u64)>,
    quantum_count: u64,
    total: u64,
    stats: ExecStats,
}

impl ExecDriver {
    pub fn new(config: ExecConfig) -> Self {
        let manager = CodeBlockManager::new(config.block_limit, config.jit);
        Self::with_manager(config, manager)
    }

    pub fn with_manager(config: ExecConfig, manager: CodeBlockManager) -> Self {
        Self {
            config,
            manager,
            blocks: FxHashMap::default(),
            order: VecDeque::new(),
            code_pages: FxHashSet::default(),
            writes: Vec::new(),
            quantum_count: 0,
            total: 0,
            stats: ExecStats::default(),
        }
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    pub fn manager(&self) -> &CodeBlockManager {
        &self.manager
    }

    pub fn manager_mut(&mut self) -> &mut CodeBlockManager {
        &mut self.manager
    }

    pub fn stats(&self) -> ExecStats {
        self.stats
    }

    /// Instructions retired over the driver's lifetime.
    pub fn total_instructions(&self) -> u64 {
        self.total
    }

    pub fn cached_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn flush(&mut self) {
        self.blocks.clear();
        self.order.clear();
        self.code_pages.clear();
    }

    pub fn jit_stats(&self) -> Option<JitStats> {
        self.manager.artifacts().map(|a| a.borrow().stats())
    }

    /// Wait for every outstanding compilation and retire the interpreted
    /// blocks they replace.
    pub fn jit_wait_idle(&mut self) {
        if let Some(artifacts) = self.manager.artifacts() {
            artifacts.borrow_mut().wait_idle();
        }
        self.retire_compiled();
    }

    /// Run up to `blocks_per_call` blocks in the current processor mode.
    ///
    /// Returns the number of instructions retired. Stops early on a mode
    /// switch, a halted CPU with nothing to wake it, or a sticky exit.
    pub fn execute<B: MemoryBus>(
        &mut self,
        vcpu: &mut Vcpu<B>,
        irq: &mut dyn InterruptSource,
    ) -> Result<u64, ExecError> {
        match vcpu.cpu.mode() {
            CpuMode::Real => self.execute_mode(vcpu, irq, CpuMode::Real),
            CpuMode::Protected => self.execute_mode(vcpu, irq, CpuMode::Protected),
            CpuMode::Virtual8086 => self.execute_mode(vcpu, irq, CpuMode::Virtual8086),
        }
    }

    fn execute_mode<B: MemoryBus>(
        &mut self,
        vcpu: &mut Vcpu<B>,
        irq: &mut dyn InterruptSource,
        mode: CpuMode,
    ) -> Result<u64, ExecError> {
        let mut executed = 0u64;
        for _ in 0..self.config.blocks_per_call {
            match self.step(vcpu, irq)? {
                StepOutcome::Block { outcome, retired, .. } => {
                    executed += retired as u64;
                    if outcome == Outcome::ModeSwitch {
                        self.stats.mode_switches += 1;
                        break;
                    }
                }
                StepOutcome::Idle | StepOutcome::Exited(_) => break,
            }
            if vcpu.cpu.mode() != mode {
                // Exception or interrupt delivery moved the CPU out of this mode.
                self.stats.mode_switches += 1;
                break;
            }
        }
        Ok(executed)
    }

    /// Dispatch exactly one block, then service faults, writes and the
    /// quantum boundary.
    pub fn step<B: MemoryBus>(
        &mut self,
        vcpu: &mut Vcpu<B>,
        irq: &mut dyn InterruptSource,
    ) -> Result<StepOutcome, ExecError> {
        if let Some(exit) = vcpu.exit {
            return Ok(StepOutcome::Exited(exit));
        }
        if vcpu.cpu.halted {
            // Nothing retires while halted; skip ahead to the next checkpoint.
            self.quantum_boundary(vcpu, irq);
            if vcpu.cpu.halted {
                return Ok(match vcpu.exit {
                    Some(exit) => StepOutcome::Exited(exit),
                    None => StepOutcome::Idle,
                });
            }
        }

        let entry_linear = vcpu.cpu.code_linear();
        let exit = self.run_block(vcpu)?;
        self.stats.blocks += 1;
        self.total += exit.retired as u64;
        self.quantum_count += exit.retired as u64;

        self.sync_modified_regions(&mut vcpu.bus);
        if exit.outcome == Outcome::Fault {
            self.deliver_pending_fault(vcpu);
        }
        if self.quantum_count >= self.config.quantum {
            self.quantum_boundary(vcpu, irq);
        }

        Ok(match vcpu.exit {
            Some(stop) => StepOutcome::Exited(stop),
            None => StepOutcome::Block {
                entry_linear,
                outcome: exit.outcome,
                retired: exit.retired,
            },
        })
    }

    fn run_block<B: MemoryBus>(&mut self, vcpu: &mut Vcpu<B>) -> Result<BlockExit, ExecError> {
        let mode = vcpu.cpu.mode();
        let key = BlockKey {
            linear: vcpu.cpu.code_linear(),
            mode,
            bitness: vcpu.cpu.bitness(),
        };
        let entry_eip = vcpu.cpu.eip();

        let (block, fresh) = match self.blocks.entry(key) {
            Entry::Occupied(e) => {
                self.stats.cache_hits += 1;
                (e.into_mut(), false)
            }
            Entry::Vacant(e) => {
                self.stats.cache_misses += 1;
                match fetch(&mut self.manager, &mut vcpu.bus, key) {
                    Ok(block) => {
                        self.order.push_back(key);
                        (e.insert(block), true)
                    }
                    Err(CodeBlockError::Fetch(exception)) => {
                        trace!(linear = key.linear, ?exception, "instruction fetch faulted");
                        vcpu.cpu.raise_exception_fault(exception);
                        return Ok(BlockExit {
                            outcome: Outcome::Fault,
                            retired: 0,
                        });
                    }
                    Err(CodeBlockError::NoFactory { mode, address }) => {
                        return Err(ExecError::FactoryExhausted { mode, address })
                    }
                }
            }
        };

        let exit = match block.execute(&mut vcpu.cpu, &mut vcpu.bus) {
            Ok(exit) => exit,
            Err(CodeBlockError::Fetch(exception)) => {
                vcpu.cpu.raise_exception_fault(exception);
                BlockExit {
                    outcome: Outcome::Fault,
                    retired: 0,
                }
            }
            Err(CodeBlockError::NoFactory { mode, address }) => {
                return Err(ExecError::FactoryExhausted { mode, address })
            }
        };

        // A spanning block only learns its extent once it has decoded.
        if fresh || block.is_spanning() {
            let start = block.linear();
            let end = start + block.byte_length().max(1) as u64;
            for page in start / PAGE_SIZE..=(end - 1) / PAGE_SIZE {
                self.code_pages.insert(page);
            }
        }
        self.manager.note_executed(block, entry_eip, &mut vcpu.bus);
        if fresh {
            self.evict_oldest_blocks();
        }
        Ok(exit)
    }

    /// FIFO eviction down to `max_cached_blocks`. The block just inserted is
    /// at the back of `order` and survives.
    fn evict_oldest_blocks(&mut self) {
        let cap = self.config.max_cached_blocks.max(1);
        while self.blocks.len() > cap {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if self.blocks.remove(&oldest).is_some() {
                trace!(linear = oldest.linear, "evicted cached block");
                self.stats.evicted_blocks += 1;
                self.forget_block(oldest);
            }
        }
    }

    fn forget_block(&mut self, key: BlockKey) {
        if let Some(decode_mode) = DecodeMode::from_bitness(key.bitness) {
            self.manager.forget_block(key.linear, decode_mode);
        }
    }

    /// Remove every cached block for which `evict` holds and keep `order` and
    /// the hotness counters in step. Returns how many were removed.
    fn remove_blocks(&mut self, mut evict: impl FnMut(&BlockKey, &mut CodeBlock) -> bool) -> usize {
        let mut removed = Vec::new();
        self.blocks.retain(|key, block| {
            let gone = evict(key, block);
            if gone {
                removed.push(*key);
            }
            !gone
        });
        if !removed.is_empty() {
            let blocks = &self.blocks;
            self.order.retain(|key| blocks.contains_key(key));
            for key in &removed {
                self.forget_block(*key);
            }
        }
        removed.len()
    }

    /// Forward every write since the last block to the cached blocks and the
    /// artifact cache. Overlapped blocks are evicted; spanning blocks drop
    /// their own cached decode and stay.
    fn sync_modified_regions(&mut self, bus: &mut dyn MemoryBus) {
        let mut writes = std::mem::take(&mut self.writes);
        writes.clear();
        bus.drain_modified_regions(&mut |start, end| writes.push((start, end)));

        for &(start, end) in &writes {
            if end <= start {
                continue;
            }
            let touches_code = (start / PAGE_SIZE..=(end - 1) / PAGE_SIZE)
                .any(|p| self.code_pages.contains(&p));
            if !touches_code {
                continue;
            }
            let evicted = self.remove_blocks(|_, block| {
                block.handle_memory_region_change(start, end)
            });
            if evicted > 0 {
                debug!(start, end, evicted, "guest write invalidated cached blocks");
                self.stats.invalidated_blocks += evicted as u64;
            }
            self.manager.handle_memory_region_change(start, end);
        }
        self.writes = writes;
    }

    fn deliver_pending_fault<B: MemoryBus>(&mut self, vcpu: &mut Vcpu<B>) {
        let Some(fault) = vcpu.cpu.take_pending_fault() else {
            return;
        };
        debug_assert_eq!(fault.saved_eip, vcpu.cpu.eip());
        trace!(exception = ?fault.exception, eip = fault.saved_eip, "delivering fault");
        match deliver_exception(&mut vcpu.cpu, &mut vcpu.bus, fault.exception) {
            Ok(()) => self.stats.faults_delivered += 1,
            Err(exit) => {
                warn!(?exit, exception = ?fault.exception, eip = fault.saved_eip, "vcpu stopped");
                vcpu.exit = Some(exit);
            }
        }
        self.sync_modified_regions(&mut vcpu.bus);
    }

    fn quantum_boundary<B: MemoryBus>(
        &mut self,
        vcpu: &mut Vcpu<B>,
        irq: &mut dyn InterruptSource,
    ) {
        let elapsed = std::mem::take(&mut self.quantum_count);
        self.stats.quantum_boundaries += 1;
        irq.poll_devices(elapsed);
        self.retire_compiled();

        if !vcpu.cpu.interrupts_enabled() || !irq.has_pending() {
            return;
        }
        let Some(vector) = irq.acknowledge() else {
            return;
        };
        let return_eip = vcpu.cpu.eip();
        match deliver(
            &mut vcpu.cpu,
            &mut vcpu.bus,
            vector,
            return_eip,
            None,
            InterruptKind::External,
        ) {
            Ok(()) => {
                trace!(vector, "external interrupt delivered");
                self.stats.interrupts_delivered += 1;
                self.sync_modified_regions(&mut vcpu.bus);
            }
            Err(exception) => {
                vcpu.cpu.raise_exception_fault(exception);
                self.deliver_pending_fault(vcpu);
            }
        }
    }

    /// Drop interpreted blocks that a freshly installed artifact replaces, so
    /// the next fetch goes through the compiling chain.
    fn retire_compiled(&mut self) {
        for linear in self.manager.poll_compiled() {
            self.remove_blocks(|key, block| key.linear == linear && !block.is_spanning());
        }
    }
}

fn fetch(
    manager: &mut CodeBlockManager,
    bus: &mut dyn MemoryBus,
    key: BlockKey,
) -> Result<CodeBlock, CodeBlockError> {
    match key.mode {
        CpuMode::Real => manager.real_mode_code_block_at(bus, key.linear),
        CpuMode::Protected => {
            manager.protected_mode_code_block_at(bus, key.linear, key.bitness == 32)
        }
        CpuMode::Virtual8086 => manager.virtual8086_mode_code_block_at(bus, key.linear),
    }
}
