//! Background compilation side channel.
//!
//! The CPU thread counts executions of interpreted blocks. Once a block is hot
//! its bytes are snapshotted and handed to a [`BackgroundCompiler`]. Finished
//! artifacts are installed only if the pages they were built from have not
//! been written since the snapshot, and are re-checked byte for byte against
//! guest memory before the compiling factory hands one out.

mod compiler;

use std::collections::VecDeque;
use std::sync::Arc;

use blockvm_x86::DecodeMode;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, trace, warn};

pub use compiler::{compile, Artifact, BackgroundCompiler, CompileRequest, CompileResult};

use crate::codeblock::BasicBlock;
use crate::mem::{MemoryBus, PAGE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitConfig {
    pub enabled: bool,
    /// Executions of an interpreted block before it is queued for compilation.
    pub hot_threshold: u32,
    pub cache_max_blocks: usize,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hot_threshold: 32,
            cache_max_blocks: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageVersion {
    pub page: u64,
    pub version: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JitStats {
    pub requested: u64,
    pub installed: u64,
    pub rejected_stale: u64,
    pub failed: u64,
    pub invalidated: u64,
}

type Key = (u64, u32);

fn key(linear: u64, mode: DecodeMode) -> Key {
    (linear, mode.bitness())
}

pub struct ArtifactCache {
    config: JitConfig,
    compiler: Option<BackgroundCompiler>,
    artifacts: FxHashMap<Key, Arc<Artifact>>,
    order: VecDeque<Key>,
    hotness: FxHashMap<Key, u32>,
    requested: FxHashSet<Key>,
    page_versions: FxHashMap<u64, u32>,
    newly_installed: Vec<u64>,
    results: Vec<CompileResult>,
    stats: JitStats,
}

impl ArtifactCache {
    /// Starts the worker thread when `config.enabled`. A worker that fails to
    /// start leaves the cache permanently empty.
    pub fn new(config: JitConfig) -> Self {
        let compiler = if config.enabled {
            match BackgroundCompiler::spawn() {
                Ok(c) => Some(c),
                Err(e) => {
                    warn!(error = %e, "failed to start background compiler; interpreting only");
                    None
                }
            }
        } else {
            None
        };
        Self {
            config,
            compiler,
            artifacts: FxHashMap::default(),
            order: VecDeque::new(),
            hotness: FxHashMap::default(),
            requested: FxHashSet::default(),
            page_versions: FxHashMap::default(),
            newly_installed: Vec::new(),
            results: Vec::new(),
            stats: JitStats::default(),
        }
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn stats(&self) -> JitStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn contains(&self, linear: u64, mode: DecodeMode) -> bool {
        self.artifacts.contains_key(&key(linear, mode))
    }

    fn version(&self, page: u64) -> u32 {
        self.page_versions.get(&page).copied().unwrap_or(0)
    }

    fn snapshot_versions(&self, linear: u64, len: u32) -> Vec<PageVersion> {
        let first = linear / PAGE_SIZE;
        let last = (linear + len.max(1) as u64 - 1) / PAGE_SIZE;
        (first..=last)
            .map(|page| PageVersion {
                page,
                version: self.version(page),
            })
            .collect()
    }

    fn versions_current(&self, versions: &[PageVersion]) -> bool {
        versions.iter().all(|pv| self.version(pv.page) == pv.version)
    }

    /// Count one execution of an interpreted block and queue it for
    /// compilation when it turns hot. Each block is requested at most once
    /// until a write invalidates it.
    pub fn record_execution(
        &mut self,
        linear: u64,
        ip: u32,
        decode_mode: DecodeMode,
        block_limit: usize,
        byte_length: u32,
        bus: &mut dyn MemoryBus,
    ) {
        if self.compiler.is_none() || byte_length == 0 {
            return;
        }
        let k = key(linear, decode_mode);
        if self.requested.contains(&k) || self.artifacts.contains_key(&k) {
            return;
        }
        let hits = self.hotness.entry(k).or_insert(0);
        *hits += 1;
        if *hits < self.config.hot_threshold {
            return;
        }

        let mut bytes = Vec::with_capacity(byte_length as usize);
        for i in 0..byte_length as u64 {
            match bus.read_u8(linear + i) {
                Ok(b) => bytes.push(b),
                Err(_) => return,
            }
        }
        let req = CompileRequest {
            linear,
            ip,
            decode_mode,
            block_limit,
            bytes,
            page_versions: self.snapshot_versions(linear, byte_length),
        };
        if let Some(compiler) = self.compiler.as_mut() {
            if compiler.submit(req) {
                trace!(linear, "compile requested");
                self.requested.insert(k);
                self.hotness.remove(&k);
                self.stats.requested += 1;
            }
        }
    }

    /// Drop the hotness counter for a block that left the caller's cache.
    pub fn forget(&mut self, linear: u64, decode_mode: DecodeMode) {
        self.hotness.remove(&key(linear, decode_mode));
    }

    /// Blocks currently accumulating executions toward the hot threshold.
    pub fn tracked_blocks(&self) -> usize {
        self.hotness.len()
    }

    /// Collect finished compilations without blocking.
    pub fn poll(&mut self) {
        let mut results = std::mem::take(&mut self.results);
        if let Some(compiler) = self.compiler.as_mut() {
            compiler.try_collect(&mut results);
        }
        self.install_results(&mut results);
        self.results = results;
    }

    /// Block until the worker is idle, then install everything it produced.
    pub fn wait_idle(&mut self) {
        let mut results = std::mem::take(&mut self.results);
        if let Some(compiler) = self.compiler.as_mut() {
            compiler.wait_idle(&mut results);
        }
        self.install_results(&mut results);
        self.results = results;
    }

    fn install_results(&mut self, results: &mut Vec<CompileResult>) {
        for result in results.drain(..) {
            match result {
                CompileResult::Compiled(artifact) => self.install(artifact),
                CompileResult::Failed { linear, reason } => {
                    debug!(linear, %reason, "compilation failed; block stays interpreted");
                    self.stats.failed += 1;
                }
            }
        }
    }

    fn install(&mut self, artifact: Artifact) {
        let k = key(artifact.linear, artifact.decode_mode);
        self.requested.remove(&k);
        if !self.versions_current(&artifact.page_versions) {
            debug!(linear = artifact.linear, "dropping compile result built from stale bytes");
            self.stats.rejected_stale += 1;
            return;
        }
        if self.artifacts.len() >= self.config.cache_max_blocks {
            if let Some(oldest) = self.order.pop_front() {
                self.artifacts.remove(&oldest);
            }
        }
        debug!(linear = artifact.linear, bytes = artifact.bytes.len(), "compiled block installed");
        self.newly_installed.push(artifact.linear);
        self.order.push_back(k);
        self.artifacts.insert(k, Arc::new(artifact));
        self.stats.installed += 1;
    }

    /// Linear addresses that gained an artifact since the last call.
    pub fn take_newly_installed(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.newly_installed)
    }

    /// Return the compiled block for `linear` if its bytes still match guest
    /// memory. A mismatching artifact is discarded.
    pub fn lookup(
        &mut self,
        linear: u64,
        decode_mode: DecodeMode,
        bus: &mut dyn MemoryBus,
    ) -> Option<Arc<BasicBlock>> {
        let k = key(linear, decode_mode);
        let artifact = self.artifacts.get(&k)?;
        let matches = artifact
            .bytes
            .iter()
            .enumerate()
            .all(|(i, &b)| bus.read_u8(linear + i as u64) == Ok(b));
        if matches && self.versions_current(&artifact.page_versions) {
            return Some(artifact.block.clone());
        }
        debug!(linear, "compiled block no longer matches guest memory");
        self.remove(&k);
        self.stats.invalidated += 1;
        None
    }

    fn remove(&mut self, k: &Key) {
        self.artifacts.remove(k);
        self.order.retain(|o| o != k);
    }

    /// Bump the versions of every page in `[start, end)` and drop artifacts
    /// that overlap the range.
    pub fn on_guest_write(&mut self, start: u64, end: u64) {
        if end <= start {
            return;
        }
        for page in start / PAGE_SIZE..=(end - 1) / PAGE_SIZE {
            let v = self.page_versions.entry(page).or_insert(0);
            *v = v.wrapping_add(1);
        }

        let stale: Vec<Key> = self
            .artifacts
            .iter()
            .filter(|(_, a)| a.linear < end && start < a.linear + a.bytes.len() as u64)
            .map(|(k, _)| *k)
            .collect();
        for k in stale {
            trace!(linear = k.0, "compiled block invalidated by guest write");
            self.remove(&k);
            self.stats.invalidated += 1;
        }
    }
}
