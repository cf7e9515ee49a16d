//! Background compilation worker.
//!
//! Requests carry a snapshot of the guest bytes they were made from, so the
//! worker never touches live guest memory. Results flow back over a channel
//! and are collected by the CPU thread without blocking.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use blockvm_x86::DecodeMode;
use tracing::{debug, warn};

use super::PageVersion;
use crate::codeblock::{decode_basic_block, BasicBlock, ByteCursor, DecodeRequest, DecodedBlock};
use crate::exception::Exception;
use crate::mem::MemoryBus;
use crate::state::CpuMode;

#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub linear: u64,
    pub ip: u32,
    pub decode_mode: DecodeMode,
    pub block_limit: usize,
    pub bytes: Vec<u8>,
    pub page_versions: Vec<PageVersion>,
}

/// A block built off-thread from a byte snapshot.
#[derive(Debug)]
pub struct Artifact {
    pub linear: u64,
    pub decode_mode: DecodeMode,
    pub bytes: Vec<u8>,
    pub page_versions: Vec<PageVersion>,
    pub block: Arc<BasicBlock>,
}

#[derive(Debug)]
pub enum CompileResult {
    Compiled(Artifact),
    Failed { linear: u64, reason: String },
}

/// Read-only view of a byte snapshot positioned at its original address.
struct SnapshotBus<'a> {
    base: u64,
    bytes: &'a [u8],
}

impl MemoryBus for SnapshotBus<'_> {
    fn read_u8(&mut self, addr: u64) -> Result<u8, Exception> {
        addr.checked_sub(self.base)
            .and_then(|off| self.bytes.get(off as usize).copied())
            .ok_or(Exception::MemoryFault { addr })
    }

    fn write_u8(&mut self, addr: u64, _val: u8) -> Result<(), Exception> {
        Err(Exception::MemoryFault { addr })
    }
}

/// Build the node chain for a request. This is the whole of "compilation":
/// the expensive part of block construction moved off the CPU thread.
pub fn compile(req: CompileRequest) -> CompileResult {
    let decode = DecodeRequest {
        // The stored block is mode-independent; the factory tags it.
        mode: CpuMode::Real,
        decode_mode: req.decode_mode,
        linear: req.linear,
        ip: req.ip,
        block_limit: req.block_limit,
    };
    let mut bus = SnapshotBus {
        base: req.linear,
        bytes: &req.bytes,
    };
    let mut cursor = ByteCursor::new();
    cursor.reset(req.linear, None);

    match decode_basic_block(&decode, &mut cursor, &mut bus) {
        Ok(DecodedBlock::Block(block)) if block.byte_length() as usize == req.bytes.len() => {
            CompileResult::Compiled(Artifact {
                linear: req.linear,
                decode_mode: req.decode_mode,
                bytes: req.bytes,
                page_versions: req.page_versions,
                block: Arc::new(block),
            })
        }
        Ok(DecodedBlock::Block(block)) => CompileResult::Failed {
            linear: req.linear,
            reason: format!(
                "decoded {} bytes from a {}-byte snapshot",
                block.byte_length(),
                req.bytes.len()
            ),
        },
        Ok(DecodedBlock::Underrun) => CompileResult::Failed {
            linear: req.linear,
            reason: "snapshot ends inside an instruction".to_string(),
        },
        Err(e) => CompileResult::Failed {
            linear: req.linear,
            reason: format!("{e:?}"),
        },
    }
}

pub struct BackgroundCompiler {
    requests: Option<Sender<CompileRequest>>,
    results: Receiver<CompileResult>,
    worker: Option<JoinHandle<()>>,
    in_flight: usize,
}

impl BackgroundCompiler {
    pub fn spawn() -> std::io::Result<Self> {
        let (req_tx, req_rx) = mpsc::channel::<CompileRequest>();
        let (res_tx, res_rx) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("blockvm-jit".to_string())
            .spawn(move || {
                for req in req_rx {
                    let linear = req.linear;
                    let result = compile(req);
                    if res_tx.send(result).is_err() {
                        debug!(linear, "compile result dropped; runtime is gone");
                        break;
                    }
                }
            })?;
        Ok(Self {
            requests: Some(req_tx),
            results: res_rx,
            worker: Some(worker),
            in_flight: 0,
        })
    }

    /// Queue a request. Returns `false` if the worker has gone away.
    pub fn submit(&mut self, req: CompileRequest) -> bool {
        let Some(tx) = &self.requests else {
            return false;
        };
        match tx.send(req) {
            Ok(()) => {
                self.in_flight += 1;
                true
            }
            Err(_) => {
                warn!("background compiler is not running");
                self.requests = None;
                false
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Collect finished results without blocking.
    pub fn try_collect(&mut self, out: &mut Vec<CompileResult>) {
        loop {
            match self.results.try_recv() {
                Ok(result) => {
                    self.in_flight = self.in_flight.saturating_sub(1);
                    out.push(result);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.in_flight = 0;
                    break;
                }
            }
        }
    }

    /// Block until every submitted request has produced a result.
    pub fn wait_idle(&mut self, out: &mut Vec<CompileResult>) {
        while self.in_flight > 0 {
            match self.results.recv() {
                Ok(result) => {
                    self.in_flight -= 1;
                    out.push(result);
                }
                Err(_) => {
                    self.in_flight = 0;
                }
            }
        }
    }
}

impl Drop for BackgroundCompiler {
    fn drop(&mut self) {
        // Closing the request channel ends the worker loop.
        self.requests = None;
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compile_rebuilds_the_block_from_the_snapshot() {
        // inc ax; inc ax; hlt
        let req = CompileRequest {
            linear: 0x7C00,
            ip: 0x7C00,
            decode_mode: DecodeMode::Bits16,
            block_limit: 16,
            bytes: vec![0x40, 0x40, 0xF4],
            page_versions: Vec::new(),
        };
        match compile(req) {
            CompileResult::Compiled(a) => assert_eq!(a.block.instruction_count(), 3),
            CompileResult::Failed { reason, .. } => panic!("{reason}"),
        }
    }

    #[test]
    fn worker_round_trip() {
        let mut compiler = BackgroundCompiler::spawn().unwrap();
        assert!(compiler.submit(CompileRequest {
            linear: 0,
            ip: 0,
            decode_mode: DecodeMode::Bits32,
            block_limit: 16,
            bytes: vec![0x90, 0xC3],
            page_versions: Vec::new(),
        }));
        let mut out = Vec::new();
        compiler.wait_idle(&mut out);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], CompileResult::Compiled(_)));
    }
}
