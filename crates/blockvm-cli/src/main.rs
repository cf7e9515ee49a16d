#![forbid(unsafe_code)]

// Native-only runner. Keep a stub `main` so `--target wasm32-unknown-unknown --workspace` still
// builds.
#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
mod native {
    use std::fs::File;
    use std::io::{self, Write};
    use std::path::PathBuf;

    use anyhow::{bail, Context, Result};
    use blockvm_cpu_core::codeblock::BLOCK_LIMIT;
    use blockvm_cpu_core::exception::Exception;
    use blockvm_cpu_core::exec::{ExecConfig, ExecDriver, Vcpu};
    use blockvm_cpu_core::interrupts::InterruptQueue;
    use blockvm_cpu_core::jit::JitConfig;
    use blockvm_cpu_core::mem::{MemoryBus, PhysicalMemory};
    use blockvm_cpu_core::state::{gpr, CpuState, SegReg, Segment};
    use clap::Parser;
    use tracing::{debug, info};
    use tracing_subscriber::EnvFilter;

    /// Bochs/QEMU style debug console port.
    const DEBUGCON_PORT: u16 = 0xE9;
    /// Real mode can only address the first MiB (plus the HMA, which is not modelled).
    const REAL_MODE_LIMIT: u64 = 0x10_0000;

    #[derive(Debug, Parser)]
    #[command(about = "Run a raw x86 image on the block interpreter, starting in real mode")]
    pub struct Args {
        /// Raw guest image, copied verbatim into RAM.
        image: PathBuf,

        /// Linear address the image is loaded at.
        #[arg(long, default_value = "0x7c00", value_parser = parse_u64)]
        load_addr: u64,

        /// Linear address execution starts at (defaults to `--load-addr`).
        #[arg(long, value_parser = parse_u64)]
        entry: Option<u64>,

        /// Guest RAM size in KiB.
        #[arg(long, default_value_t = 1024)]
        ram_kib: u64,

        /// Stop after executing at least N guest instructions.
        #[arg(long, default_value_t = 10_000_000)]
        max_insts: u64,

        /// Blocks dispatched per driver call.
        #[arg(long, default_value_t = ExecConfig::default().blocks_per_call)]
        blocks_per_call: u32,

        /// Instructions between interrupt checkpoints.
        #[arg(long, default_value_t = ExecConfig::default().quantum)]
        quantum: u64,

        /// Maximum instructions decoded into one block.
        #[arg(long, default_value_t = BLOCK_LIMIT)]
        block_limit: usize,

        /// Decoded blocks kept in the block cache.
        #[arg(long, default_value_t = 4096)]
        max_cached_blocks: usize,

        /// Compile hot blocks on a background thread.
        #[arg(long)]
        jit: bool,

        /// Executions before a block is queued for compilation.
        #[arg(long, default_value_t = JitConfig::default().hot_threshold)]
        jit_hot_threshold: u32,

        /// Maximum number of compiled blocks kept.
        #[arg(long, default_value_t = JitConfig::default().cache_max_blocks)]
        jit_cache_blocks: usize,

        /// Where to write bytes the guest sends to port 0xE9 (`stdout`, `none` or a file path).
        #[arg(long, default_value = "stdout")]
        debugcon_out: String,

        /// Print the register file and driver statistics on exit.
        #[arg(long)]
        dump_state: bool,
    }

    fn parse_u64(s: &str) -> Result<u64, String> {
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse(),
        };
        parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
    }

    /// Guest RAM plus the debug console port.
    struct Board {
        ram: PhysicalMemory,
        debugcon: Vec<u8>,
    }

    impl MemoryBus for Board {
        fn read_u8(&mut self, addr: u64) -> Result<u8, Exception> {
            self.ram.read_u8(addr)
        }

        fn write_u8(&mut self, addr: u64, val: u8) -> Result<(), Exception> {
            self.ram.write_u8(addr, val)
        }

        fn io_write(&mut self, port: u16, _size: u32, val: u32) -> Result<(), Exception> {
            if port == DEBUGCON_PORT {
                self.debugcon.push(val as u8);
            }
            Ok(())
        }

        fn drain_modified_regions(&mut self, sink: &mut dyn FnMut(u64, u64)) {
            self.ram.drain_modified_regions(sink)
        }
    }

    fn open_sink(dest: &str) -> Result<Option<Box<dyn Write>>> {
        Ok(match dest {
            "none" => None,
            "stdout" => Some(Box::new(io::stdout())),
            path => Some(Box::new(
                File::create(path).with_context(|| format!("failed to create {path}"))?,
            )),
        })
    }

    fn flush_debugcon(board: &mut Board, out: &mut Option<Box<dyn Write>>) -> Result<()> {
        if board.debugcon.is_empty() {
            return Ok(());
        }
        if let Some(out) = out.as_mut() {
            out.write_all(&board.debugcon)?;
            out.flush()?;
        }
        board.debugcon.clear();
        Ok(())
    }

    /// Real-mode CS:IP for a linear address below 1 MiB.
    fn real_mode_entry(linear: u64) -> Result<(u16, u16)> {
        if linear >= REAL_MODE_LIMIT {
            bail!("entry point {linear:#x} is not reachable in real mode");
        }
        let cs = ((linear >> 4) & 0xF000) as u16;
        let ip = (linear - ((cs as u64) << 4)) as u16;
        Ok((cs, ip))
    }

    fn dump_state(cpu: &CpuState) {
        const NAMES: [&str; 8] = ["eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi"];
        for (idx, name) in NAMES.iter().enumerate() {
            eprintln!("{name}={:#010x}", cpu.gpr32(idx));
        }
        eprintln!("eip={:#010x} eflags={:#010x}", cpu.eip(), cpu.eflags().bits());
        eprintln!(
            "cs={:#06x} ss={:#06x} ds={:#06x} mode={:?}",
            cpu.segment(SegReg::Cs).selector,
            cpu.segment(SegReg::Ss).selector,
            cpu.segment(SegReg::Ds).selector,
            cpu.mode()
        );
    }

    pub fn main() -> Result<()> {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();

        let args = Args::parse();

        let ram_bytes = args
            .ram_kib
            .checked_mul(1024)
            .context("RAM size overflow")?;
        let image = std::fs::read(&args.image)
            .with_context(|| format!("failed to read image: {}", args.image.display()))?;
        let image_end = args
            .load_addr
            .checked_add(image.len() as u64)
            .context("image end overflows")?;
        if image_end > ram_bytes {
            bail!(
                "image of {} bytes at {:#x} does not fit in {} KiB of RAM",
                image.len(),
                args.load_addr,
                args.ram_kib
            );
        }

        let mut ram = PhysicalMemory::new(ram_bytes as usize);
        ram.load(args.load_addr, &image);

        let (cs, ip) = real_mode_entry(args.entry.unwrap_or(args.load_addr))?;
        let mut cpu = CpuState::new();
        cpu.segments[SegReg::Cs as usize] = Segment::real(cs);
        cpu.set_eip(ip as u32);
        cpu.set_gpr16(gpr::ESP, args.load_addr.min(0xFFFE) as u16);

        let config = ExecConfig {
            blocks_per_call: args.blocks_per_call,
            quantum: args.quantum,
            block_limit: args.block_limit,
            max_cached_blocks: args.max_cached_blocks,
            jit: JitConfig {
                enabled: args.jit,
                hot_threshold: args.jit_hot_threshold,
                cache_max_blocks: args.jit_cache_blocks,
            },
        };
        info!(?config, image = %args.image.display(), cs, ip, "starting guest");

        let mut vcpu = Vcpu::new(
            cpu,
            Board {
                ram,
                debugcon: Vec::new(),
            },
        );
        let mut irq = InterruptQueue::default();
        let mut driver = ExecDriver::new(config);
        let mut debugcon = open_sink(&args.debugcon_out)?;

        let mut total = 0u64;
        let result = loop {
            if total >= args.max_insts {
                eprintln!("instruction budget exhausted after {total} instructions");
                break Ok(());
            }
            let executed = match driver.execute(&mut vcpu, &mut irq) {
                Ok(n) => n,
                Err(e) => break Err(anyhow::Error::new(e).context("execution stopped")),
            };
            total += executed;
            flush_debugcon(&mut vcpu.bus, &mut debugcon)?;

            if let Some(exit) = vcpu.exit {
                break Err(anyhow::anyhow!(
                    "execution stopped after {total} instructions: cpu exit: {exit:?}"
                ));
            }
            if vcpu.cpu.halted && irq.is_empty() {
                eprintln!("guest halted after {total} instructions");
                break Ok(());
            }
            debug!(executed, total, "slice finished");
        };

        if args.jit {
            driver.jit_wait_idle();
        }
        if args.dump_state {
            dump_state(&vcpu.cpu);
            eprintln!("{:?}", driver.stats());
            if let Some(jit) = driver.jit_stats() {
                eprintln!("{jit:?}");
            }
        }
        result
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_decimal_and_hex() {
            assert_eq!(parse_u64("31744"), Ok(0x7C00));
            assert_eq!(parse_u64("0x7c00"), Ok(0x7C00));
            assert_eq!(parse_u64("0X7C00"), Ok(0x7C00));
            assert!(parse_u64("0xzz").is_err());
        }

        #[test]
        fn real_mode_entry_splits_into_segment_and_offset() {
            assert_eq!(real_mode_entry(0x7C00).unwrap(), (0, 0x7C00));
            assert_eq!(real_mode_entry(0x12345).unwrap(), (0x1000, 0x2345));
            assert_eq!(real_mode_entry(0xFFFF0).unwrap(), (0xF000, 0xFFF0));
            assert!(real_mode_entry(0x10_0000).is_err());
        }
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn main() -> anyhow::Result<()> {
    native::main()
}
