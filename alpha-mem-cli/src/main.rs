//! Host harness for driving an `alpha-memory` [`MemorySystem`] from the command line: load a
//! configuration, run a scripted sequence of memory operations against it, and print the
//! resulting statistics.

use {
    alpha_memory::{
        AccessType, BarrierKind, Config, ExecutionContext, MemorySystem, Mode, PhysicalAddress,
        VirtualAddress,
    },
    anyhow::{bail, Context, Result},
    clap::{Parser, Subcommand},
    std::{fs, path::PathBuf},
    tracing::info,
};

#[derive(Parser)]
#[command(name = "alpha-mem-cli", about = "Drive an Alpha AXP SMP memory system from a script")]
struct Cli {
    /// Path to a TOML configuration file. Defaults to a small single-CPU config sized for
    /// interactive experimentation.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script of memory operations, one per line, then print final statistics.
    Run {
        /// Path to a script file; see `Op::parse_line` for the accepted syntax.
        script: PathBuf,
    },
    /// Validate a configuration file and print the resolved geometry.
    Check,
}

/// One line of a script file: `<op> <args...>`. Addresses and values are hex or decimal.
enum Op {
    Read { va: u64, size: usize },
    Write { va: u64, size: usize, value: u64 },
    Barrier { kind: BarrierKind },
}

impl Op {
    fn parse_line(line: &str) -> Result<Option<Self>> {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            return Ok(None);
        }
        let mut parts = line.split_whitespace();
        let op = parts.next().context("empty script line")?;
        let parse_u64 = |s: &str| -> Result<u64> {
            if let Some(hex) = s.strip_prefix("0x") {
                Ok(u64::from_str_radix(hex, 16)?)
            } else {
                Ok(s.parse()?)
            }
        };
        Ok(Some(match op.to_ascii_lowercase().as_str() {
            "read" => {
                let va = parse_u64(parts.next().context("read needs an address")?)?;
                let size = parts.next().unwrap_or("8").parse()?;
                Op::Read { va, size }
            }
            "write" => {
                let va = parse_u64(parts.next().context("write needs an address")?)?;
                let value = parse_u64(parts.next().context("write needs a value")?)?;
                let size = parts.next().unwrap_or("8").parse()?;
                Op::Write { va, size, value }
            }
            "mb" => Op::Barrier { kind: BarrierKind::Mb },
            "wmb" => Op::Barrier { kind: BarrierKind::Wmb },
            "imb" => Op::Barrier { kind: BarrierKind::Imb },
            other => bail!("unrecognized script op {other:?}"),
        }))
    }
}

/// A fixed, single-CPU, MMU-disabled execution context: enough to drive direct physical reads
/// and writes from a script without modeling ASNs or page tables.
struct FlatContext;

impl ExecutionContext for FlatContext {
    fn cpu_id(&self) -> usize {
        0
    }
    fn current_asn(&self) -> u8 {
        0
    }
    fn mode(&self) -> Mode {
        Mode::Kernel
    }
    fn mmu_enabled(&self) -> bool {
        false
    }
    fn ptbr(&self) -> PhysicalAddress {
        PhysicalAddress::new(0)
    }
    fn unaligned_access_allowed(&self) -> bool {
        false
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            Config::from_toml(&text).context("parsing configuration")
        }
        None => Ok(Config::minimal_for_tests()),
    }
}

fn run_script(system: &MemorySystem, script: &PathBuf) -> Result<()> {
    let text = fs::read_to_string(script).with_context(|| format!("reading {}", script.display()))?;
    let ctx = FlatContext;
    for (lineno, line) in text.lines().enumerate() {
        let Some(op) = Op::parse_line(line).with_context(|| format!("{}:{}", script.display(), lineno + 1))? else {
            continue;
        };
        match op {
            Op::Read { va, size } => {
                let value = system.read(VirtualAddress::new(va), size, AccessType::Read, &ctx)?;
                println!("read  {va:#x} [{size}] = {value:#x}");
            }
            Op::Write { va, size, value } => {
                system.write(VirtualAddress::new(va), size, value, &ctx)?;
                println!("write {va:#x} [{size}] = {value:#x}");
            }
            Op::Barrier { kind } => {
                system.barrier(kind, &ctx)?;
                println!("barrier {kind:?}");
            }
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Check => {
            config.validate().context("configuration is invalid")?;
            println!("cpu.count       = {}", config.cpu.count);
            println!("memory.size_gb  = {}", config.memory.size_gb);
            println!("l1d             = {}-way, {} sets, {}B lines", config.l1d.assoc, config.l1d.sets, config.l1d.line);
            println!("l2              = {}-way, {} sets, {}B lines", config.l2.assoc, config.l2.sets, config.l2.line);
            println!("l3              = {}-way, {} sets, {}B lines", config.l3.assoc, config.l3.sets, config.l3.line);
        }
        Commands::Run { script } => {
            let system = MemorySystem::new(config, alpha_memory::MmioRouter::new(), alpha_memory::PalRegistry::new())
                .context("constructing memory system")?;
            run_script(&system, &script)?;
            let stats = system.stats();
            info!(
                reads = stats.reads.get(),
                writes = stats.writes.get(),
                faults = stats.faults.get(),
                walks = system.walker_walks(),
                "run complete"
            );
            println!("reads={} writes={} faults={} page_table_walks={}", stats.reads.get(), stats.writes.get(), stats.faults.get(), system.walker_walks());
            system.shutdown();
        }
    }

    Ok(())
}
