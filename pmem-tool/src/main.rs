use std::io::{SeekFrom, Write as _};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{Args, Parser, Subcommand};
use pmem::Region;
use pmem_blk::BlockPool;
use pmem_log::LogPool;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    pool: PoolCommand,
}

#[derive(Subcommand)]
enum PoolCommand {
    /// Operate on an append-only log pool.
    #[command(subcommand)]
    Log(LogCommand),
    /// Operate on a block pool.
    #[command(subcommand)]
    Blk(BlkCommand),
    /// Operate on a raw mapped region.
    #[command(subcommand)]
    Region(RegionCommand),
}

#[derive(Args)]
struct Pool {
    #[arg(help = "The pool file")]
    path: PathBuf,
}

#[derive(Subcommand)]
enum LogCommand {
    /// Create a new, empty log pool.
    Create {
        #[command(flatten)]
        pool: Pool,
        #[arg(long, default_value_t = pmem_log::DEFAULT_POOL_SIZE)]
        size: u64,
    },
    /// Append each argument as one entry, all of them atomically.
    Append {
        #[command(flatten)]
        pool: Pool,
        #[arg(required = true)]
        entries: Vec<String>,
    },
    /// Print every entry on its own line.
    Walk {
        #[command(flatten)]
        pool: Pool,
        /// Split entries into chunks of this many bytes, zero for whole entries.
        #[arg(long, default_value_t = 0)]
        chunk_size: usize,
    },
    /// Discard all entries.
    Rewind {
        #[command(flatten)]
        pool: Pool,
    },
    Info {
        #[command(flatten)]
        pool: Pool,
    },
    /// Check consistency, failing for an inconsistent pool.
    Check {
        #[command(flatten)]
        pool: Pool,
    },
}

#[derive(Subcommand)]
enum BlkCommand {
    /// Create a new block pool, all blocks reading as zeros.
    Create {
        #[command(flatten)]
        pool: Pool,
        #[arg(long)]
        block_size: usize,
        #[arg(long, default_value_t = pmem_blk::DEFAULT_POOL_SIZE)]
        size: u64,
    },
    Write {
        #[command(flatten)]
        pool: Pool,
        block: u64,
        data: String,
    },
    /// Print a block, without its trailing zero padding.
    Read {
        #[command(flatten)]
        pool: Pool,
        block: u64,
    },
    Zero {
        #[command(flatten)]
        pool: Pool,
        block: u64,
    },
    /// Mark a block as bad.
    Error {
        #[command(flatten)]
        pool: Pool,
        block: u64,
    },
    Info {
        #[command(flatten)]
        pool: Pool,
    },
    /// Check consistency, failing for an inconsistent pool.
    Check {
        #[command(flatten)]
        pool: Pool,
        /// Expected block size, zero accepts any.
        #[arg(long, default_value_t = 0)]
        block_size: usize,
    },
}

#[derive(Subcommand)]
enum RegionCommand {
    /// Create (or extend) a file and map it.
    Create {
        #[command(flatten)]
        pool: Pool,
        #[arg(long)]
        size: u64,
    },
    Write {
        #[command(flatten)]
        pool: Pool,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        data: String,
    },
    Read {
        #[command(flatten)]
        pool: Pool,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        #[arg(long)]
        length: usize,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let Cli { pool } = Cli::parse();
    let consistent = match pool {
        PoolCommand::Log(cmd) => log(cmd)?,
        PoolCommand::Blk(cmd) => blk(cmd)?,
        PoolCommand::Region(cmd) => region(cmd)?,
    };

    Ok(if consistent {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn log(cmd: LogCommand) -> anyhow::Result<bool> {
    let mut out = std::io::stdout().lock();

    match cmd {
        LogCommand::Create { pool, size } => {
            let log = LogPool::create(&pool.path, size)
                .with_context(|| format!("creating log pool {}", pool.path.display()))?;
            writeln!(out, "created log pool of {} bytes", log.nbyte())?;
            log.close()?;
        }
        LogCommand::Append { pool, entries } => {
            let mut log = open_log(&pool)?;
            let entries: Vec<&[u8]> = entries.iter().map(|e| e.as_bytes()).collect();
            log.append_all(&entries)?;
            log.close()?;
        }
        LogCommand::Walk { pool, chunk_size } => {
            let log = open_log(&pool)?;
            let mut result = Ok(());
            log.walk(chunk_size, |entry| {
                result = writeln!(out, "{}", String::from_utf8_lossy(entry));
                result.is_ok()
            })?;
            result?;
        }
        LogCommand::Rewind { pool } => {
            let mut log = open_log(&pool)?;
            log.rewind()?;
            log.close()?;
        }
        LogCommand::Info { pool } => {
            let log = open_log(&pool)?;
            writeln!(out, "nbyte: {}", log.nbyte())?;
            writeln!(out, "offset: {}", log.tell())?;
            writeln!(out, "pmem: {}", log.is_pmem())?;
        }
        LogCommand::Check { pool } => {
            let consistent = pmem_log::check(&pool.path)?;
            writeln!(out, "{}", verdict(consistent))?;
            return Ok(consistent);
        }
    }

    Ok(true)
}

fn blk(cmd: BlkCommand) -> anyhow::Result<bool> {
    let mut out = std::io::stdout().lock();

    match cmd {
        BlkCommand::Create {
            pool,
            block_size,
            size,
        } => {
            let blk = BlockPool::create(&pool.path, block_size, size)
                .with_context(|| format!("creating block pool {}", pool.path.display()))?;
            writeln!(out, "created {} blocks of {} bytes", blk.nblock(), blk.bsize())?;
            blk.close()?;
        }
        BlkCommand::Write { pool, block, data } => {
            let mut blk = open_blk(&pool)?;
            blk.write(block, data.as_bytes())?;
            blk.close()?;
        }
        BlkCommand::Read { pool, block } => {
            let blk = open_blk(&pool)?;
            let data = blk.read(block)?;
            let end = data.iter().rposition(|&b| b != 0).map_or(0, |pos| pos + 1);
            writeln!(out, "{}", String::from_utf8_lossy(&data[..end]))?;
        }
        BlkCommand::Zero { pool, block } => {
            let mut blk = open_blk(&pool)?;
            blk.set_zero(block)?;
            blk.close()?;
        }
        BlkCommand::Error { pool, block } => {
            let mut blk = open_blk(&pool)?;
            blk.set_error(block)?;
            blk.close()?;
        }
        BlkCommand::Info { pool } => {
            let blk = open_blk(&pool)?;
            writeln!(out, "bsize: {}", blk.bsize())?;
            writeln!(out, "nblock: {}", blk.nblock())?;
            writeln!(out, "pmem: {}", blk.is_pmem())?;
        }
        BlkCommand::Check { pool, block_size } => {
            let consistent = pmem_blk::check(&pool.path, block_size)?;
            writeln!(out, "{}", verdict(consistent))?;
            return Ok(consistent);
        }
    }

    Ok(true)
}

fn region(cmd: RegionCommand) -> anyhow::Result<bool> {
    let mut out = std::io::stdout().lock();

    match cmd {
        RegionCommand::Create { pool, size } => {
            let mut region = Region::create(&pool.path, size)
                .with_context(|| format!("mapping {}", pool.path.display()))?;
            writeln!(out, "mapped {} bytes, pmem: {}", region.len(), region.is_pmem())?;
            region.close()?;
        }
        RegionCommand::Write { pool, offset, data } => {
            let mut region = open_region(&pool)?;
            region.seek(SeekFrom::Start(offset))?;
            region.write(data.as_bytes())?;
            region.close()?;
        }
        RegionCommand::Read {
            pool,
            offset,
            length,
        } => {
            let mut region = open_region(&pool)?;
            region.seek(SeekFrom::Start(offset))?;
            let data = region.read_vec(length)?;
            writeln!(out, "{}", String::from_utf8_lossy(&data))?;
        }
    }

    Ok(true)
}

fn open_log(pool: &Pool) -> anyhow::Result<LogPool> {
    LogPool::open(&pool.path).with_context(|| format!("opening log pool {}", pool.path.display()))
}

fn open_blk(pool: &Pool) -> anyhow::Result<BlockPool> {
    BlockPool::open(&pool.path)
        .with_context(|| format!("opening block pool {}", pool.path.display()))
}

fn open_region(pool: &Pool) -> anyhow::Result<Region> {
    Region::open(&pool.path).with_context(|| format!("mapping {}", pool.path.display()))
}

fn verdict(consistent: bool) -> &'static str {
    if consistent {
        "consistent"
    } else {
        "not consistent"
    }
}
