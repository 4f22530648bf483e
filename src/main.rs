//! blobstore - inspect and edit a blob storage file

use anyhow::{Context, Result, bail};
use blobstore::blob::{
    AllocationStrategy, BlobStorage, ExactFit, FixedPercent, RecordHeader, RecordId, SizeBuckets,
};
use blobstore::config::{BlobStorageConfig, DEFAULT_BUFFER_POOL_FRAMES};
use blobstore::storage::DEFAULT_PAGE_SIZE;
use clap::{Parser as ClapParser, Subcommand, ValueEnum};
use std::io::{Read, Write};
use std::path::PathBuf;

/// blobstore - record-oriented blob storage over a paged file
#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Blob storage file (created if missing)
    #[arg(short, long)]
    file: PathBuf,

    /// Page size of the file; must match the size it was created with
    #[arg(short, long, default_value_t = DEFAULT_PAGE_SIZE)]
    page_size: usize,

    /// Pages cached in memory
    #[arg(long, default_value_t = DEFAULT_BUFFER_POOL_FRAMES)]
    buffer_frames: usize,

    /// Capacity policy for new and relocated records
    #[arg(short, long, value_enum, default_value = "exact")]
    strategy: Strategy,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Strategy {
    /// Reserve exactly the payload size
    Exact,
    /// Reserve 30% on top of the payload
    Percent,
    /// Round up to power-of-two buckets
    Buckets,
}

impl Strategy {
    fn build(self) -> Box<dyn AllocationStrategy> {
        match self {
            Strategy::Exact => Box::new(ExactFit::default()),
            Strategy::Percent => Box::new(FixedPercent::default()),
            Strategy::Buckets => Box::new(SizeBuckets::default()),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a record; prints the id it is stored under
    Put {
        /// Existing record to overwrite
        #[arg(long)]
        id: Option<u32>,
        /// Payload as a UTF-8 string
        #[arg(long, conflicts_with = "input")]
        value: Option<String>,
        /// Read the payload from a file ("-" for stdin)
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Print a record's payload to stdout
    Get { id: u32 },
    /// Delete a record
    Delete { id: u32 },
    /// Print storage statistics
    Stats,
    /// List every slot in file order
    Scan,
    /// Rebuild statistics from a full scan
    Recover,
}

fn record_id(raw: u32) -> Result<RecordId> {
    RecordId::from_raw(raw).with_context(|| format!("invalid record id {raw}"))
}

fn read_payload(value: Option<String>, input: Option<PathBuf>) -> Result<Vec<u8>> {
    match (value, input) {
        (Some(value), _) => Ok(value.into_bytes()),
        (None, Some(path)) if path.as_os_str() == "-" => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("Failed to read payload from stdin")?;
            Ok(buf)
        }
        (None, Some(path)) => {
            std::fs::read(&path).with_context(|| format!("Failed to read payload from {:?}", path))
        }
        (None, None) => bail!("put needs --value or --input"),
    }
}

fn describe(header: &RecordHeader) -> String {
    match header {
        RecordHeader::Actual {
            capacity,
            length,
            origin,
        } => match origin {
            Some(origin) => format!("length={length} capacity={capacity} origin={origin}"),
            None => format!("length={length} capacity={capacity}"),
        },
        RecordHeader::Moved { capacity, target } => format!("-> {target} capacity={capacity}"),
        RecordHeader::Deleted {
            capacity,
            relocated,
            ..
        } => format!("capacity={capacity}{}", if *relocated { " (was redirect)" } else { "" }),
        RecordHeader::Padding { capacity } => format!("capacity={capacity}"),
    }
}

fn run(storage: &BlobStorage, command: Command) -> Result<()> {
    match command {
        Command::Put { id, value, input } => {
            let payload = read_payload(value, input)?;
            let id = id.map(record_id).transpose()?;
            let stored = storage.write_record(id, &payload)?;
            println!("{}", stored.as_u32());
        }
        Command::Get { id } => {
            let payload = storage.read_record(record_id(id)?)?;
            std::io::stdout().write_all(&payload)?;
        }
        Command::Delete { id } => {
            storage.delete_record(record_id(id)?)?;
        }
        Command::Stats => {
            println!("version: {}", storage.storage_version());
            println!("page size: {}", storage.page_size());
            println!("{}", storage.statistics());
        }
        Command::Scan => {
            storage.for_each_record(|record| {
                println!(
                    "{:>10} {:<8} {}",
                    record.id.as_u32(),
                    record.state(),
                    describe(&record.header)
                );
                true
            })?;
        }
        Command::Recover => {
            let stats = storage.recover()?;
            println!("{stats}");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config = BlobStorageConfig::builder()
        .page_size(args.page_size)
        .buffer_pool_frames(args.buffer_frames)
        .build();
    let storage = BlobStorage::open_file(&args.file, args.strategy.build(), config)
        .with_context(|| format!("Failed to open blob storage at {:?}", args.file))?;

    let result = run(&storage, args.command);
    storage.close().context("Failed to close blob storage")?;
    result
}
