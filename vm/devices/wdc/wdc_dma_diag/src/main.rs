// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Runs DMA lock and transaction scenarios against the emulated driver
//! service and prints the resulting page descriptors.

#![forbid(unsafe_code)]

use anyhow::Context;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use wdc_defs::CardHandle;
use wdc_defs::DmaDirection;
use wdc_defs::DmaOptions;
use wdc_defs::PAGE_SIZE;
use wdc_defs::PhysicalSegment;
use wdc_dma::DmaChunk;
use wdc_dma::DmaConfig;
use wdc_dma::DmaContext;
use wdc_dma::TransferStatus;
use wdc_dma::device::InterruptParameters;
use wdc_dma::emulated::EmulatedConfig;
use wdc_dma::emulated::EmulatedDevice;
use wdc_dma::emulated::EmulatedService;
use wdc_dma::emulated::UserPages;
use wdc_dma::memory::MemoryBlock;

/// Where caller memory is pretended to be mapped.
const USER_VA: u64 = 0x7f00_0000_0000;

#[derive(Parser)]
#[clap(about = "WDC DMA buffer and transaction diagnostics")]
struct Options {
    /// Log at debug level. Otherwise RUST_LOG applies, defaulting to info.
    #[clap(short, long, global = true)]
    verbose: bool,
    /// Page size of the emulated system.
    #[clap(long, global = true, default_value_t = PAGE_SIZE, value_parser = parse_number)]
    page_size: usize,
    /// Hand out physically adjacent frames for scatter/gather memory.
    #[clap(long, global = true)]
    no_scatter: bool,
    /// Treat all memory as cache coherent.
    #[clap(long, global = true)]
    coherent: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lock a driver-allocated contiguous buffer.
    Contig {
        /// Buffer size in bytes.
        #[clap(long, value_parser = parse_number)]
        size: usize,
        #[clap(long, value_enum, default_value_t = Direction::Bidirectional)]
        direction: Direction,
        /// Map the buffer cached.
        #[clap(long)]
        allow_cache: bool,
        /// Attach to the buffer by global handle, as a second process would.
        #[clap(long)]
        share: bool,
    },
    /// Lock caller memory as a scatter/gather list.
    Sg {
        /// Bytes to lock.
        #[clap(long, value_parser = parse_number)]
        size: usize,
        /// Offset of the buffer within its first page.
        #[clap(long, default_value_t = 0, value_parser = parse_number)]
        offset: usize,
        #[clap(long, value_enum, default_value_t = Direction::Bidirectional)]
        direction: Direction,
        /// Do not merge physically adjacent pages.
        #[clap(long)]
        no_merge: bool,
    },
    /// Run a chunked transaction to completion.
    Transaction {
        /// Bytes to transfer.
        #[clap(long, value_parser = parse_number)]
        size: usize,
        /// Largest chunk for scatter/gather transactions.
        #[clap(long, value_parser = parse_number)]
        max_transfer: Option<usize>,
        /// Use a driver-allocated contiguous buffer.
        #[clap(long)]
        contiguous: bool,
        /// Physical alignment of a contiguous buffer.
        #[clap(long, default_value_t = 0, value_parser = parse_number)]
        alignment: usize,
        /// Offset of the buffer within its first page.
        #[clap(long, default_value_t = 0, value_parser = parse_number)]
        offset: usize,
        #[clap(long, value_enum, default_value_t = Direction::ToDevice)]
        direction: Direction,
        /// Enable interrupts for the transaction.
        #[clap(long)]
        interrupts: bool,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Direction {
    ToDevice,
    FromDevice,
    Bidirectional,
}

impl Direction {
    fn options(self) -> DmaOptions {
        DmaOptions::new().with_direction(match self {
            Direction::ToDevice => DmaDirection::ToDevice,
            Direction::FromDevice => DmaDirection::FromDevice,
            Direction::Bidirectional => DmaDirection::Bidirectional,
        })
    }
}

fn parse_number(s: &str) -> Result<usize, std::num::ParseIntError> {
    match s.strip_prefix("0x") {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => s.parse(),
    }
}

fn print_segments(segments: &[PhysicalSegment]) {
    for (index, segment) in segments.iter().enumerate() {
        println!(
            "  [{index:3}] {:#014x} {:#8x} bytes",
            segment.physical_address, segment.byte_count
        );
    }
}

fn print_chunk(chunk: &DmaChunk<'_>) {
    println!(
        "chunk {} at offset {:#x}: {:#x} bytes",
        chunk.index(),
        chunk.offset(),
        chunk.len()
    );
    print_segments(chunk.segments());
}

fn main() -> anyhow::Result<()> {
    let opts = Options::parse();

    let filter = if opts.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let service = EmulatedService::new(EmulatedConfig {
        page_size: opts.page_size,
        scatter_pages: !opts.no_scatter,
        coherent: opts.coherent,
        ..Default::default()
    })
    .context("invalid emulated system configuration")?;
    let service = Arc::new(service);
    let context = DmaContext::with_config(
        service.clone(),
        DmaConfig {
            page_size: opts.page_size,
            ..Default::default()
        },
    )?;

    match opts.command {
        Command::Contig {
            size,
            direction,
            allow_cache,
            share,
        } => {
            let options = direction.options().with_allow_cache(allow_cache);
            let buffer = context
                .lock_contiguous(None, options, size)
                .context("failed to lock contiguous buffer")?;
            println!(
                "contiguous buffer {}: {:#x} bytes at {:#x}",
                buffer.token(),
                buffer.byte_count(),
                buffer.user_address()
            );
            print_segments(buffer.segments());

            if share {
                let handle = buffer
                    .shared_handle()
                    .context("buffer has no global handle")?;
                let attached = context
                    .attach_shared_buffer(handle)
                    .context("failed to attach to shared buffer")?;
                println!("attached by global handle {handle} as {}", attached.token());
                print_segments(attached.segments());
                attached.unlock().context("failed to unlock attached buffer")?;
            }
            buffer.unlock().context("failed to unlock buffer")?;
        }
        Command::Sg {
            size,
            offset,
            direction,
            no_merge,
        } => {
            let memory = MemoryBlock::new(UserPages::new(USER_VA + offset as u64, size));
            let options = direction
                .options()
                .with_disable_merge_adjacent_pages(no_merge);
            let buffer = context
                .lock_scatter_gather(None, &memory, options, size)
                .context("failed to lock scatter/gather buffer")?;
            println!(
                "scatter/gather buffer {}: {:#x} bytes at {:#x}, {} of {} descriptors{}",
                buffer.token(),
                buffer.byte_count(),
                buffer.user_address(),
                buffer.segments().len(),
                buffer.segment_capacity(),
                if buffer.options().large_buffer() {
                    " (large buffer)"
                } else {
                    ""
                }
            );
            print_segments(buffer.segments());
            buffer.unlock().context("failed to unlock buffer")?;
        }
        Command::Transaction {
            size,
            max_transfer,
            contiguous,
            alignment,
            offset,
            direction,
            interrupts,
        } => {
            let mut device = EmulatedDevice::new(CardHandle(1));
            let params = InterruptParameters::default();
            let interrupt = interrupts.then_some(&params);
            let options = direction.options();
            let memory;
            let mut transaction = if contiguous {
                context.init_transaction_contiguous(
                    &mut device,
                    options,
                    size,
                    interrupt,
                    alignment,
                )
            } else {
                memory = MemoryBlock::new(UserPages::new(USER_VA + offset as u64, size));
                context.init_transaction_scatter_gather(
                    &mut device,
                    &memory,
                    options,
                    size,
                    interrupt,
                    max_transfer.unwrap_or(size),
                    size_of::<PhysicalSegment>(),
                )
            }
            .context("failed to initialize transaction")?;

            if direction != Direction::FromDevice {
                transaction.sync_for_device()?;
            }
            transaction
                .execute(print_chunk)
                .context("failed to execute transaction")?;
            while transaction
                .check_completion_and_advance(true)
                .context("completion check failed")?
                == TransferStatus::MoreProcessingRequired
            {}
            if direction != Direction::ToDevice {
                transaction.sync_for_cpu()?;
            }
            println!(
                "transferred {:#x} bytes in {} chunks",
                transaction.bytes_transferred(),
                transaction.chunk_index() + 1
            );

            transaction.release().context("failed to release transaction")?;
            transaction
                .uninit()
                .context("failed to uninitialize transaction")?;
        }
    }

    tracing::debug!(
        free_pages = service.free_pages(),
        records = context.outstanding_records(),
        "scenario finished"
    );
    anyhow::ensure!(
        service.outstanding_pins() == 0,
        "{} pins leaked",
        service.outstanding_pins()
    );
    Ok(())
}
