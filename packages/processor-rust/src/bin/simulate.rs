//! Runs several processors against one in-memory stream and ownership store
//! and reports how the partitions ended up distributed.
//!
//! ```sh
//! simulate --partitions 8 --processors 3 --events-per-partition 50 --cycles 20
//! RUST_LOG=eventflow_processor=debug simulate --json-logs
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use eventflow_core::{EventData, PartitionOwnership, StreamScope};
use eventflow_processor::memory::{InMemoryEventStream, InMemoryOwnershipStore};
use eventflow_processor::{
    EventProcessor, EventProcessorOptions, LoadBalancingStrategy, ProcessErrorArgs,
    ProcessEventArgs,
};

const NAMESPACE: &str = "simulate.local";
const STREAM: &str = "events";
const CONSUMER_GROUP: &str = "simulation";

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "simulate")]
#[command(about = "Simulate processors balancing an in-memory stream")]
struct Args {
    /// Number of partitions in the stream.
    #[arg(long, default_value_t = 8, env = "EVENTFLOW_PARTITIONS")]
    partitions: usize,

    /// Number of competing processors.
    #[arg(long, default_value_t = 3, env = "EVENTFLOW_PROCESSORS")]
    processors: usize,

    /// Events published to each partition before the processors start.
    #[arg(long, default_value_t = 20, env = "EVENTFLOW_EVENTS_PER_PARTITION")]
    events_per_partition: usize,

    /// Balancing cycles to run before stopping.
    #[arg(long, default_value_t = 20, env = "EVENTFLOW_CYCLES")]
    cycles: u32,

    /// Milliseconds between balancing cycles.
    #[arg(long, default_value_t = 100, env = "EVENTFLOW_INTERVAL_MS")]
    interval_ms: u64,

    /// Claim the full fair share at once instead of one partition per cycle.
    #[arg(long, env = "EVENTFLOW_GREEDY")]
    greedy: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "EVENTFLOW_JSON_LOGS")]
    json_logs: bool,
}

#[derive(Serialize)]
struct ProcessorReport {
    identifier: String,
    events: u64,
    owned_partitions: usize,
}

#[derive(Serialize)]
struct Report {
    partitions: usize,
    events_published: usize,
    events_processed: u64,
    processors: Vec<ProcessorReport>,
    ownership: Vec<PartitionOwnership>,
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn options(args: &Args) -> EventProcessorOptions {
    let interval = Duration::from_millis(args.interval_ms.max(1));
    EventProcessorOptions {
        load_balancing_interval: interval,
        ownership_expiration: interval * 5,
        shutdown_timeout: Duration::from_secs(5),
        load_balancing_strategy: if args.greedy {
            LoadBalancingStrategy::Greedy
        } else {
            LoadBalancingStrategy::Balanced
        },
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    let stream = InMemoryEventStream::new(NAMESPACE, STREAM, args.partitions);
    for partition in 0..args.partitions {
        for n in 0..args.events_per_partition {
            stream.publish(&partition.to_string(), EventData::new(format!("event-{n}").into_bytes()))?;
        }
    }
    let store = Arc::new(InMemoryOwnershipStore::new());

    let mut processors = Vec::with_capacity(args.processors);
    for _ in 0..args.processors {
        let processor =
            EventProcessor::with_connection(CONSUMER_GROUP, store.clone(), stream.connection(), options(&args))
                .context("failed to build processor")?;
        let count = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&count);
        processor.set_process_event_handler(move |args: ProcessEventArgs| {
            let seen = Arc::clone(&seen);
            async move {
                if args.has_event() {
                    seen.fetch_add(1, Ordering::Relaxed);
                    args.update_checkpoint().await?;
                }
                Ok(())
            }
        })?;
        processor.set_process_error_handler(|args: ProcessErrorArgs| async move {
            tracing::warn!(
                partition_id = ?args.partition_id,
                operation = %args.operation,
                error = %args.error,
                "processing error"
            );
            Ok(())
        })?;
        processor.start().await?;
        processors.push((processor, count));
    }

    info!(cycles = args.cycles, "processors started");
    tokio::time::sleep(Duration::from_millis(args.interval_ms.max(1)) * args.cycles).await;

    let scope = StreamScope::new(NAMESPACE, STREAM, CONSUMER_GROUP);
    let ownership = store.snapshot(&scope);
    let reports: Vec<ProcessorReport> = processors
        .iter()
        .map(|(processor, count)| ProcessorReport {
            identifier: processor.identifier().to_string(),
            events: count.load(Ordering::Relaxed),
            owned_partitions: ownership
                .iter()
                .filter(|r| r.owner_id.as_deref() == Some(processor.identifier()))
                .count(),
        })
        .collect();

    for (processor, _) in &processors {
        processor.close().await?;
    }

    let report = Report {
        partitions: args.partitions,
        events_published: args.partitions * args.events_per_partition,
        events_processed: reports.iter().map(|r| r.events).sum(),
        processors: reports,
        ownership,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
