//! gpu-suballoc: drive a GPU memory pool with a simulated frame loop.
//!
//! Runs the sub-allocator over host memory, with worker tasks allocating and
//! freeing per frame and a fake GPU queue completing epochs late and out of
//! order. Prints the final pool report.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use gpu_suballoc::config::{Cli, Config};
use gpu_suballoc::gpu::HostMemory;
use gpu_suballoc::pool::new_shared_pool;
use gpu_suballoc::sim::Simulator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "gpu_suballoc=debug"
    } else {
        "gpu_suballoc=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("gpu-suballoc v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(&cli.config)?;
    if let Some(frames) = cli.frames {
        config.sim.frames = frames;
    }
    if let Some(workers) = cli.workers {
        config.sim.workers = workers;
    }

    info!(
        initial_size = config.pool.initial_size,
        chunk_size = config.pool.chunk_size(),
        allow_growth = config.pool.allow_growth,
        max_size = ?config.pool.max_size,
        "Pool configuration"
    );

    let memory = Arc::new(HostMemory::new());
    let pool = new_shared_pool(config.pool.clone(), memory.clone(), memory.clone())?;

    let report = Simulator::new(pool, config.sim.clone()).run().await?;
    let transfers = memory.transfer_stats();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let stats = &report.final_stats;
        println!("frames:               {}", report.frames);
        println!("allocations:          {}", report.allocations);
        println!("frees:                {}", report.frees);
        println!("failed allocations:   {}", report.failed_allocations);
        println!("corrupted:            {}", report.corrupted);
        println!("peak backing store:   {} bytes", report.peak_backing_store_size);
        println!("growths:              {}", stats.growth_count);
        println!("chunks:               {} ({} retired)", stats.chunk_count, stats.retired_chunks);
        println!(
            "growth copies:        {} ({} bytes)",
            transfers.total_copies, transfers.total_bytes
        );
    }

    if report.corrupted > 0 {
        anyhow::bail!("{} allocations were reused while live", report.corrupted);
    }
    Ok(())
}
