//! ADPS Server - parameter server process for analysis clients.
//!
//! Serves the socket backend until a client sends the quit command or the
//! process receives SIGINT/SIGTERM, then writes the final per-function table
//! to the output file.

use adps_core::config::ServerOptions;
use adps_core::net::{NetConfig, NetInterface, SocketNet};
use adps_core::snapshot::{read_snapshot, SnapshotWriter};
use adps_core::store::{GlobalAnomalyStats, ParameterInterface, StatisticalParameterStore};
use adps_core::ServerConfig;
use anyhow::{Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "adps-server")]
#[command(about = "Parameter server for online anomaly detection")]
struct Args {
    /// Worker threads (<= 0 or omitted = available cores minus a reserve)
    #[arg(allow_negative_numbers = true)]
    threads: Option<i64>,

    /// File receiving the final parameter table
    #[arg(default_value = ServerConfig::DEFAULT_OUTPUT_FILE)]
    output: PathBuf,

    /// Endpoint to listen on
    #[arg(long, default_value = ServerConfig::DEFAULT_ADDRESS)]
    addr: String,

    /// Seconds between snapshots of the global model (disabled if omitted)
    #[arg(long)]
    snapshot_interval: Option<u64>,

    /// Snapshot file
    #[arg(long, default_value = ServerConfig::DEFAULT_SNAPSHOT_FILE)]
    snapshot_file: PathBuf,

    /// Seed the global model from the snapshot file if it exists
    #[arg(long)]
    restore: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn options(&self) -> ServerOptions {
        ServerOptions {
            threads: ServerOptions::resolve_threads(self.threads),
            output_file: self.output.clone(),
            address: self.addr.clone(),
            snapshot_interval: self.snapshot_interval.map(Duration::from_secs),
            snapshot_file: self.snapshot_file.clone(),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let opts = args.options();
    info!("Starting parameter server with {} worker threads", opts.threads);

    let store = Arc::new(load_store(&opts, args.restore)?);

    let mut net = SocketNet::new();
    net.set_parameter_store(store.clone());
    net.set_anomaly_stats(Arc::new(GlobalAnomalyStats::new()));
    net.initialize(&NetConfig::new(opts.threads, opts.address.clone()))
        .with_context(|| format!("Failed to start server on {}", opts.address))?;

    let token = net.shutdown_token();
    let signal_token = token.clone();
    ctrlc::set_handler(move || {
        info!("Shutdown signal received");
        signal_token.trigger();
    })
    .context("Failed to install signal handler")?;

    // Supervising scripts read the bound endpoint from stdout
    if let Some(addr) = net.local_addr() {
        println!("PS_ADDR=tcp://{}", addr);
    }

    let snapshots = match opts.snapshot_interval {
        Some(interval) => Some(SnapshotWriter::start(
            opts.snapshot_file.clone(),
            store.clone(),
            interval,
            token.clone(),
        )?),
        None => None,
    };

    let served = net.run();
    net.finalize()?;
    if let Some(writer) = snapshots {
        let written = writer.stop();
        info!("Wrote {} snapshots to {}", written, opts.snapshot_file.display());
    }
    served.context("Server loop failed")?;

    write_output(store.as_ref(), &opts)?;
    info!("Parameter server exited");
    Ok(())
}

fn load_store(opts: &ServerOptions, restore: bool) -> Result<StatisticalParameterStore> {
    if !restore {
        return Ok(StatisticalParameterStore::new());
    }
    match read_snapshot(&opts.snapshot_file)? {
        Some(snapshot) => {
            info!(
                "Restoring {} functions from snapshot taken at {}",
                snapshot.functions.len(),
                snapshot.taken_at
            );
            Ok(StatisticalParameterStore::restore(&snapshot.into_global()))
        }
        None => {
            warn!(
                "No snapshot at {}, starting empty",
                opts.snapshot_file.display()
            );
            Ok(StatisticalParameterStore::new())
        }
    }
}

fn write_output(store: &dyn ParameterInterface, opts: &ServerOptions) -> Result<()> {
    let file = File::create(&opts.output_file)
        .with_context(|| format!("Failed to create {}", opts.output_file.display()))?;
    let mut out = BufWriter::new(file);
    store.show(&mut out)?;
    info!(
        "Wrote {} functions to {}",
        store.len(),
        opts.output_file.display()
    );
    Ok(())
}
