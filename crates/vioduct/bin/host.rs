use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vioduct::config::{DEFAULT_MAX_STREAMS, Limits};
use vioduct::endpoint::Endpoint;
use vioduct::host::HostProxy;
use vioduct_wire::DEFAULT_FRAME_CAP;

/// Egress side of the vioduct tunnel. Runs on the VM host, demultiplexes
/// the streams arriving over the virtio-serial port, and opens the real
/// TCP connections.
#[derive(Parser, Debug)]
#[command(name = "vioduct-host", version, about)]
struct Args {
    /// Transport endpoint: the virtio-serial backend, usually a unix socket
    #[arg(long)]
    transport: PathBuf,
    /// Number of concurrently multiplexed streams
    #[arg(long, default_value_t = DEFAULT_MAX_STREAMS)]
    max_streams: usize,
    /// Per-frame payload cap in bytes; must match the guest side
    #[arg(long, default_value_t = DEFAULT_FRAME_CAP)]
    frame_cap: usize,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let limits = Limits { max_streams: args.max_streams, frame_cap: args.frame_cap };

    let endpoint = match Endpoint::open(&args.transport) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!(error = %e, "setup failed");
            return ExitCode::FAILURE;
        }
    };
    let mut proxy = match HostProxy::new(endpoint, limits) {
        Ok(proxy) => proxy,
        Err(e) => {
            error!(error = %e, "setup failed");
            return ExitCode::FAILURE;
        }
    };

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        if let Err(e) = ctrlc::set_handler(move || running.store(false, Ordering::Relaxed)) {
            error!(error = %e, "install signal handler");
            return ExitCode::FAILURE;
        }
    }

    info!(
        transport = %args.transport.display(),
        streams = args.max_streams,
        "vioduct host proxy up"
    );
    match proxy.run(&running) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "transport failed");
            ExitCode::FAILURE
        }
    }
}
