use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use vioduct::config::{DEFAULT_MAX_STREAMS, Limits};
use vioduct::endpoint::Endpoint;
use vioduct::guest::GuestProxy;
use vioduct_wire::DEFAULT_FRAME_CAP;

/// SOCKS5 front end of the vioduct tunnel. Runs inside the guest and
/// relays every client over the virtio-serial port to vioduct-host.
#[derive(Parser, Debug)]
#[command(name = "vioduct-guest", version, about)]
struct Args {
    /// Transport endpoint: the virtio-serial port, or a unix socket
    #[arg(long)]
    transport: PathBuf,
    /// Bind address for the SOCKS5 listener
    #[arg(long, default_value = "127.0.0.1:1080")]
    listen: SocketAddr,
    /// Number of concurrently multiplexed streams
    #[arg(long, default_value_t = DEFAULT_MAX_STREAMS)]
    max_streams: usize,
    /// Per-frame payload cap in bytes; must match the host side
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
    let mut proxy = match GuestProxy::new(args.listen, endpoint, limits) {
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
        listen = %args.listen,
        transport = %args.transport.display(),
        streams = args.max_streams,
        "vioduct guest proxy up"
    );
    match proxy.run(&running) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "transport failed");
            ExitCode::FAILURE
        }
    }
}
