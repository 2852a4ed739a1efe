use clap::Parser;
use log::{error, info, warn};
use server::clock::{Clock, SystemClock};
use server::config::{CleanupConfig, SettingBounds};
use server::network::{Server, ServerContext};
use server::registry::Registry;
use server::transport::ChannelTransport;
use server::words::WordCache;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Main-method of the application.
/// Parses command-line arguments, restores lobbies from a previous run, then
/// serves connections until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Command line arguments
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Seconds between sweeps for abandoned lobbies, 0 disables them
        #[clap(long, default_value = "90")]
        cleanup_interval: u64,
        /// Seconds a lobby may be empty before it is removed
        #[clap(long, default_value = "75")]
        inactivity_threshold: u64,
        /// File running lobbies are written to on shutdown and read from on start
        #[clap(long, default_value = "lobbies.json")]
        handoff_file: PathBuf,
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(Registry::new(Arc::clone(&clock)));
    let transport = Arc::new(ChannelTransport::new());
    let words = Arc::new(WordCache::new());

    match registry.load_handoff(&args.handoff_file, &words, transport.clone()) {
        Ok(0) => {}
        Ok(restored) => info!("Resumed {} lobbies from {}", restored, args.handoff_file.display()),
        Err(e) => warn!("Ignoring handoff file {}: {}", args.handoff_file.display(), e),
    }

    let cleanup = registry.launch_cleanup(CleanupConfig {
        interval: Duration::from_secs(args.cleanup_interval),
        inactivity_threshold: Duration::from_secs(args.inactivity_threshold),
    });

    let context = Arc::new(ServerContext {
        registry: Arc::clone(&registry),
        transport,
        words,
        clock,
        bounds: SettingBounds::default(),
    });
    let address = format!("{}:{}", args.host, args.port);
    let server = Server::bind(&address, context).await?;
    let server_handle = tokio::spawn(server.run());

    // Handle shutdown gracefully
    tokio::select! {
        result = server_handle => {
            match result {
                Ok(Err(e)) => error!("Server stopped: {}", e),
                Err(e) => error!("Server task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    if let Some(cleanup) = cleanup {
        cleanup.abort();
    }
    if let Err(e) = registry.save_handoff(&args.handoff_file) {
        error!("Failed to write handoff file: {}", e);
    }
    registry.shutdown_all();
    // Give writer tasks a moment to flush the shutdown notice.
    tokio::time::sleep(Duration::from_millis(200)).await;

    Ok(())
}
