mod workers;

use peerbeam::utils::shutdown::Shutdown;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use workers::args::{Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();
    let settings = args.settings()?;

    // webrtc_ice reports late STUN responses as "unknown TransactionID"
    // warnings, which are harmless.
    let filter = match args.verbose {
        0 => "warn,peerbeam=info,webrtc_ice::agent=error",
        1 => "info,webrtc_ice::agent=error",
        2 => "debug,webrtc_ice::agent=error",
        _ => "trace",
    };
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let shutdown = Shutdown::new();

    // Ctrl+C handler
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        shutdown_clone.cancel();
    });

    match args.command {
        Command::Demo { files, .. } => workers::demo::run(settings, files, shutdown).await,
    }
}
