//! rdx server entry point.
//!
//! ```text
//! rdx-server                    Run in the foreground
//! rdx-server --config <path>    Load a custom config TOML
//! rdx-server --listen <addr>    Override the listen address
//! rdx-server --gen-config       Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rdx_server::config::ServerConfig;
use rdx_server::service::RdxServerService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "rdx-server", about = "rdx adaptive screen-update server")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "rdx-server.toml")]
    config: PathBuf,

    /// Listen address, overrides `network.listen`.
    #[arg(short, long)]
    listen: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        let text = toml::to_string_pretty(&ServerConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let mut config = ServerConfig::load(&cli.config);
    if let Some(listen) = cli.listen {
        config.network.listen = listen;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("rdx-server v{}", env!("CARGO_PKG_VERSION"));
    info!("listen: {}", config.network.listen);
    info!("encodings: {:?}", config.encoding.encodings);
    info!(
        "test pattern: {} window(s) at {}x{}, {} fps",
        config.test_pattern.windows,
        config.test_pattern.width,
        config.test_pattern.height,
        config.test_pattern.fps
    );

    let service = RdxServerService::new(config);
    let stop = service.stop_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.store(false, std::sync::atomic::Ordering::SeqCst);
    });

    service.run().await?;

    Ok(())
}
