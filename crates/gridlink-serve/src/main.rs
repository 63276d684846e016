// ABOUTME: Entry point for the gridlink-serve local service tier
// ABOUTME: Loads settings, optionally writes a template, then serves until interrupted

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use gridlink_client::Settings;
use gridlink_serve::ServeConfig;

#[derive(Parser)]
#[command(name = "gridlink-serve", about = "Run a local gridlink service tier")]
struct Cli {
    /// Settings file (defaults to ~/.config/gridlink/config.toml)
    #[arg(long, short = 'c', env = "GRIDLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Write a settings template to the config path and exit
    #[arg(long)]
    init: bool,

    /// Heartbeat period handed to registering applications, in milliseconds
    #[arg(long, default_value_t = 1000)]
    heartbeat_ms: u64,

    /// Bind an adapter that answers every command with SUCCESS
    #[arg(long)]
    demo_adapter: bool,

    /// Log to ~/.config/gridlink/gridlink-serve.log instead of stderr
    #[arg(long)]
    log_file: bool,

    /// Keep client-core logs at WARN; only the service tier logs at INFO
    #[arg(long, conflicts_with = "log_file")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.log_file {
        gridlink_log::init_file("gridlink-serve");
    } else if cli.quiet {
        gridlink_log::init_for("gridlink_serve");
    } else {
        gridlink_log::init();
    }

    let path = cli.config.unwrap_or_else(Settings::config_path);

    if cli.init {
        if Settings::init(&path)? {
            println!("Wrote {}", path.display());
        } else {
            println!("{} already exists", path.display());
        }
        return Ok(());
    }

    let settings = if path.exists() {
        Settings::load_from(&path)?
    } else {
        Settings::default()
    };

    gridlink_serve::run(ServeConfig {
        settings,
        heartbeat_period: Duration::from_millis(cli.heartbeat_ms),
        demo_adapter: cli.demo_adapter,
    })
    .await
}
