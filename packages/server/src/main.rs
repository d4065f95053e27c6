#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Binary entry point for the civic map API server.

use std::path::PathBuf;

use civic_map_server::config::ServerConfig;
use clap::Parser;

#[derive(Parser)]
#[command(
    name = "civic_map_server",
    about = "Serve the civic map API with a look-aside cache"
)]
struct Cli {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to bind (overrides `BIND_ADDR`)
    #[arg(long)]
    bind: Option<String>,

    /// Port to bind (overrides `PORT`)
    #[arg(long)]
    port: Option<u16>,

    /// Frontend build directory to serve at `/`
    #[arg(long)]
    static_dir: Option<PathBuf>,
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    pretty_env_logger::init_custom_env("RUST_LOG");

    let cli = Cli::parse();

    let mut config = ServerConfig::load(cli.config.as_deref()).map_err(|e| {
        log::error!("{e}");
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
    })?;

    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.static_dir.is_some() {
        config.static_dir = cli.static_dir;
    }

    civic_map_server::run_server(config).await
}
