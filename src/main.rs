use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use bodega::{config, facade, logging};

#[derive(Parser, Debug)]
#[command(name = "bodega", about = "Local HLS caching proxy", version)]
struct Cli {
    /// Config file path
    #[arg(short = 'c')]
    config: Option<PathBuf>,

    /// Listener port (overrides the config file)
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Remote URLs to print in proxied form after startup
    urls: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => config::load(path)?,
        None => config::Config::default(),
    };
    if let Some(port) = cli.port {
        cfg.proxy.port = port;
    }

    logging::init(&cfg.logger, cli.verbose)?;
    cfg.proxy.validate()?;

    log::info!("bodega starting on 127.0.0.1:{}", cfg.proxy.port);
    facade::start_server(cfg.proxy.clone()).await?;

    for url in &cli.urls {
        println!("{}", facade::convert_url(url, true));
    }

    tokio::signal::ctrl_c().await?;
    facade::stop_server().await;
    Ok(())
}
