use clap::Parser;
use linkwatch::AppConfig;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "linkwatch", version, about = "Multi-tenant link watcher")]
struct Cli {
    /// Path to config.toml
    #[arg(long, env = "LINKWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config and PORT)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_env(|key| std::env::var(key).ok())?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    linkwatch::serve(config).await
}
