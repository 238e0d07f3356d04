use clap::Parser;
use std::path::PathBuf;

/// Panda debug adapter.
///
/// Speaks DAP over stdio and relays requests to the Panda debug server.
#[derive(Debug, Parser)]
#[command(name = "panda-dap", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `PANDA_CONFIG` is used as a fallback. When neither are provided
    /// the adapter uses in-memory defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Debug server port used when a launch request does not name one.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = panda_config::PandaConfig::load_or_default(cli.config, "panda-dap");
    if let Some(port) = cli.port {
        config.debug.port = port;
    }
    // stdout carries DAP frames; logs must stay off it.
    panda_config::init_tracing(&config.logging);
    tracing::info!(target: "panda.dap", port = config.debug.port, "starting debug adapter");

    panda_dap::server::run_stdio(config.debug).await
}
