use clap::Parser;
use std::path::PathBuf;

/// Panda language-service relay.
///
/// Speaks LSP over stdio and keeps a resilient TCP connection to the Panda
/// language server.
#[derive(Debug, Parser)]
#[command(name = "panda-lsp", version, about)]
struct Cli {
    /// Path to a TOML config file.
    ///
    /// If unset, `PANDA_CONFIG` is used as a fallback.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Language server host.
    #[arg(long)]
    host: Option<String>,

    /// Language server port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = panda_config::PandaConfig::load_or_default(cli.config, "panda-lsp");
    if let Some(host) = cli.host {
        config.language_server.host = host;
    }
    if let Some(port) = cli.port {
        config.language_server.port = port;
    }
    panda_config::init_tracing(&config.logging);
    tracing::info!(
        target: "panda.lsp",
        host = %config.language_server.host,
        port = config.language_server.port,
        "starting language service relay"
    );

    panda_lsp::relay::run_stdio(config.language_server).await
}
