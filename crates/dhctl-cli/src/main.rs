//! dhctl
//!
//! Converges Deckhouse clusters with their configuration, locally or as a
//! gRPC server.

use clap::Parser;

use dhctl_cli::Cli;
use dhctl_common::telemetry::{init_tracing_with_layer, ExtraLayer};
use dhctl_server::LogSink;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // workers forward their logs into the operation stream
    let log_sink = cli.is_worker().then(LogSink::new);
    let forward = log_sink.as_ref().map(|sink| Box::new(sink.layer()) as ExtraLayer);
    init_tracing_with_layer(cli.telemetry(), forward)?;

    cli.run(log_sink).await?;
    Ok(())
}
