use anyhow::Result;
use clap::Parser;
use pier::{
    config::{Cli, PierConfig},
    telemetry::Telemetry,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = PierConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        tenant_command = %config.tenant_command,
        proxy_sites_dir = %config.proxy_sites_dir.display(),
        operator_auth = config.operator_token.is_some(),
        "starting pier"
    );

    pier::run(config, Some(telemetry.metrics_handle())).await
}
