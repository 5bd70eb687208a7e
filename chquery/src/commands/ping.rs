use clap::Parser;
use tracing::info;

use super::common::ClickHouseConfig;

#[derive(Debug, thiserror::Error)]
pub(crate) enum Error {
    #[error(transparent)]
    Client(#[from] chclient::Error),
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Parser)]
pub(crate) struct Config {
    /// Common ClickHouse config
    #[clap(flatten)]
    clickhouse_config: ClickHouseConfig,
}

pub(crate) async fn command(config: Config) -> Result<()> {
    let client = config.clickhouse_config.client()?;
    client.ping().await?;
    info!(addr = %client.addr(), "ping succeeded");
    println!("OK");
    Ok(())
}
