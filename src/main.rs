use anyhow::Context;
use std::time::Duration;
use vavox::core::logging::init_logging;
use vavox::{build_client, ExchangeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Reads BITVAVO_* variables; credentials are optional for this demo
    #[cfg(feature = "env-file")]
    let config = ExchangeConfig::from_env_file("BITVAVO")?;
    #[cfg(not(feature = "env-file"))]
    let config = ExchangeConfig::from_env("BITVAVO")?;

    init_logging(config.debugging);

    let client = build_client(config)?;

    let time = client
        .rest()
        .time()
        .await
        .context("Failed to fetch server time over REST")?;
    println!("REST server time: {}", time.time);
    println!("Remaining budget: {}", client.remaining_budget());

    client
        .connect(Duration::from_secs(10))
        .await
        .context("Failed to open streaming session")?;

    let time = client.session().time().await?;
    println!("Socket server time: {}", time);

    if client.has_credentials() {
        let balance = client.session().balance(Some("EUR")).await?;
        println!("EUR balance: {}", balance);
    }

    client.dispose().await;
    Ok(())
}
