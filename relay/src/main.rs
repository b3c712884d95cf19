use anyhow::Result;
use codedrop_relay::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    run_cli().await
}
