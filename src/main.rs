use anyhow::Result;

use pca::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    run_cli().await
}
