//! Background removal CLI

use bgremover::cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}
