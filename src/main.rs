use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    vaultstrap::run().await
}
