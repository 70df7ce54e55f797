#[tokio::main]
async fn main() -> anyhow::Result<()> {
    clickwise::run().await
}
