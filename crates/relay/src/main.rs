#[tokio::main]
async fn main() -> anyhow::Result<()> {
    relay::run().await
}
