#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tutorchat::run().await
}
