#[tokio::main]
async fn main() -> anyhow::Result<()> {
    notedraft::cli::run().await
}
