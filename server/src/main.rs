#[tokio::main]
async fn main() -> std::io::Result<()> {
    support_bridge::app::run().await
}
