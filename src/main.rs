//! courier-flow server binary

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_flow::server::run().await
}
