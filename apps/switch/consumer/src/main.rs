//! Switch Consumer - Entry Point
//!
//! Consumes pacs.008 credit transfers from the Redis stream.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    switch_consumer::run().await
}
