use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = variant_store_service::Args::parse();
    variant_store_service::init_tracing(&args.log_level)?;
    variant_store_service::serve(args).await
}
