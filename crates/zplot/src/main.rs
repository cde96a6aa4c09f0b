use clap::Parser;
use zplot::{config::Config, logging, pipeline};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    logging::init(&config.log_level, config.log_format);
    pipeline::run(config).await
}
