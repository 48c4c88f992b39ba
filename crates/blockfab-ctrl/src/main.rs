#![warn(missing_docs)]

//! `bfab` node agent binary.

use anyhow::Result;
use blockfab_ctrl::cli::Cli;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    tracing::info!("blockfab node agent starting...");

    Cli::parse().run().await
}
