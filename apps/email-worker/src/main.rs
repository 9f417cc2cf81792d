//! Email Delivery Worker - Entry Point
//!
//! Background worker that drives the queue processor: claims due messages
//! and delivers them through the configured providers.

use core_config::tracing::install_color_eyre;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    install_color_eyre();

    relay_email_worker::run().await
}
