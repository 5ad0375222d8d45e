//! MailSift worker - pulls mail from a master and parses it

use anyhow::Result;
use mailsift_common::config::Config;
use mailsift_core::{HeaderParser, Worker};
use mailsift_server::{cancel_on_ctrl_c, init_logging};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(&config.logging);
    config.validate_worker()?;

    let worker = Worker::new(&config.worker, Arc::new(HeaderParser::default()))?;
    info!(
        worker = %worker.id(),
        master = %config.worker.master_url,
        "Starting MailSift worker..."
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    worker.run(cancel).await?;
    info!("MailSift worker shutdown complete");

    Ok(())
}
