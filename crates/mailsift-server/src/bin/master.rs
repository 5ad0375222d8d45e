//! MailSift master - serves the work queue to remote workers

use anyhow::Result;
use mailsift_api::{create_router, MasterState};
use mailsift_common::config::Config;
use mailsift_core::{DirectoryIngest, JsonLinesSink, ResultSink};
use mailsift_queue::create_queue;
use mailsift_server::{cancel_on_ctrl_c, init_logging};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(&config.logging);
    config.validate_master()?;

    info!("Starting MailSift master...");

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let queue = create_queue(&config.queue, &cancel).await?;
    info!(backend = queue.name(), "Work queue ready");

    let sink: Arc<dyn ResultSink> = match &config.sink.path {
        Some(path) => Arc::new(JsonLinesSink::open(path).await?),
        None => Arc::new(JsonLinesSink::stdout()),
    };

    let state = Arc::new(MasterState::new(&config.master, queue.clone(), sink)?);
    state.spawn_handshake_sweeper(cancel.clone());

    // Import local mail files
    if let Some(ingest) = DirectoryIngest::from_config(&config.ingest) {
        let queue = queue.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = ingest.run(queue.as_ref(), &cancel).await {
                if !e.is_cancelled() {
                    error!("Directory ingest failed: {}", e);
                }
            }
        });
    }

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&config.master.bind).await?;
    info!("Listening for workers on {}", config.master.bind);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    cancel.cancel();
    queue.close().await;
    info!("MailSift master shutdown complete");

    Ok(())
}
