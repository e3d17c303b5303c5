//! Keeps a set of Discord webhook messages in sync with the live state of one
//! or more game servers.
//!
//! Every server config in the config directory gets one producer and one
//! dispatch worker per [`section::Section`]. Producers poll the status API and
//! hand rendered snapshots to their worker, which creates or edits the
//! section's webhook message and remembers its id across restarts.

pub mod api;
pub mod builders;
pub mod config;
pub mod content;
pub mod dispatch;
pub mod error;
pub mod rendezvous;
pub mod scheduler;
pub mod section;
pub mod store;
pub mod supervisor;
pub mod webhook;

use log::{info, warn};
use reqwest::Client;
use std::{path::Path, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

pub use crate::error::Error;
pub use crate::supervisor::Supervisor;

/// Timeout for a single HTTP request to the status API or the webhook.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Serves every server configured in `config_dir` until `token` is cancelled.
///
/// # Errors
///
/// Fails when the config directory cannot be read or the HTTP client cannot
/// be built. Problems with a single server are logged and skip that server.
pub async fn run(config_dir: &Path, token: CancellationToken) -> Result<(), Error> {
    info!("Reading server configs from {}", config_dir.display());

    let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
    let webhook = Arc::new(webhook::DiscordWebhook::new(client.clone()));
    let mut supervisor = Supervisor::new(builders::registry(), webhook, token)?;

    let started = supervisor.start_all(config_dir, &client).await?;
    if started == 0 {
        warn!("No usable server config in {}", config_dir.display());
    }

    supervisor.run().await;
    Ok(())
}
