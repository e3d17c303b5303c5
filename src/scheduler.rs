use log::{debug, error, info, warn};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::{
    select,
    time::{Instant, sleep},
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::api::ApiClient;
use crate::config::Config;
use crate::content::{BuilderRegistry, Embed};
use crate::error::Error;
use crate::rendezvous::Handoff;
use crate::section::{Job, MessageId, SectionConfig};

/// Shortest pause between two publishes of the same section.
const MIN_REFRESH_SLEEP: Duration = Duration::from_secs(1);

/// A snapshot of one section, handed from its producer to its dispatch worker.
#[derive(Debug, Clone)]
pub struct UpdatePayload {
    pub job: Job,
    pub webhook_target: Url,
    /// Filled in by the dispatch worker from the message-id store.
    pub last_message_id: Option<MessageId>,
    pub content: Option<String>,
    pub embed: Option<Embed>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    WaitingConfig,
    DisabledSleep,
    Polling,
    Terminated,
}

/// Backoff of 1, 2, .., `steps` units, then starting over.
#[derive(Debug, Clone)]
pub struct CyclicBackoff {
    step: u32,
    steps: u32,
    unit: Duration,
}

impl CyclicBackoff {
    pub fn new(steps: u32, unit: Duration) -> Self {
        CyclicBackoff {
            step: 0,
            steps: steps.max(1),
            unit,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.step = self.step % self.steps + 1;
        self.unit * self.step
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }
}

impl Default for CyclicBackoff {
    fn default() -> Self {
        CyclicBackoff::new(5, Duration::from_secs(1))
    }
}

/// Periodically builds one section and hands the result to its dispatch worker.
pub struct Producer {
    job: Job,
    config_path: PathBuf,
    config: Arc<Config>,
    last_reload: Instant,
    section: SectionConfig,
    registry: Arc<BuilderRegistry>,
    api: Arc<ApiClient>,
    handoff: Handoff<UpdatePayload>,
    backoff: CyclicBackoff,
    token: CancellationToken,
}

impl Producer {
    pub fn new(
        job: Job,
        config_path: PathBuf,
        config: Arc<Config>,
        registry: Arc<BuilderRegistry>,
        api: Arc<ApiClient>,
        handoff: Handoff<UpdatePayload>,
        token: CancellationToken,
    ) -> Result<Self, Error> {
        let section = SectionConfig::derive(&config, job.section, &registry)?;
        Ok(Producer {
            job,
            config_path,
            config,
            last_reload: Instant::now(),
            section,
            registry,
            api,
            handoff,
            backoff: CyclicBackoff::default(),
            token,
        })
    }

    /// Runs until cancelled, until the dispatch worker goes away, or until a
    /// config reload fails.
    ///
    /// # Errors
    ///
    /// Returns the config error that terminated this job. Other jobs are not
    /// affected by it.
    pub async fn run(mut self) -> Result<(), Error> {
        let mut state = if self.section.enabled {
            ProducerState::Polling
        } else {
            ProducerState::DisabledSleep
        };

        loop {
            state = match state {
                ProducerState::WaitingConfig => {
                    if let Err(e) = self.reload_if_due().await {
                        error!(
                            "{} invalid config {}: {e}. Stopping this section",
                            self.job,
                            self.config_path.display()
                        );
                        return Err(e);
                    }
                    if self.section.enabled {
                        ProducerState::Polling
                    } else {
                        ProducerState::DisabledSleep
                    }
                }
                ProducerState::DisabledSleep => {
                    let delay = self.config.settings.disabled_sleep();
                    debug!("{} is disabled, sleeping {delay:?}", self.job);
                    self.pause(delay).await
                }
                ProducerState::Polling => self.poll().await,
                ProducerState::Terminated => {
                    info!("{} producer stopped", self.job);
                    return Ok(());
                }
            };
        }
    }

    async fn poll(&mut self) -> ProducerState {
        let started = Instant::now();

        let built = select! {
            built = self.section.builder.build(&self.job, &self.config, &self.api) => built,
            () = self.token.cancelled() => return ProducerState::Terminated,
        };

        let rendered = match built {
            Ok(rendered) => rendered,
            Err(e) => {
                let delay = self.backoff.next_delay();
                warn!("{} failed to build content: {e}. Retrying in {delay:?}", self.job);
                return self.pause(delay).await;
            }
        };
        self.backoff.reset();

        let payload = UpdatePayload {
            job: self.job.clone(),
            webhook_target: self.config.discord.webhook_url.clone(),
            last_message_id: None,
            content: rendered.content,
            embed: rendered.embed,
        };
        let sent = select! {
            sent = self.handoff.send(payload) => sent,
            () = self.token.cancelled() => return ProducerState::Terminated,
        };
        if sent.is_err() {
            warn!("{} dispatch worker is gone", self.job);
            return ProducerState::Terminated;
        }

        let delay = self
            .section
            .refresh_interval
            .saturating_sub(started.elapsed())
            .max(MIN_REFRESH_SLEEP);
        info!("Sleeping {} for {delay:?}", self.job);
        self.pause(delay).await
    }

    /// Interruptible sleep.
    async fn pause(&self, delay: Duration) -> ProducerState {
        select! {
            () = sleep(delay) => ProducerState::WaitingConfig,
            () = self.token.cancelled() => ProducerState::Terminated,
        }
    }

    async fn reload_if_due(&mut self) -> Result<(), Error> {
        if self.last_reload.elapsed() < self.config.settings.reload_interval() {
            return Ok(());
        }

        let config = Config::read(&self.config_path).await?;
        self.section = SectionConfig::derive(&config, self.job.section, &self.registry)?;
        self.config = Arc::new(config);
        self.last_reload = Instant::now();
        debug!("{} reloaded {}", self.job, self.config_path.display());
        Ok(())
    }
}
