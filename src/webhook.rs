use async_trait::async_trait;
use log::{error, info, warn};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::time::sleep;
use url::Url;

use crate::content::Embed;
use crate::error::WebhookError;
use crate::section::{Job, MessageId};

/// Added on top of the delay a rate-limited response asks for.
pub const RATE_LIMIT_MARGIN: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookMessage {
    pub content: String,
    pub embeds: Vec<Embed>,
}

impl WebhookMessage {
    pub fn new(content: Option<String>, embed: Option<Embed>) -> Self {
        WebhookMessage {
            content: content.unwrap_or_default(),
            embeds: embed.into_iter().collect(),
        }
    }
}

/// Create and edit operations of a webhook endpoint.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn create(
        &self,
        target: &Url,
        message: &WebhookMessage,
    ) -> Result<MessageId, WebhookError>;

    async fn edit(
        &self,
        target: &Url,
        id: MessageId,
        message: &WebhookMessage,
    ) -> Result<(), WebhookError>;
}

/// Discord webhook API over HTTP.
pub struct DiscordWebhook {
    client: Client,
}

#[derive(Deserialize)]
struct CreatedMessage {
    id: String,
}

#[derive(Deserialize)]
struct RateLimitBody {
    retry_after: f64,
}

impl DiscordWebhook {
    pub fn new(client: Client) -> Self {
        DiscordWebhook { client }
    }

    async fn check(response: Response) -> Result<Response, WebhookError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(WebhookError::NotFound);
        }

        let retry_header = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<f64>().ok());
        let body = response.text().await.unwrap_or_default();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let secs = serde_json::from_str::<RateLimitBody>(&body)
                .map(|b| b.retry_after)
                .ok()
                .or(retry_header)
                .unwrap_or(1.0);
            return Err(WebhookError::RateLimited {
                retry_after: Duration::try_from_secs_f64(secs)
                    .unwrap_or(Duration::from_secs(1)),
            });
        }

        Err(WebhookError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

/// `{target}/messages/{id}`, tolerating a trailing slash on `target`.
fn message_url(target: &Url, id: MessageId) -> Result<Url, WebhookError> {
    let mut url = target.clone();
    url.path_segments_mut()
        .map_err(|()| WebhookError::Malformed(format!("{target} cannot be a base URL")))?
        .pop_if_empty()
        .push("messages")
        .push(&id.to_string());
    Ok(url)
}

fn unreachable(err: &reqwest::Error) -> WebhookError {
    WebhookError::Unreachable(err.to_string())
}

#[async_trait]
impl WebhookTransport for DiscordWebhook {
    async fn create(
        &self,
        target: &Url,
        message: &WebhookMessage,
    ) -> Result<MessageId, WebhookError> {
        let mut url = target.clone();
        url.query_pairs_mut().append_pair("wait", "true");

        let response = self
            .client
            .post(url)
            .json(message)
            .send()
            .await
            .map_err(|e| unreachable(&e))?;
        let created: CreatedMessage = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| WebhookError::Malformed(e.to_string()))?;

        created
            .id
            .parse()
            .map(MessageId)
            .map_err(|_| WebhookError::Malformed(format!("invalid message id {:?}", created.id)))
    }

    async fn edit(
        &self,
        target: &Url,
        id: MessageId,
        message: &WebhookMessage,
    ) -> Result<(), WebhookError> {
        let response = self
            .client
            .patch(message_url(target, id)?)
            .json(message)
            .send()
            .await
            .map_err(|e| unreachable(&e))?;
        Self::check(response).await.map(|_| ())
    }
}

/// Publishes payloads, absorbing every webhook failure.
pub struct Dispatcher {
    transport: Arc<dyn WebhookTransport>,
    unreachable_sleep: Duration,
}

impl Dispatcher {
    /// `unreachable_sleep` is how long to back off when the endpoint cannot be reached.
    pub fn new(transport: Arc<dyn WebhookTransport>, unreachable_sleep: Duration) -> Self {
        Dispatcher {
            transport,
            unreachable_sleep,
        }
    }

    /// Edits the existing message or creates a new one.
    ///
    /// Returns the id of the published message, or `None` when nothing was
    /// published this time (rate limited, unreachable, rejected).
    pub async fn send(
        &self,
        job: &Job,
        target: &Url,
        last_message_id: Option<MessageId>,
        content: Option<String>,
        embed: Option<Embed>,
    ) -> Option<MessageId> {
        let message = WebhookMessage::new(content, embed);

        if let Some(id) = last_message_id.and_then(MessageId::existing) {
            info!("{job} editing message ID={id}");
            match self.transport.edit(target, id, &message).await {
                Ok(()) => return Some(id),
                Err(WebhookError::NotFound) => {
                    warn!("{job} tried to edit non-existent message ID={id}");
                }
                Err(e) => return self.absorb(job, e).await,
            }
        }

        info!("{job} creating new webhook message");
        match self.transport.create(target, &message).await {
            Ok(id) => Some(id),
            Err(e) => self.absorb(job, e).await,
        }
    }

    async fn absorb(&self, job: &Job, err: WebhookError) -> Option<MessageId> {
        match err {
            WebhookError::RateLimited { retry_after } => {
                warn!("{job} was rate limited, retrying after {retry_after:.2?}");
                sleep(retry_after + RATE_LIMIT_MARGIN).await;
            }
            WebhookError::Unreachable(reason) => {
                warn!(
                    "{job} webhook unreachable ({reason}), sleeping {:?}",
                    self.unreachable_sleep
                );
                sleep(self.unreachable_sleep).await;
            }
            other => error!("{job} webhook call failed: {other}"),
        }
        None
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted webhook: pops one outcome per call, otherwise succeeds.
    pub struct FakeWebhook {
        pub calls: Mutex<Vec<String>>,
        outcomes: Mutex<VecDeque<WebhookError>>,
        next_id: Mutex<u64>,
    }

    impl FakeWebhook {
        pub fn new(first_id: u64) -> Self {
            FakeWebhook {
                calls: Mutex::new(Vec::new()),
                outcomes: Mutex::new(VecDeque::new()),
                next_id: Mutex::new(first_id),
            }
        }

        pub fn then(self, err: WebhookError) -> Self {
            self.outcomes.lock().unwrap().push_back(err);
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WebhookTransport for FakeWebhook {
        async fn create(&self, _: &Url, _: &WebhookMessage) -> Result<MessageId, WebhookError> {
            self.calls.lock().unwrap().push("create".to_string());
            if let Some(err) = self.outcomes.lock().unwrap().pop_front() {
                return Err(err);
            }
            let mut next = self.next_id.lock().unwrap();
            let id = MessageId(*next);
            *next += 1;
            Ok(id)
        }

        async fn edit(
            &self,
            _: &Url,
            id: MessageId,
            _: &WebhookMessage,
        ) -> Result<(), WebhookError> {
            self.calls.lock().unwrap().push(format!("edit {id}"));
            match self.outcomes.lock().unwrap().pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }
}
