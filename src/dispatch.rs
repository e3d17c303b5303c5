use log::{error, info};
use std::sync::Arc;
use tokio::select;
use tokio_util::sync::CancellationToken;

use crate::error::StoreError;
use crate::rendezvous::Intake;
use crate::scheduler::UpdatePayload;
use crate::section::{Job, MessageId};
use crate::store::{SharedStore, flush_on_exit};
use crate::webhook::Dispatcher;

/// Consumes one section's payloads and records the resulting message ids.
pub struct DispatchWorker {
    job: Job,
    dispatcher: Arc<Dispatcher>,
    store: SharedStore,
    intake: Intake<UpdatePayload>,
    token: CancellationToken,
}

impl DispatchWorker {
    pub fn new(
        job: Job,
        dispatcher: Arc<Dispatcher>,
        store: SharedStore,
        intake: Intake<UpdatePayload>,
        token: CancellationToken,
    ) -> Self {
        DispatchWorker {
            job,
            dispatcher,
            store,
            intake,
            token,
        }
    }

    /// Runs until the producer stops or the token is cancelled, then saves
    /// the store unconditionally.
    ///
    /// A dispatch already under way is allowed to finish so that the id of a
    /// message created during shutdown is still recorded.
    pub async fn run(mut self) {
        loop {
            let payload = select! {
                payload = self.intake.recv() => match payload {
                    Some(payload) => payload,
                    None => {
                        info!("{} producer finished", self.job);
                        break;
                    }
                },
                () = self.token.cancelled() => break,
            };

            if let Err(e) = self.dispatch_one(payload).await {
                error!("{} failed to persist message ID: {e}", self.job);
            }
        }

        flush_on_exit(&self.store).await;
        info!("{} dispatch worker stopped", self.job);
    }

    /// Publishes one payload, records the returned id and flushes the store
    /// if anything changed.
    pub async fn dispatch_one(
        &self,
        mut payload: UpdatePayload,
    ) -> Result<Option<MessageId>, StoreError> {
        let section = payload.job.section;
        if payload.last_message_id.is_none() {
            payload.last_message_id = self.store.lock().await.get(section).existing();
        }

        let id = self
            .dispatcher
            .send(
                &payload.job,
                &payload.webhook_target,
                payload.last_message_id,
                payload.content,
                payload.embed,
            )
            .await;

        let mut store = self.store.lock().await;
        if let Some(id) = id {
            store.set(section, id)?;
        }
        store.flush().await?;
        Ok(id)
    }
}
