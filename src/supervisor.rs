//! Starts one producer and one dispatch worker per (server, section) and owns
//! their shutdown.

use log::{error, info, warn};
use reqwest::Client;
use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};
use tokio::{
    select,
    task::{self, JoinError, JoinSet},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::api::{ApiClient, HttpStatusApi, StatusApi};
use crate::config::{Config, ServerFile, discover_servers};
use crate::content::BuilderRegistry;
use crate::dispatch::DispatchWorker;
use crate::error::Error;
use crate::rendezvous::rendezvous;
use crate::scheduler::Producer;
use crate::section::{Job, Section};
use crate::store::{MessageIdStore, SharedStore, flush_on_exit};
use crate::webhook::{Dispatcher, WebhookTransport};

/// How long in-flight dispatches may take to finish once shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

enum TaskExit {
    Producer(Result<(), Error>),
    Worker,
}

pub struct Supervisor {
    registry: Arc<BuilderRegistry>,
    webhook: Arc<dyn WebhookTransport>,
    tasks: JoinSet<TaskExit>,
    owners: HashMap<task::Id, (Job, SharedStore)>,
    stores: Vec<SharedStore>,
    token: CancellationToken,
}

impl Supervisor {
    /// Fails if `registry` lacks a builder for any section.
    pub fn new(
        registry: BuilderRegistry,
        webhook: Arc<dyn WebhookTransport>,
        token: CancellationToken,
    ) -> Result<Self, Error> {
        registry.check_complete()?;
        Ok(Supervisor {
            registry: Arc::new(registry),
            webhook,
            tasks: JoinSet::new(),
            owners: HashMap::new(),
            stores: Vec::new(),
            token,
        })
    }

    /// Starts every server configured in `dir` against the real HTTP endpoints.
    ///
    /// Servers whose config does not load are logged and skipped.
    pub async fn start_all(&mut self, dir: &Path, client: &Client) -> Result<usize, Error> {
        let mut started = 0;
        for server in discover_servers(dir)? {
            let config = match Config::read(&server.path).await {
                Ok(config) => config,
                Err(e) => {
                    error!(
                        "{} invalid config {}: {e}. Skipping this server",
                        server.server,
                        server.path.display()
                    );
                    continue;
                }
            };
            let api = Arc::new(HttpStatusApi::new(client.clone(), &config.api));
            self.add_server(&server, config, api).await?;
            started += 1;
        }
        Ok(started)
    }

    /// Loads the server's message ids, probes its API and spawns its sections.
    pub async fn add_server(
        &mut self,
        server: &ServerFile,
        config: Config,
        api: Arc<dyn StatusApi>,
    ) -> Result<(), Error> {
        let name: Arc<str> = server.server.as_str().into();
        let store = MessageIdStore::load(name.clone(), config.message_id_path(&name))
            .await
            .shared();
        self.stores.push(store.clone());

        let api = Arc::new(ApiClient::new(name.clone(), api));
        match api.probe().await {
            Ok(()) => info!("{name} status API is reachable"),
            Err(e) => warn!("{name} status API check failed: {e}"),
        }

        let dispatcher = Arc::new(Dispatcher::new(
            self.webhook.clone(),
            config.settings.disabled_sleep(),
        ));
        let config = Arc::new(config);

        for section in Section::ALL {
            let job = Job::new(name.clone(), section);
            let (handoff, intake) = rendezvous();
            let token = self.token.child_token();

            let producer = Producer::new(
                job.clone(),
                server.path.clone(),
                config.clone(),
                self.registry.clone(),
                api.clone(),
                handoff,
                token.clone(),
            )?;
            let worker = DispatchWorker::new(
                job.clone(),
                dispatcher.clone(),
                store.clone(),
                intake,
                token,
            );

            let handle = self
                .tasks
                .spawn(async move { TaskExit::Producer(producer.run().await) });
            self.owners.insert(handle.id(), (job.clone(), store.clone()));
            let handle = self.tasks.spawn(async move {
                worker.run().await;
                TaskExit::Worker
            });
            self.owners.insert(handle.id(), (job, store.clone()));
        }

        info!("{name} started {} sections", Section::ALL.len());
        Ok(())
    }

    /// Runs until the token is cancelled or every task has stopped, then
    /// saves every server's message ids.
    pub async fn run(mut self) {
        loop {
            let joined = select! {
                () = self.token.cancelled() => {
                    info!("Shutdown requested");
                    break;
                }
                joined = self.tasks.join_next_with_id() => joined,
            };
            match joined {
                Some(joined) => self.reap(joined).await,
                None => {
                    info!("All sections stopped");
                    break;
                }
            }
        }

        self.shutdown().await;
    }

    async fn reap(&mut self, joined: Result<(task::Id, TaskExit), JoinError>) {
        match joined {
            Ok((id, exit)) => {
                let Some((job, _)) = self.owners.remove(&id) else {
                    return;
                };
                match exit {
                    TaskExit::Producer(Err(e)) => error!("{job} stopped: {e}"),
                    TaskExit::Producer(Ok(())) | TaskExit::Worker => {}
                }
            }
            Err(e) => {
                let Some((job, store)) = self.owners.remove(&e.id()) else {
                    return;
                };
                if e.is_panic() {
                    error!("{job} crashed: {e}");
                    flush_on_exit(&store).await;
                }
            }
        }
    }

    async fn shutdown(mut self) {
        self.token.cancel();

        let drained = timeout(SHUTDOWN_GRACE, async {
            while let Some(joined) = self.tasks.join_next_with_id().await {
                self.reap(joined).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("Sections still busy after {SHUTDOWN_GRACE:?}, aborting them");
            self.tasks.shutdown().await;
        }

        for store in &self.stores {
            flush_on_exit(store).await;
        }
        info!("Saved message IDs for {} servers", self.stores.len());
    }
}
