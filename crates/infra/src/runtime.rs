//! Process-wide wiring: each core component is built once here and handed
//! out by reference.

use std::sync::Arc;

use tracing::info;

use storefront_hooks::HookManager;

use crate::config::CoreConfig;
use crate::health::HealthReport;
use crate::jobs::{JobQueue, QueueError};
use crate::plugins::{Plugin, PluginError, PluginManager};
use crate::resources::{InMemoryResources, ResourceServices};
use crate::scheduler::Scheduler;
use crate::store::{InMemoryStore, PluginStore, PostgresStore, ScheduleStore, StoreError, WebhookStore};
use crate::webhooks::{HttpTransport, WebhookDispatcher, WebhookError, WebhookTransport};
use crate::workers::{LogMailer, Mailer, WorkerDeps, register_workers};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Plugin(#[from] PluginError),
}

/// Persistence handles, one per concern. Usually all backed by the same store.
#[derive(Clone)]
pub struct Stores {
    pub webhooks: Arc<dyn WebhookStore>,
    pub plugins: Arc<dyn PluginStore>,
    pub schedules: Arc<dyn ScheduleStore>,
}

impl Stores {
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: WebhookStore + PluginStore + ScheduleStore + 'static,
    {
        Self {
            webhooks: store.clone(),
            plugins: store.clone(),
            schedules: store,
        }
    }

    pub fn in_memory() -> Self {
        Self::shared(Arc::new(InMemoryStore::new()))
    }
}

/// Collaborators the runtime does not own.
#[derive(Clone)]
pub struct Services {
    pub stores: Stores,
    pub resources: Arc<dyn ResourceServices>,
    pub mailer: Arc<dyn Mailer>,
    pub transport: Arc<dyn WebhookTransport>,
}

impl Services {
    /// Postgres when `DATABASE_URL` is set, in-memory otherwise; HTTP webhook
    /// transport; log-only mailer.
    pub async fn from_config(config: &CoreConfig) -> Result<Self, RuntimeError> {
        let stores = match config.database_url.as_deref() {
            Some(url) => {
                let store = PostgresStore::connect(url).await?;
                store.migrate().await?;
                info!("using postgres store");
                Stores::shared(Arc::new(store))
            }
            None => {
                info!("no database configured; using in-memory store");
                Stores::in_memory()
            }
        };

        Ok(Self {
            stores,
            resources: Arc::new(InMemoryResources::new()),
            mailer: Arc::new(LogMailer),
            transport: Arc::new(HttpTransport::new(config.webhook_timeout)?),
        })
    }

    pub fn in_memory(transport: Arc<dyn WebhookTransport>) -> Self {
        Self {
            stores: Stores::in_memory(),
            resources: Arc::new(InMemoryResources::new()),
            mailer: Arc::new(LogMailer),
            transport,
        }
    }
}

/// The running core: queue, workers, dispatcher, hooks, scheduler, plugins.
pub struct Runtime {
    pub config: CoreConfig,
    pub queue: JobQueue,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub hooks: Arc<HookManager>,
    pub scheduler: Scheduler,
    pub plugins: Arc<PluginManager>,
    pub resources: Arc<dyn ResourceServices>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("queue", &self.queue)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Build every component and start the workers. `catalog` holds the code
    /// for plugins that may already be installed; those persisted as active
    /// are re-activated.
    pub async fn start(
        config: CoreConfig,
        services: Services,
        catalog: Vec<Plugin>,
    ) -> Result<Self, RuntimeError> {
        let queue = JobQueue::connect(config.queue_settings()).await;

        let dispatcher = Arc::new(WebhookDispatcher::new(
            services.stores.webhooks.clone(),
            queue.clone(),
            services.transport,
            config.site_url.clone(),
        ));

        register_workers(
            &queue,
            WorkerDeps {
                dispatcher: dispatcher.clone(),
                resources: services.resources.clone(),
                mailer: services.mailer,
            },
            &config,
        )
        .await?;

        let hooks = Arc::new(HookManager::new());
        let scheduler = Scheduler::new(services.stores.schedules.clone());
        let plugins = Arc::new(PluginManager::new(
            services.stores.plugins.clone(),
            services.resources.clone(),
            hooks.clone(),
            scheduler.clone(),
        ));
        plugins.restore(catalog).await?;

        info!(backend = queue.backend_kind().as_str(), "runtime started");
        Ok(Self {
            config,
            queue,
            dispatcher,
            hooks,
            scheduler,
            plugins,
            resources: services.resources,
        })
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport::collect(&self.queue, &self.plugins).await
    }

    /// Stop the scheduler's triggers and the queue's consumers and timers.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.queue.shutdown().await;
        info!("runtime stopped");
    }
}
