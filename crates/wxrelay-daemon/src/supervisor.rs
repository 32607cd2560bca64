//! Supervisor: constructs the pipeline, owns its lifecycle and serves the
//! health snapshot.
//!
//! Startup order is store, instance registry, platform registry,
//! conversation map, listener manager, delivery service; shutdown cancels
//! the periodic tasks, waits out a grace period for in-flight deliveries
//! and then lets the store close.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use wxrelay_client::{InstanceRegistry, PollFlags};
use wxrelay_platforms::PlatformRegistry;
use wxrelay_store::{ConversationMap, Store};

use crate::config::DaemonConfig;
use crate::delivery::{DeliveryService, DeliverySettings};
use crate::error::Result;
use crate::health::{ErrorRing, FatalSignal, HealthSnapshot, PipelineCounters};
use crate::ingress::MessageIngress;
use crate::listener::{ListenerManager, ListenerSettings, unix_now};
use crate::rules::RuleEngine;

/// Cadence of the platform/rule hot-reload and conversation purge task.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Root lifecycle object for the whole pipeline.
pub struct Supervisor {
    config: DaemonConfig,
    store: Store,
    instances: Arc<InstanceRegistry>,
    platforms: Arc<PlatformRegistry>,
    conversations: Arc<ConversationMap>,
    rules: Arc<RuleEngine>,
    listener_manager: Arc<ListenerManager>,
    delivery: Arc<DeliveryService>,
    counters: Arc<PipelineCounters>,
    errors: Arc<ErrorRing>,
    fatal: Arc<FatalSignal>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Builds the pipeline from configuration. No loops run yet.
    ///
    /// # Errors
    ///
    /// Returns an error when the store cannot be opened or directories
    /// cannot be created.
    pub fn new(config: DaemonConfig) -> Result<Self> {
        let store = Store::open(&config.db_path()?)?;
        let downloads_dir = config.downloads_dir()?;

        let instances = Arc::new(InstanceRegistry::new(config.instances.clone()));
        let platforms = Arc::new(PlatformRegistry::new());
        let conversations = Arc::new(ConversationMap::new(store.clone()));
        let rules = Arc::new(RuleEngine::new(store.clone()));
        let counters = Arc::new(PipelineCounters::new());
        let errors = Arc::new(ErrorRing::new());
        let fatal = Arc::new(FatalSignal::new());
        let ingress = Arc::new(MessageIngress::new(store.clone(), Arc::clone(&counters)));

        let listener_manager = Arc::new(ListenerManager::new(
            store.clone(),
            Arc::clone(&instances),
            ingress,
            ListenerSettings {
                poll_interval: Duration::from_secs(config.settings.poll_interval_seconds),
                timeout: Duration::from_secs(config.settings.timeout_minutes * 60),
                max_listeners: config.settings.max_listeners,
                poll_flags: PollFlags::default(),
            },
            Arc::clone(&errors),
            Arc::clone(&fatal),
        ));

        let delivery = Arc::new(DeliveryService::new(
            store.clone(),
            Arc::clone(&conversations),
            Arc::clone(&platforms),
            Arc::clone(&instances),
            Arc::clone(&rules),
            DeliverySettings {
                workers: config.settings.delivery_workers,
                merge_window_ms: config.settings.merge_window_ms,
                platform_timeout: Duration::from_secs(
                    config.settings.platform_call_timeout_seconds,
                ),
                accounting_timeout: Duration::from_secs(
                    config.settings.accounting_call_timeout_seconds,
                ),
                downloads_dir,
                typing_chunk_size: config.settings.typing_chunk_size,
                typing_chunk_delay_ms: config.settings.typing_chunk_delay_ms,
            },
            Arc::clone(&counters),
            Arc::clone(&errors),
            Arc::clone(&fatal),
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            store,
            instances,
            platforms,
            conversations,
            rules,
            listener_manager,
            delivery,
            counters,
            errors,
            fatal,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// The fatal-failure latch; raised only by unrecoverable store errors.
    #[must_use]
    pub fn fatal(&self) -> &Arc<FatalSignal> {
        &self.fatal
    }

    /// Direct store access for the admin surface and tests.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Brings the whole pipeline up.
    ///
    /// # Errors
    ///
    /// Returns an error when seeding or the initial reload fails; remote
    /// instances that refuse to initialise are logged and retried by the
    /// polling loops.
    pub async fn start(&self) -> Result<()> {
        let now = unix_now();

        // Seed fixed-listener declarations from the config file.
        for fixed in &self.config.fixed_listeners {
            self.store.upsert_fixed_listener(fixed.clone(), now).await?;
        }

        self.platforms.reload(&self.store).await?;
        self.rules.reload().await?;

        // Best-effort remote initialisation; offline instances recover
        // through the housekeeping probe.
        for instance_id in self.instances.instance_ids() {
            match self.instances.client(&instance_id) {
                Ok(client) => {
                    if let Err(e) = client.initialize().await {
                        warn!(instance_id, error = %e, "instance initialisation failed");
                        self.errors
                            .push("supervisor", format!("{instance_id}: {e}"), now);
                    } else {
                        info!(instance_id, "instance initialised");
                    }
                }
                Err(e) => warn!(instance_id, error = %e, "instance client unavailable"),
            }
        }

        // Restore remote subscriptions for listeners that survived the
        // restart, then make fixed listeners active before the first poll.
        self.listener_manager.bootstrap_listeners().await?;
        self.listener_manager.housekeeping(now).await;

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(
            Arc::clone(&self.listener_manager).run_main_window_loop(self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.listener_manager).run_listener_poll_loop(self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            Arc::clone(&self.listener_manager).run_housekeeping_loop(self.shutdown_tx.subscribe()),
        ));
        for worker in 0..self.config.settings.delivery_workers {
            tasks.push(tokio::spawn(
                Arc::clone(&self.delivery).run_worker(worker, self.shutdown_tx.subscribe()),
            ));
        }
        tasks.push(tokio::spawn(Self::run_maintenance(
            self.store.clone(),
            Arc::clone(&self.platforms),
            Arc::clone(&self.rules),
            Arc::clone(&self.conversations),
            self.config.settings.conversation_purge_days,
            self.shutdown_tx.subscribe(),
        )));

        info!(
            workers = self.config.settings.delivery_workers,
            instances = self.instances.instance_ids().len(),
            "pipeline started"
        );
        Ok(())
    }

    /// Hot reload of platforms/rules plus the conversation retention purge.
    async fn run_maintenance(
        store: Store,
        platforms: Arc<PlatformRegistry>,
        rules: Arc<RuleEngine>,
        conversations: Arc<ConversationMap>,
        purge_days: u64,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = platforms.reload(&store).await {
                        warn!(error = %e, "platform reload failed");
                    }
                    if let Err(e) = rules.reload().await {
                        warn!(error = %e, "rule reload failed");
                    }
                    let cutoff = unix_now() - i64::try_from(purge_days * 86_400).unwrap_or(i64::MAX);
                    match conversations.purge_older_than(cutoff).await {
                        Ok(0) => {}
                        Ok(purged) => info!(purged, "idle conversations purged"),
                        Err(e) => warn!(error = %e, "conversation purge failed"),
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!("maintenance loop stopped");
    }

    /// Stops all loops, waiting out the configured grace period for
    /// in-flight deliveries.
    pub async fn stop(&self) {
        info!("pipeline stopping");
        drop(self.shutdown_tx.send(()));

        let grace = Duration::from_secs(self.config.settings.shutdown_grace_seconds);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout(grace, task).await.is_err() {
                warn!("task did not stop within the grace period, aborting");
                abort.abort();
            }
        }
        self.platforms.shutdown().await;
        info!("pipeline stopped");
    }

    /// Read-only view of the pipeline for the admin surface.
    ///
    /// # Errors
    ///
    /// Returns the store failure when listener rows cannot be read.
    pub async fn snapshot(&self) -> Result<HealthSnapshot> {
        Ok(HealthSnapshot {
            instances: self.listener_manager.instance_health(),
            listeners: self.listener_manager.listener_health().await?,
            platforms: self.platforms.stats_snapshot(),
            throughput: self.counters.snapshot(),
            recent_errors: self.errors.snapshot(),
        })
    }
}
