//! Listener manager: the three polling loops and per-instance connection
//! state.
//!
//! Task A polls each instance's main window for unread messages and
//! auto-discovers new chats. Task B polls every active listener for new
//! messages. Task C (housekeeping) times out idle auto-added listeners,
//! probes instance health, re-arms lost remote subscriptions and reconciles
//! the fixed-listener declarations.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use wxrelay_client::{InstanceRegistry, PollFlags};
use wxrelay_common::ListenerStatus;
use wxrelay_store::Store;

use crate::error::{DaemonError, Result};
use crate::health::{ErrorRing, FatalSignal, InstanceHealth, ListenerHealth};
use crate::ingress::MessageIngress;

/// Housekeeping cadence.
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);

/// Tunables for the polling loops.
#[derive(Debug, Clone)]
pub struct ListenerSettings {
    /// Cadence of tasks A and B.
    pub poll_interval: Duration,
    /// Idle window before an auto-added listener is inactivated.
    pub timeout: Duration,
    /// Cap on active listeners per instance; auto-adds beyond it are
    /// refused. Manual and fixed listeners bypass the cap.
    pub max_listeners: u32,
    /// Attachment flags passed to the remote pollers.
    pub poll_flags: PollFlags,
}

/// Volatile per-listener state; `api_connected` is deliberately not
/// persisted.
#[derive(Debug, Clone, Copy)]
struct ListenerRuntime {
    api_connected: bool,
}

/// Cached per-instance probe results for the status snapshot.
#[derive(Debug, Clone, Copy, Default)]
struct InstanceRuntime {
    online: bool,
    cpu_percent: Option<f64>,
    memory_used: Option<f64>,
}

/// Owns the listener set and drives the polling loops.
pub struct ListenerManager {
    store: Store,
    instances: Arc<InstanceRegistry>,
    ingress: Arc<MessageIngress>,
    settings: ListenerSettings,
    listener_runtime: DashMap<(String, String), ListenerRuntime>,
    instance_runtime: DashMap<String, InstanceRuntime>,
    errors: Arc<ErrorRing>,
    fatal: Arc<FatalSignal>,
}

impl ListenerManager {
    /// Builds the manager.
    #[must_use]
    pub fn new(
        store: Store,
        instances: Arc<InstanceRegistry>,
        ingress: Arc<MessageIngress>,
        settings: ListenerSettings,
        errors: Arc<ErrorRing>,
        fatal: Arc<FatalSignal>,
    ) -> Self {
        Self {
            store,
            instances,
            ingress,
            settings,
            listener_runtime: DashMap::new(),
            instance_runtime: DashMap::new(),
            errors,
            fatal,
        }
    }

    /// Ensures an active listener for the chat, adding or resurrecting one.
    ///
    /// Auto-adds beyond the per-instance cap are refused with a warning;
    /// manual adds are forced through.
    ///
    /// # Errors
    ///
    /// Returns the store failure; remote subscription failures only flip
    /// `api_connected` so housekeeping can re-arm later.
    pub async fn ensure_listener(
        &self,
        instance_id: &str,
        chat_name: &str,
        manual: bool,
        now: i64,
    ) -> Result<bool> {
        let existing = self
            .store
            .get_listener(instance_id.to_string(), chat_name.to_string())
            .await?;
        let already_active = existing
            .as_ref()
            .is_some_and(|l| l.status == ListenerStatus::Active);

        if !already_active && !manual {
            let active = self
                .store
                .count_active_listeners(instance_id.to_string())
                .await?;
            if active >= self.settings.max_listeners {
                warn!(
                    instance_id,
                    chat_name,
                    cap = self.settings.max_listeners,
                    "listener cap reached, refusing auto-add"
                );
                return Ok(false);
            }
        }

        self.store
            .upsert_listener(instance_id.to_string(), chat_name.to_string(), manual, now)
            .await?;

        if !already_active {
            // (Re)arm the remote subscription for new and resurrected rows.
            let connected = self.remote_add(instance_id, chat_name).await;
            self.listener_runtime.insert(
                (instance_id.to_string(), chat_name.to_string()),
                ListenerRuntime {
                    api_connected: connected,
                },
            );
            info!(instance_id, chat_name, manual, "listener activated");
        }
        Ok(true)
    }

    /// Re-arms the remote subscription of every active listener loaded from
    /// the store. Run once at startup; the remote daemons have no memory of
    /// our previous process.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn bootstrap_listeners(&self) -> Result<()> {
        let listeners = self
            .store
            .list_listeners(None, Some(ListenerStatus::Active))
            .await?;
        for listener in listeners {
            let connected = self
                .remote_add(&listener.instance_id, &listener.chat_name)
                .await;
            self.listener_runtime.insert(
                (listener.instance_id, listener.chat_name),
                ListenerRuntime {
                    api_connected: connected,
                },
            );
        }
        Ok(())
    }

    async fn remote_add(&self, instance_id: &str, chat_name: &str) -> bool {
        match self.instances.client(instance_id) {
            Ok(client) => match client.add_listener(chat_name, self.settings.poll_flags).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(instance_id, chat_name, error = %e, "remote add-listener failed");
                    false
                }
            },
            Err(e) => {
                warn!(instance_id, error = %e, "no client for instance");
                false
            }
        }
    }

    /// Task A body: one unread poll across all enabled instances.
    pub async fn poll_main_windows(&self, now: i64) {
        let polls = self
            .instances
            .instance_ids()
            .into_iter()
            .map(|instance_id| async move {
                if let Err(e) = self.poll_main_window(&instance_id, now).await {
                    self.note_instance_error(&instance_id, "listener", &e, now);
                }
            });
        join_all(polls).await;
    }

    async fn poll_main_window(&self, instance_id: &str, now: i64) -> Result<()> {
        let client = self.instances.client(instance_id)?;
        let messages = client.get_unread(self.settings.poll_flags).await?;
        self.mark_instance_online(instance_id, now);

        for raw in messages {
            let Some(chat_name) = raw.chat_name.clone().filter(|c| !c.trim().is_empty()) else {
                continue;
            };
            let chat_name = chat_name.trim().to_string();
            // New chats showing up in the main window get auto-discovered;
            // a fresh message also resurrects an inactive listener.
            self.ensure_listener(instance_id, &chat_name, false, now)
                .await?;
            self.store
                .touch_listener_message(instance_id.to_string(), chat_name.clone(), now)
                .await?;
            if let Err(e) = self.ingress.ingest(instance_id, raw, now).await {
                warn!(instance_id, chat_name = %chat_name, error = %e, "ingest failed");
                self.errors.push("ingress", e.to_string(), now);
            }
        }
        Ok(())
    }

    /// Task B body: fetch new messages for every active listener.
    pub async fn poll_listeners(&self, now: i64) {
        let polls = self
            .instances
            .instance_ids()
            .into_iter()
            .map(|instance_id| async move {
                if let Err(e) = self.poll_instance_listeners(&instance_id, now).await {
                    self.note_instance_error(&instance_id, "listener", &e, now);
                }
            });
        join_all(polls).await;
    }

    async fn poll_instance_listeners(&self, instance_id: &str, now: i64) -> Result<()> {
        let listeners = self
            .store
            .list_listeners(Some(instance_id.to_string()), Some(ListenerStatus::Active))
            .await?;
        if listeners.is_empty() {
            return Ok(());
        }
        let client = self.instances.client(instance_id)?;

        for listener in listeners {
            let chat_name = listener.chat_name.clone();
            self.store
                .touch_listener_check(instance_id.to_string(), chat_name.clone(), now)
                .await?;

            match client.get_listener_messages(&chat_name).await {
                Ok(messages) => {
                    self.mark_instance_online(instance_id, now);
                    if messages.is_empty() {
                        continue;
                    }
                    self.store
                        .touch_listener_message(instance_id.to_string(), chat_name.clone(), now)
                        .await?;
                    for raw in messages {
                        if let Err(e) = self.ingress.ingest(instance_id, raw, now).await {
                            warn!(instance_id, chat_name = %chat_name, error = %e, "ingest failed");
                            self.errors.push("ingress", e.to_string(), now);
                        }
                    }
                }
                Err(e) if e.is_listener_missing() => {
                    // The remote daemon lost the subscription (restart);
                    // housekeeping re-arms it once the instance is healthy.
                    warn!(instance_id, chat_name = %chat_name, "remote lost the listener");
                    self.set_api_connected(instance_id, &chat_name, false);
                }
                Err(e) => {
                    self.note_instance_error(instance_id, "listener", &DaemonError::from(e), now);
                }
            }
        }
        Ok(())
    }

    /// Task C body: timeouts, health probes, re-arming, fixed listeners.
    pub async fn housekeeping(&self, now: i64) {
        if let Err(e) = self.inactivate_timed_out(now).await {
            self.errors.push("listener", e.to_string(), now);
        }
        self.probe_instances(now).await;
        if let Err(e) = self.reconcile_fixed_listeners(now).await {
            self.errors.push("listener", e.to_string(), now);
        }
    }

    /// Flips idle auto-added listeners to inactive and removes the remote
    /// subscription. The row is never deleted.
    async fn inactivate_timed_out(&self, now: i64) -> Result<()> {
        let timeout_secs = i64::try_from(self.settings.timeout.as_secs()).unwrap_or(i64::MAX);
        let listeners = self
            .store
            .list_listeners(None, Some(ListenerStatus::Active))
            .await?;
        for listener in listeners {
            if !listener.eligible_for_timeout(now, timeout_secs) {
                continue;
            }
            info!(
                instance_id = %listener.instance_id,
                chat_name = %listener.chat_name,
                idle_secs = now - listener.last_message_time,
                "listener timed out"
            );
            self.store
                .set_listener_status(
                    listener.instance_id.clone(),
                    listener.chat_name.clone(),
                    ListenerStatus::Inactive,
                )
                .await?;
            if let Ok(client) = self.instances.client(&listener.instance_id)
                && let Err(e) = client.remove_listener(&listener.chat_name).await
            {
                warn!(
                    instance_id = %listener.instance_id,
                    chat_name = %listener.chat_name,
                    error = %e,
                    "remote remove-listener failed"
                );
            }
            self.listener_runtime
                .remove(&(listener.instance_id, listener.chat_name));
        }
        Ok(())
    }

    /// Probes every instance and re-arms lost subscriptions on healthy ones.
    async fn probe_instances(&self, now: i64) {
        for instance_id in self.instances.instance_ids() {
            let Ok(client) = self.instances.client(&instance_id) else {
                continue;
            };
            match client.status().await {
                Ok(status) => {
                    self.mark_instance_online(&instance_id, now);
                    let resources = client.system_resources().await.ok();
                    if let Some(mut entry) = self.instance_runtime.get_mut(&instance_id) {
                        entry.online = status.online;
                        entry.cpu_percent = resources
                            .as_ref()
                            .and_then(|r| r.cpu.as_ref())
                            .and_then(|c| c.usage_percent);
                        entry.memory_used = resources
                            .as_ref()
                            .and_then(|r| r.memory.as_ref())
                            .and_then(|m| m.used);
                    }
                    if status.online {
                        self.rearm_disconnected(&instance_id).await;
                    }
                }
                Err(e) => {
                    self.note_instance_error(&instance_id, "listener", &DaemonError::from(e), now);
                }
            }
        }
    }

    /// Restores the remote subscription of listeners marked disconnected.
    async fn rearm_disconnected(&self, instance_id: &str) {
        let disconnected: Vec<String> = self
            .listener_runtime
            .iter()
            .filter(|entry| entry.key().0 == instance_id && !entry.api_connected)
            .map(|entry| entry.key().1.clone())
            .collect();
        for chat_name in disconnected {
            if self.remote_add(instance_id, &chat_name).await {
                info!(instance_id, chat_name = %chat_name, "listener re-armed");
                self.set_api_connected(instance_id, &chat_name, true);
            }
        }
    }

    /// Guarantees an active manual listener for every enabled fixed
    /// declaration on every enabled instance.
    async fn reconcile_fixed_listeners(&self, now: i64) -> Result<()> {
        let fixed = self.store.list_fixed_listeners(true).await?;
        if fixed.is_empty() {
            return Ok(());
        }
        for instance_id in self.instances.instance_ids() {
            for declaration in &fixed {
                let listener = self
                    .store
                    .get_listener(instance_id.clone(), declaration.session_name.clone())
                    .await?;
                let satisfied = listener
                    .is_some_and(|l| l.status == ListenerStatus::Active && l.manual_added);
                if !satisfied {
                    debug!(
                        instance_id = %instance_id,
                        chat_name = %declaration.session_name,
                        "restoring fixed listener"
                    );
                    self.ensure_listener(&instance_id, &declaration.session_name, true, now)
                        .await?;
                }
            }
        }
        Ok(())
    }

    fn mark_instance_online(&self, instance_id: &str, now: i64) {
        self.instances.mark_seen(instance_id, now);
        self.instance_runtime
            .entry(instance_id.to_string())
            .or_default()
            .online = true;
    }

    fn set_api_connected(&self, instance_id: &str, chat_name: &str, connected: bool) {
        self.listener_runtime
            .entry((instance_id.to_string(), chat_name.to_string()))
            .and_modify(|runtime| runtime.api_connected = connected)
            .or_insert(ListenerRuntime {
                api_connected: connected,
            });
    }

    fn note_instance_error(
        &self,
        instance_id: &str,
        component: &'static str,
        error: &DaemonError,
        now: i64,
    ) {
        warn!(instance_id, error = %error, "instance call failed");
        self.instance_runtime
            .entry(instance_id.to_string())
            .or_default()
            .online = false;
        self.errors.push(component, format!("{instance_id}: {error}"), now);
        if error.is_store_fatal() {
            self.fatal.raise(error.to_string());
        }
    }

    /// Task A loop.
    pub async fn run_main_window_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_main_windows(unix_now()).await,
                _ = shutdown.recv() => break,
            }
        }
        debug!("main-window poll loop stopped");
    }

    /// Task B loop.
    pub async fn run_listener_poll_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.poll_listeners(unix_now()).await,
                _ = shutdown.recv() => break,
            }
        }
        debug!("per-listener poll loop stopped");
    }

    /// Task C loop.
    pub async fn run_housekeeping_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(HOUSEKEEPING_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.housekeeping(unix_now()).await,
                _ = shutdown.recv() => break,
            }
        }
        debug!("housekeeping loop stopped");
    }

    /// Per-instance view for the status snapshot.
    #[must_use]
    pub fn instance_health(&self) -> Vec<InstanceHealth> {
        self.instances
            .instance_ids()
            .into_iter()
            .map(|instance_id| {
                let runtime = self
                    .instance_runtime
                    .get(&instance_id)
                    .map(|entry| *entry)
                    .unwrap_or_default();
                InstanceHealth {
                    last_seen: self.instances.last_seen(&instance_id),
                    online: runtime.online,
                    cpu_percent: runtime.cpu_percent,
                    memory_used: runtime.memory_used,
                    instance_id,
                }
            })
            .collect()
    }

    /// Per-listener view for the status snapshot.
    ///
    /// # Errors
    ///
    /// Returns the store failure.
    pub async fn listener_health(&self) -> Result<Vec<ListenerHealth>> {
        let listeners = self.store.list_listeners(None, None).await?;
        Ok(listeners
            .into_iter()
            .map(|listener| {
                let api_connected = self
                    .listener_runtime
                    .get(&(listener.instance_id.clone(), listener.chat_name.clone()))
                    .is_some_and(|runtime| runtime.api_connected);
                ListenerHealth {
                    instance_id: listener.instance_id,
                    chat_name: listener.chat_name,
                    status: listener.status.as_str().to_string(),
                    manual_added: listener.manual_added,
                    last_message_time: listener.last_message_time,
                    api_connected,
                }
            })
            .collect())
    }
}

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
