// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dynamic client controller.
//!
//! Keeps exactly zero or one output client per tenant, driven by a watch over
//! cluster objects:
//!
//! ```text
//!   watch ──ClusterEvent──> reconcile ──┬─ no entry, routable  -> create client
//!                                       ├─ entry               -> update state
//!                                       ├─ deleted/unroutable  -> mark deleted
//!                                       └─ routable again      -> clear mark
//!
//!   every sweep_interval: stop + remove entries marked longer than the expiration
//! ```
//!
//! The registry is a read-mostly map behind an `RwLock`. Reads on the record
//! path never wait for client construction or for a client to stop: both run
//! outside the lock.

use hashbrown::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod state;

pub use state::{
    ClusterObject, LastOperation, LifecycleState, OperationKind, OperationState, RoutingGates,
    StateGates,
};

use crate::client::{ClientFactory, OutputClient};

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("cluster watch did not sync within {0:?}")]
    SyncTimeout(Duration),
    #[error("cluster watch closed before it synced")]
    WatchClosed,
    #[error("controller is already running")]
    AlreadyStarted,
}

/// One observation from the cluster watch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    Added(ClusterObject),
    Updated(ClusterObject),
    Deleted(ClusterObject),
    /// The watch delivered its initial list.
    Synced,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Tenant endpoints are `prefix + tenant + suffix`.
    pub dynamic_host_prefix: String,
    pub dynamic_host_suffix: String,
    pub deleted_client_expiration: Duration,
    pub sweep_interval: Duration,
    pub sync_timeout: Duration,
    pub shutdown_deadline: Duration,
    pub gates: RoutingGates,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        ControllerSettings {
            dynamic_host_prefix: "http://logging.".to_string(),
            dynamic_host_suffix: ".svc:3100/loki/api/v1/push".to_string(),
            deleted_client_expiration: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(60),
            sync_timeout: Duration::from_secs(60),
            shutdown_deadline: Duration::from_secs(30),
            gates: RoutingGates::default(),
        }
    }
}

#[derive(Debug)]
struct TenantClientEntry {
    client: Arc<dyn OutputClient>,
    state: LifecycleState,
    state_changed_at: Instant,
    marked_deleted_at: Option<Instant>,
}

/// Snapshot of a tenant's routing decision.
#[derive(Debug, Clone)]
pub struct TenantRoute {
    pub client: Arc<dyn OutputClient>,
    pub state: LifecycleState,
    /// Forward to the tenant's own client.
    pub to_tenant: bool,
    /// Forward to the default client.
    pub to_default: bool,
}

#[derive(Debug)]
pub struct Controller {
    entries: RwLock<HashMap<String, TenantClientEntry>>,
    factory: Arc<dyn ClientFactory>,
    settings: ControllerSettings,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Controller {
    #[must_use]
    pub fn new(factory: Arc<dyn ClientFactory>, settings: ControllerSettings) -> Self {
        Controller {
            entries: RwLock::new(HashMap::new()),
            factory,
            settings,
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, TenantClientEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, TenantClientEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    #[must_use]
    pub fn tenant_url(&self, tenant: &str) -> String {
        format!(
            "{}{tenant}{}",
            self.settings.dynamic_host_prefix, self.settings.dynamic_host_suffix
        )
    }

    /// Applies one watch event to the registry.
    pub async fn reconcile(&self, event: &ClusterEvent) {
        match event {
            ClusterEvent::Added(object) | ClusterEvent::Updated(object) => {
                self.apply(&object.name, object.lifecycle_state(), false).await;
            }
            ClusterEvent::Deleted(object) => {
                self.apply(&object.name, LifecycleState::Deleted, true).await;
            }
            ClusterEvent::Synced => {}
        }
    }

    async fn apply(&self, tenant: &str, state: LifecycleState, deleted: bool) {
        let retire = deleted || !self.settings.gates.routable(state);
        let now = Instant::now();

        if let Some(failed) = self.take_failed(tenant) {
            warn!("CONTROLLER | Client for {tenant} stopped on its own, replacing it");
            failed.stop().await;
        }
        if self.update_existing(tenant, state, retire, deleted, now) {
            return;
        }
        if retire {
            debug!("CONTROLLER | Not creating a client for {tenant} in state {state}");
            return;
        }

        let url = self.tenant_url(tenant);
        let client = match self.factory.create(tenant, &url) {
            Ok(client) => client,
            Err(e) => {
                error!("CONTROLLER | Failed to create client for {tenant} at {url}: {e}");
                return;
            }
        };

        let raced = {
            let mut entries = self.write();
            if entries.contains_key(tenant) {
                Some(client)
            } else {
                info!("CONTROLLER | Added client for {tenant} at {url}, state {state}");
                entries.insert(
                    tenant.to_string(),
                    TenantClientEntry {
                        client,
                        state,
                        state_changed_at: now,
                        marked_deleted_at: None,
                    },
                );
                None
            }
        };
        if let Some(duplicate) = raced {
            duplicate.stop().await;
            self.update_existing(tenant, state, retire, deleted, now);
        }
    }

    /// Removes the tenant's entry when its client stopped without being asked
    /// to, e.g. after its queue storage failed.
    fn take_failed(&self, tenant: &str) -> Option<Arc<dyn OutputClient>> {
        let mut entries = self.write();
        if entries
            .get(tenant)
            .is_some_and(|entry| entry.client.is_stopped())
        {
            entries.remove(tenant).map(|entry| entry.client)
        } else {
            None
        }
    }

    /// Returns `false` when the tenant has no entry. A deletion always restarts
    /// the expiration, other unroutable updates keep an existing mark.
    fn update_existing(
        &self,
        tenant: &str,
        state: LifecycleState,
        retire: bool,
        deleted: bool,
        now: Instant,
    ) -> bool {
        let mut entries = self.write();
        let Some(entry) = entries.get_mut(tenant) else {
            return false;
        };

        if entry.state != state {
            info!(
                "CONTROLLER | Tenant {tenant} moved from {} to {state} after {:?}",
                entry.state,
                now.saturating_duration_since(entry.state_changed_at)
            );
            entry.state = state;
            entry.state_changed_at = now;
        }

        if deleted {
            debug!("CONTROLLER | Tenant {tenant} deleted, client expires from now");
            entry.marked_deleted_at = Some(now);
        } else if retire {
            if entry.marked_deleted_at.is_none() {
                debug!("CONTROLLER | Marked client for {tenant} for deletion");
                entry.marked_deleted_at = Some(now);
            }
        } else if entry.marked_deleted_at.take().is_some() {
            info!("CONTROLLER | Client for {tenant} is routable again, keeping it");
        }
        true
    }

    /// Routing decision for `tenant`, or `None` when it has no client.
    #[must_use]
    pub fn lookup(&self, tenant: &str) -> Option<TenantRoute> {
        let entries = self.read();
        let entry = entries.get(tenant)?;
        Some(TenantRoute {
            client: Arc::clone(&entry.client),
            state: entry.state,
            to_tenant: self.settings.gates.tenant.allows(entry.state),
            to_default: self.settings.gates.default.allows(entry.state),
        })
    }

    /// The tenant's client and whether its current state lets logs reach it.
    #[must_use]
    pub fn get_client(&self, tenant: &str) -> (Option<Arc<dyn OutputClient>>, bool) {
        match self.lookup(tenant) {
            Some(route) => (Some(route.client), route.to_tenant),
            None => (None, false),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops and removes clients marked for deletion longer than the
    /// expiration.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let expiration = self.settings.deleted_client_expiration;
        let expired: Vec<(String, Arc<dyn OutputClient>)> = {
            let mut entries = self.write();
            let names: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .marked_deleted_at
                        .is_some_and(|marked| now.saturating_duration_since(marked) > expiration)
                })
                .map(|(name, _)| name.clone())
                .collect();
            names
                .into_iter()
                .filter_map(|name| entries.remove(&name).map(|entry| (name, entry.client)))
                .collect()
        };

        for (tenant, client) in expired {
            info!("CONTROLLER | Removing expired client for {tenant}");
            client.stop().await;
        }
    }

    /// Applies events until the watch reports [`ClusterEvent::Synced`], then
    /// keeps consuming events and sweeping in a background task.
    pub async fn start(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<ClusterEvent>,
    ) -> Result<(), ControllerError> {
        if self.worker.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
            return Err(ControllerError::AlreadyStarted);
        }

        let sync_timeout = self.settings.sync_timeout;
        let deadline = tokio::time::sleep(sync_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => return Err(ControllerError::SyncTimeout(sync_timeout)),
                event = events.recv() => match event {
                    Some(ClusterEvent::Synced) => break,
                    Some(event) => self.reconcile(&event).await,
                    None => return Err(ControllerError::WatchClosed),
                },
            }
        }
        info!("CONTROLLER | Cluster watch synced with {} tenant clients", self.len());

        let this = Arc::clone(self);
        let cancel = self.cancel.clone();
        let worker = tokio::spawn(async move {
            let mut sweep = tokio::time::interval_at(
                Instant::now() + this.settings.sweep_interval,
                this.settings.sweep_interval,
            );
            let mut watching = true;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = sweep.tick() => this.sweep().await,
                    event = events.recv(), if watching => match event {
                        Some(event) => this.reconcile(&event).await,
                        None => {
                            warn!("CONTROLLER | Cluster watch closed, only sweeping from now on");
                            watching = false;
                        }
                    },
                }
            }
            debug!("CONTROLLER | Watch loop stopped");
        });
        *self.worker.lock().unwrap_or_else(PoisonError::into_inner) = Some(worker);
        Ok(())
    }

    /// Cancels the watch loop and stops every tenant client in parallel,
    /// bounded by the shutdown deadline.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("CONTROLLER | Watch loop failed: {e}");
            }
        }

        let clients: Vec<Arc<dyn OutputClient>> =
            self.write().drain().map(|(_, entry)| entry.client).collect();
        if clients.is_empty() {
            return;
        }
        info!("CONTROLLER | Stopping {} tenant clients", clients.len());

        let mut stopping = JoinSet::new();
        for client in clients {
            stopping.spawn(async move { client.stop().await });
        }
        let all_stopped = async { while stopping.join_next().await.is_some() {} };
        if tokio::time::timeout(self.settings.shutdown_deadline, all_stopped)
            .await
            .is_err()
        {
            warn!(
                "CONTROLLER | Shutdown deadline elapsed with {} clients still stopping",
                stopping.len()
            );
        }
    }
}
