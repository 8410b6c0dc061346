//! Sessions: one client's isolated set of facades plus its event queue.
//!
//! The [`SessionManager`] maps client identity to [`Session`]. Sessions are
//! created on first use with a single atomic insert-if-absent and destroyed
//! by [`SessionManager::remove`], which closes the event queue (waking any
//! blocked drain) and then tears down every facade the session built.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::errors::{CoreError, TeardownReport};
use crate::events::{EventQueue, EventRecord};
use crate::facade::{downcast_facade, Facade, FacadeCatalog, FacadeContext, FacadeState};
use crate::types::ClientId;

type FacadeSlot = Arc<Mutex<Option<Arc<dyn Facade>>>>;

// ============================================================================
// Session
// ============================================================================

/// One client's universe of lazily-built facades sharing one event queue.
pub struct Session {
    client_id: ClientId,
    catalog: Arc<FacadeCatalog>,
    config: Arc<CoreConfig>,
    queue: Arc<EventQueue>,
    /// One slot per catalog entry; the slot lock serialises construction
    slots: HashMap<&'static str, FacadeSlot>,
    closed: AtomicBool,
    created_at: SystemTime,
    last_activity: Mutex<Instant>,
}

impl Session {
    pub fn new(client_id: ClientId, catalog: Arc<FacadeCatalog>, config: Arc<CoreConfig>) -> Self {
        let slots = catalog
            .names()
            .iter()
            .map(|name| (*name, Arc::new(Mutex::new(None))))
            .collect();
        let queue = Arc::new(config.event_queue.build_queue());
        Self {
            client_id,
            catalog,
            config,
            queue,
            slots,
            closed: AtomicBool::new(false),
            created_at: SystemTime::now(),
            last_activity: Mutex::new(Instant::now()),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    /// The session's event queue, shared by all of its facades.
    pub fn events(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    /// Existing instance of `name`, or a new one built with its
    /// dependencies. Concurrent first references build it once.
    pub fn get_or_create_facade(&self, name: &str) -> Result<Arc<dyn Facade>, CoreError> {
        self.ensure_open()?;
        self.touch();

        let (&key, slot) = self
            .slots
            .get_key_value(name)
            .ok_or_else(|| CoreError::UnknownFacade(name.to_string()))?;
        let mut slot = slot.lock();

        // close() marks the session before visiting slots, so checking again
        // under the slot lock keeps a late construction from leaking.
        self.ensure_open()?;

        if let Some(existing) = slot.as_ref() {
            if existing.state() != FacadeState::TornDown {
                return Ok(Arc::clone(existing));
            }
        }

        let facade = self.construct(key)?;
        *slot = Some(Arc::clone(&facade));
        Ok(facade)
    }

    fn construct(&self, name: &'static str) -> Result<Arc<dyn Facade>, CoreError> {
        let factory = self.catalog.get(name)?;

        // Dependencies are registered earlier in the catalog, so their slots
        // are never the one currently locked.
        let mut dependencies = HashMap::new();
        for dependency in factory.dependencies() {
            let facade = self.get_or_create_facade(dependency)?;
            dependencies.insert(*dependency, facade);
        }

        let ctx = FacadeContext::new(
            name,
            self.client_id.clone(),
            Arc::clone(&self.queue),
            Arc::clone(&self.config),
            dependencies,
        );
        let facade = factory.create(ctx).map_err(|e| {
            warn!(client_id = %self.client_id, facade = name, error = %e, "facade construction failed");
            CoreError::FacadeConstruction {
                facade: name.to_string(),
                reason: format!("{e:#}"),
            }
        })?;
        facade.core().activate();

        info!(client_id = %self.client_id, facade = name, "facade created");
        Ok(facade)
    }

    /// Typed access to a facade, building it if needed.
    pub fn facade<T: Facade>(&self, name: &str) -> Result<Arc<T>, CoreError> {
        let facade = self.get_or_create_facade(name)?;
        downcast_facade::<T>(facade).ok_or_else(|| CoreError::FacadeConstruction {
            facade: name.to_string(),
            reason: "facade has an unexpected type".to_string(),
        })
    }

    /// Tear down one facade on client request, together with every built
    /// facade that depends on it directly or transitively, since those hold
    /// the instance being torn down. Dependents go first. The next reference
    /// builds fresh instances. Returns whether an instance of `name` existed.
    pub fn shutdown_facade(&self, name: &str) -> bool {
        let Some((&target, _)) = self.slots.get_key_value(name) else {
            return false;
        };

        // Catalog order puts dependencies first, so one pass is transitive
        let mut affected: HashSet<&'static str> = HashSet::from([target]);
        for &candidate in self.catalog.names() {
            let Ok(factory) = self.catalog.get(candidate) else {
                continue;
            };
            if factory.dependencies().iter().any(|dep| affected.contains(dep)) {
                affected.insert(candidate);
            }
        }

        let taken: Vec<(&'static str, Arc<dyn Facade>)> = self
            .catalog
            .names()
            .iter()
            .rev()
            .filter(|candidate| affected.contains(**candidate))
            .filter_map(|&candidate| {
                let slot = self.slots.get(candidate)?;
                let facade = slot.lock().take()?;
                Some((candidate, facade))
            })
            .collect();

        let mut existed = false;
        for (candidate, facade) in taken {
            existed |= candidate == target;
            let report = facade.teardown();
            debug!(
                client_id = %self.client_id,
                facade = candidate,
                requested = target,
                already_torn_down = report.already_torn_down,
                "facade shut down"
            );
        }
        existed
    }

    /// Names of facades currently built, in catalog order.
    pub fn instantiated(&self) -> Vec<&'static str> {
        self.catalog
            .names()
            .iter()
            .filter(|name| {
                self.slots
                    .get(*name)
                    .map(|slot| slot.lock().is_some())
                    .unwrap_or(false)
            })
            .copied()
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the queue, then tear down every facade (dependents first).
    ///
    /// Undrained events are discarded. Only the first call does any work.
    pub fn close(&self) -> Vec<TeardownReport> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Vec::new();
        }

        self.queue.close();

        let mut reports = Vec::new();
        for name in self.catalog.names().iter().rev() {
            let Some(slot) = self.slots.get(name) else {
                continue;
            };
            let facade = slot.lock().take();
            if let Some(facade) = facade {
                reports.push(facade.teardown());
            }
        }

        let failures: usize = reports.iter().map(|r| r.failures.len()).sum();
        info!(
            client_id = %self.client_id,
            facades = reports.len(),
            failures,
            "session closed"
        );
        reports
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Time since the last facade lookup or drain, measured at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    fn ensure_open(&self) -> Result<(), CoreError> {
        if self.is_closed() {
            return Err(CoreError::SessionNotFound(self.client_id.clone()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("closed", &self.is_closed())
            .field("instantiated", &self.instantiated())
            .finish()
    }
}

// ============================================================================
// Session Manager
// ============================================================================

/// Process-wide map from client identity to session.
pub struct SessionManager {
    catalog: Arc<FacadeCatalog>,
    config: Arc<CoreConfig>,
    sessions: DashMap<ClientId, Arc<Session>>,
    next_client: AtomicU64,
}

impl SessionManager {
    pub fn new(catalog: FacadeCatalog, config: CoreConfig) -> Self {
        Self {
            catalog: Arc::new(catalog),
            config: Arc::new(config),
            sessions: DashMap::new(),
            next_client: AtomicU64::new(1),
        }
    }

    pub fn catalog(&self) -> &FacadeCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Session for `client_id`, created atomically if absent.
    pub fn get_or_create(&self, client_id: impl Into<ClientId>) -> Result<Arc<Session>, CoreError> {
        let client_id = client_id.into();

        // Bound to a local so the shard guard is released before `entry`
        let existing = self.sessions.get(&client_id).map(|s| Arc::clone(s.value()));
        if let Some(session) = existing {
            return Ok(session);
        }

        // Soft limit: checked outside the entry lock, since `len` takes every
        // shard lock.
        let limit = self.config.max_sessions;
        if limit > 0 && self.sessions.len() >= limit {
            warn!(client_id = %client_id, limit, "session limit reached");
            return Err(CoreError::SessionLimitReached { limit });
        }

        let session = self
            .sessions
            .entry(client_id.clone())
            .or_insert_with(|| self.new_session(&client_id))
            .value()
            .clone();
        Ok(session)
    }

    fn new_session(&self, client_id: &ClientId) -> Arc<Session> {
        info!(client_id = %client_id, "session created");
        Arc::new(Session::new(
            client_id.clone(),
            Arc::clone(&self.catalog),
            Arc::clone(&self.config),
        ))
    }

    /// Session for `client_id` without creating one.
    pub fn get(&self, client_id: &ClientId) -> Result<Arc<Session>, CoreError> {
        self.sessions
            .get(client_id)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| CoreError::SessionNotFound(client_id.clone()))
    }

    /// Allocate a fresh numeric client identity and open its session.
    ///
    /// Identities already taken by an explicit [`SessionManager::get_or_create`]
    /// are skipped; the returned session is always a new one.
    pub fn open_session(&self) -> Result<Arc<Session>, CoreError> {
        let limit = self.config.max_sessions;
        if limit > 0 && self.sessions.len() >= limit {
            warn!(limit, "session limit reached");
            return Err(CoreError::SessionLimitReached { limit });
        }

        loop {
            let id = ClientId::from(self.next_client.fetch_add(1, Ordering::Relaxed));
            if let Entry::Vacant(vacant) = self.sessions.entry(id.clone()) {
                let session = self.new_session(&id);
                vacant.insert(Arc::clone(&session));
                return Ok(session);
            }
        }
    }

    /// Remove a session and run its teardown cascade.
    ///
    /// Returns whether a session was present.
    pub fn remove(&self, client_id: &ClientId) -> bool {
        let Some((_, session)) = self.sessions.remove(client_id) else {
            debug!(client_id = %client_id, "remove for unknown session");
            return false;
        };
        session.close();
        info!(client_id = %client_id, "session removed");
        true
    }

    /// Tear down one facade of a live session.
    pub fn shutdown_facade(&self, client_id: &ClientId, facade: &str) -> Result<bool, CoreError> {
        if !self.catalog.contains(facade) {
            return Err(CoreError::UnknownFacade(facade.to_string()));
        }
        Ok(self.get(client_id)?.shutdown_facade(facade))
    }

    /// Drain events for an existing session; see [`EventQueue::drain`].
    pub async fn drain_events(
        &self,
        client_id: &ClientId,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<EventRecord>, CoreError> {
        let session = self.get(client_id)?;
        session.touch();
        Ok(session.events().drain(max, timeout).await)
    }

    /// Remove sessions idle longer than the configured timeout. Returns the
    /// removed client identities.
    pub fn cleanup_idle(&self, now: Instant) -> Vec<ClientId> {
        let Some(timeout) = self.config.session_idle_timeout() else {
            return Vec::new();
        };

        let expired: Vec<ClientId> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().idle_for(now) >= timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let removed: Vec<ClientId> = expired
            .into_iter()
            .filter(|client_id| self.remove(client_id))
            .collect();
        if !removed.is_empty() {
            info!(count = removed.len(), "idle sessions removed");
        }
        removed
    }

    /// Remove every session. Returns how many were removed.
    pub fn shutdown_all(&self) -> usize {
        let ids = self.client_ids();
        let removed = ids.iter().filter(|id| self.remove(id)).count();
        info!(removed, "all sessions shut down");
        removed
    }

    pub fn client_ids(&self) -> Vec<ClientId> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
