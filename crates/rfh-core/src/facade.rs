//! Facade lifecycle: the contract every capability unit follows.
//!
//! A facade is built by its [`FacadeFactory`] when a session first
//! references it. It embeds a [`FacadeCore`], which tracks what the facade
//! set up while it was active (platform callbacks, handle registries, and
//! shared platform resources) and undoes all of it exactly once in
//! [`FacadeCore::teardown`].
//!
//! Factories are collected in a [`FacadeCatalog`]. A factory may only depend
//! on factories registered before it, so the dependency graph between facade
//! types is acyclic by construction.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::errors::{CoreError, TeardownError, TeardownReport};
use crate::event_facade::EventFacadeFactory;
use crate::events::{EventQueue, EventSink};
use crate::params::Params;
use crate::registry::{HandleRegistry, Resource, TrackedRegistry};
use crate::types::ClientId;

// ============================================================================
// Lifecycle State
// ============================================================================

/// Lifecycle of one facade instance. There is no way back from `TornDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacadeState {
    Uninitialized,
    Active,
    TornDown,
}

impl FacadeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => FacadeState::Uninitialized,
            1 => FacadeState::Active,
            _ => FacadeState::TornDown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            FacadeState::Uninitialized => 0,
            FacadeState::Active => 1,
            FacadeState::TornDown => 2,
        }
    }
}

type ReleaseFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

struct Teardown {
    label: String,
    run: ReleaseFn,
}

// ============================================================================
// Emitter
// ============================================================================

/// Cloneable event publisher for platform callbacks.
///
/// Holds the facade's lifecycle state rather than the facade itself, so a
/// callback closure never keeps its facade alive. Events are published from
/// the moment the factory registers its callbacks until teardown begins.
#[derive(Clone)]
pub struct Emitter {
    facade: Arc<str>,
    sink: EventSink,
    state: Arc<AtomicU8>,
}

impl Emitter {
    pub fn emit(&self, name: impl Into<String>, payload: Value) -> bool {
        if FacadeState::from_u8(self.state.load(Ordering::Acquire)) == FacadeState::TornDown {
            debug!(facade = %self.facade, "event from torn down facade ignored");
            return false;
        }
        self.sink.publish(name, payload)
    }
}

// ============================================================================
// Facade Core
// ============================================================================

/// Lifecycle bookkeeping embedded in every facade.
pub struct FacadeCore {
    name: Arc<str>,
    client_id: ClientId,
    sink: EventSink,
    state: Arc<AtomicU8>,
    callbacks: Mutex<Vec<Teardown>>,
    registries: Mutex<Vec<Arc<dyn TrackedRegistry>>>,
    shared: Mutex<Vec<Teardown>>,
}

impl FacadeCore {
    pub fn new(name: &str, client_id: ClientId, sink: EventSink) -> Self {
        Self {
            name: Arc::from(name),
            client_id,
            sink,
            state: Arc::new(AtomicU8::new(FacadeState::Uninitialized.as_u8())),
            callbacks: Mutex::new(Vec::new()),
            registries: Mutex::new(Vec::new()),
            shared: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn state(&self) -> FacadeState {
        FacadeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move from `Uninitialized` to `Active`. Returns `false` if the facade
    /// was already active or torn down.
    pub fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                FacadeState::Uninitialized.as_u8(),
                FacadeState::Active.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Fail with [`CoreError::FacadeTornDown`] once teardown has begun.
    pub fn ensure_active(&self) -> Result<(), CoreError> {
        match self.state() {
            FacadeState::TornDown => Err(CoreError::FacadeTornDown(self.name.to_string())),
            _ => Ok(()),
        }
    }

    /// Publish an event into the session's queue unless torn down.
    pub fn emit(&self, name: impl Into<String>, payload: Value) -> bool {
        self.emitter().emit(name, payload)
    }

    /// Publisher to move into platform callback closures.
    pub fn emitter(&self) -> Emitter {
        Emitter {
            facade: Arc::clone(&self.name),
            sink: self.sink.clone(),
            state: Arc::clone(&self.state),
        }
    }

    /// Record how to unregister a platform callback.
    ///
    /// If the facade is already torn down the callback is unregistered
    /// immediately.
    pub fn register_callback<F>(&self, label: impl Into<String>, unregister: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let entry = Teardown {
            label: label.into(),
            run: Box::new(unregister),
        };
        if let Some(late) = self.push_unless_torn_down(&self.callbacks, entry) {
            self.run_late(late, "callback");
        }
    }

    /// Create a handle registry owned by this facade.
    pub fn registry<T: Resource>(&self, name: impl Into<String>) -> Arc<HandleRegistry<T>> {
        let registry = Arc::new(HandleRegistry::new(name));
        self.track_registry(Arc::clone(&registry) as Arc<dyn TrackedRegistry>);
        registry
    }

    /// Release `registry` as part of this facade's teardown.
    pub fn track_registry(&self, registry: Arc<dyn TrackedRegistry>) {
        {
            let mut registries = self.registries.lock();
            if self.state() != FacadeState::TornDown {
                registries.push(registry);
                return;
            }
        }
        for failure in registry.release_all() {
            warn!(facade = %self.name, error = %failure, "late registry release failed");
        }
    }

    /// Record how to give back a shared platform resource acquired at
    /// construction.
    pub fn acquire_shared<F>(&self, label: impl Into<String>, release: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let entry = Teardown {
            label: label.into(),
            run: Box::new(release),
        };
        if let Some(late) = self.push_unless_torn_down(&self.shared, entry) {
            self.run_late(late, "shared resource");
        }
    }

    /// Tear the facade down, once.
    ///
    /// Order: unregister callbacks so nothing new is published, release
    /// every registry, then release shared resources. A failing step is
    /// recorded and the rest still run. Later calls return an empty report
    /// with `already_torn_down` set.
    pub fn teardown(&self) -> TeardownReport {
        let previous = FacadeState::from_u8(
            self.state
                .swap(FacadeState::TornDown.as_u8(), Ordering::AcqRel),
        );
        let mut report = TeardownReport {
            facade: self.name.to_string(),
            ..TeardownReport::default()
        };
        if previous == FacadeState::TornDown {
            report.already_torn_down = true;
            return report;
        }

        // (a) callbacks, newest first
        let callbacks = std::mem::take(&mut *self.callbacks.lock());
        for entry in callbacks.into_iter().rev() {
            match (entry.run)() {
                Ok(()) => report.callbacks_unregistered += 1,
                Err(e) => report.failures.push(self.failure(&entry.label, e)),
            }
        }

        // (b) registries
        let registries = std::mem::take(&mut *self.registries.lock());
        for registry in registries {
            let live = registry.live();
            let failures = registry.release_all();
            report.objects_released += live;
            report.failures.extend(failures.into_iter().map(|mut f| {
                f.facade = self.name.to_string();
                f
            }));
        }

        // (c) shared resources, newest first
        let shared = std::mem::take(&mut *self.shared.lock());
        for entry in shared.into_iter().rev() {
            match (entry.run)() {
                Ok(()) => report.shared_released += 1,
                Err(e) => report.failures.push(self.failure(&entry.label, e)),
            }
        }

        for failure in &report.failures {
            warn!(
                client_id = %self.client_id,
                facade = %self.name,
                resource = %failure.resource,
                reason = %failure.reason,
                "teardown step failed"
            );
        }
        info!(
            client_id = %self.client_id,
            facade = %self.name,
            callbacks = report.callbacks_unregistered,
            objects = report.objects_released,
            shared = report.shared_released,
            failures = report.failures.len(),
            "facade torn down"
        );
        report
    }

    fn push_unless_torn_down(
        &self,
        list: &Mutex<Vec<Teardown>>,
        entry: Teardown,
    ) -> Option<Teardown> {
        let mut list = list.lock();
        // Checked under the list lock; teardown takes the list after the swap
        if self.state() == FacadeState::TornDown {
            return Some(entry);
        }
        list.push(entry);
        None
    }

    fn run_late(&self, entry: Teardown, kind: &str) {
        debug!(facade = %self.name, label = %entry.label, kind, "released after teardown");
        if let Err(e) = (entry.run)() {
            warn!(facade = %self.name, label = %entry.label, error = %e, "late release failed");
        }
    }

    fn failure(&self, label: &str, error: anyhow::Error) -> TeardownError {
        TeardownError::new(self.name.to_string(), label, format!("{error:#}"))
    }
}

impl std::fmt::Debug for FacadeCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FacadeCore")
            .field("name", &self.name)
            .field("client_id", &self.client_id)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Facade Trait
// ============================================================================

/// Conversion to `Arc<dyn Any>` so `Arc<dyn Facade>` can be downcast.
pub trait AsAnyArc {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAnyArc for T {
    fn into_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A capability unit exposing named operations to remote clients.
#[async_trait]
pub trait Facade: AsAnyArc + Send + Sync + 'static {
    fn core(&self) -> &FacadeCore;

    /// Run operation `method` with the call's arguments.
    async fn invoke(&self, method: &str, params: Params) -> Result<Value, CoreError>;

    fn teardown(&self) -> TeardownReport {
        self.core().teardown()
    }

    fn state(&self) -> FacadeState {
        self.core().state()
    }

    fn name(&self) -> &str {
        self.core().name()
    }
}

/// Downcast a type-erased facade to its concrete type.
pub fn downcast_facade<T: Facade>(facade: Arc<dyn Facade>) -> Option<Arc<T>> {
    facade.into_any_arc().downcast::<T>().ok()
}

// ============================================================================
// Factory and Context
// ============================================================================

/// Builds instances of one facade type.
pub trait FacadeFactory: Send + Sync + 'static {
    /// Name clients use to address the facade.
    fn name(&self) -> &'static str;

    /// Facades that must exist in the session before this one is built.
    fn dependencies(&self) -> &'static [&'static str] {
        &[]
    }

    fn create(&self, ctx: FacadeContext) -> anyhow::Result<Arc<dyn Facade>>;
}

/// Everything a factory receives from the session it builds for.
pub struct FacadeContext {
    facade: &'static str,
    client_id: ClientId,
    queue: Arc<EventQueue>,
    config: Arc<CoreConfig>,
    dependencies: HashMap<&'static str, Arc<dyn Facade>>,
}

impl FacadeContext {
    pub(crate) fn new(
        facade: &'static str,
        client_id: ClientId,
        queue: Arc<EventQueue>,
        config: Arc<CoreConfig>,
        dependencies: HashMap<&'static str, Arc<dyn Facade>>,
    ) -> Self {
        Self {
            facade,
            client_id,
            queue,
            config,
            dependencies,
        }
    }

    pub fn facade_name(&self) -> &'static str {
        self.facade
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn sink(&self) -> EventSink {
        self.queue.sink()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Fresh lifecycle core for the facade being built.
    pub fn core(&self) -> FacadeCore {
        FacadeCore::new(self.facade, self.client_id.clone(), self.sink())
    }

    /// A declared dependency, downcast to its concrete type.
    pub fn dependency<T: Facade>(&self, name: &str) -> Result<Arc<T>, CoreError> {
        let facade = self
            .dependencies
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownFacade(name.to_string()))?;
        downcast_facade::<T>(facade).ok_or_else(|| CoreError::FacadeConstruction {
            facade: self.facade.to_string(),
            reason: format!("dependency {name} has an unexpected type"),
        })
    }

    pub(crate) fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }
}

// ============================================================================
// Catalog
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("facade {0} is already registered")]
    Duplicate(String),

    #[error("facade {facade} depends on {dependency}, which is not registered before it")]
    UnknownDependency { facade: String, dependency: String },
}

/// The facade types a host offers, in registration order.
pub struct FacadeCatalog {
    factories: HashMap<&'static str, Arc<dyn FacadeFactory>>,
    order: Vec<&'static str>,
}

impl FacadeCatalog {
    /// Builder pre-populated with the built-in `events` facade.
    pub fn builder() -> FacadeCatalogBuilder {
        let mut catalog = FacadeCatalog {
            factories: HashMap::new(),
            order: Vec::new(),
        };
        catalog.insert(Arc::new(EventFacadeFactory));
        FacadeCatalogBuilder { catalog }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn FacadeFactory>, CoreError> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::UnknownFacade(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Facade names in registration order; dependencies come first.
    pub fn names(&self) -> &[&'static str] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn insert(&mut self, factory: Arc<dyn FacadeFactory>) {
        let name = factory.name();
        self.order.push(name);
        self.factories.insert(name, factory);
    }
}

impl Default for FacadeCatalog {
    fn default() -> Self {
        Self::builder().build()
    }
}

pub struct FacadeCatalogBuilder {
    catalog: FacadeCatalog,
}

impl FacadeCatalogBuilder {
    /// Add a factory. Its dependencies must already be registered.
    pub fn register<F: FacadeFactory>(mut self, factory: F) -> Result<Self, CatalogError> {
        let name = factory.name();
        if self.catalog.contains(name) {
            return Err(CatalogError::Duplicate(name.to_string()));
        }
        if let Some(missing) = factory
            .dependencies()
            .iter()
            .find(|dep| !self.catalog.contains(dep))
        {
            return Err(CatalogError::UnknownDependency {
                facade: name.to_string(),
                dependency: missing.to_string(),
            });
        }
        self.catalog.insert(Arc::new(factory));
        Ok(self)
    }

    pub fn build(self) -> FacadeCatalog {
        self.catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_facade::EVENTS_FACADE;
    use std::sync::atomic::AtomicUsize;

    fn core_with_queue() -> (FacadeCore, Arc<EventQueue>) {
        let queue = Arc::new(EventQueue::new());
        let core = FacadeCore::new("radio", ClientId::from("c1"), queue.sink());
        (core, queue)
    }

    struct Obj(Arc<AtomicUsize>);

    impl Resource for Obj {
        fn release(&self) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_emit_until_torn_down() {
        let (core, queue) = core_with_queue();
        // Callbacks may fire before the factory returns
        assert!(core.emit("early", Value::Null));
        assert!(core.activate());
        assert!(!core.activate());
        assert!(core.emit("onReady", Value::Null));

        let emitter = core.emitter();
        core.teardown();
        assert!(!emitter.emit("late", Value::Null));

        let names: Vec<_> = queue.poll(0).iter().map(|r| r.name().to_string()).collect();
        assert_eq!(names, vec!["early", "onReady"]);
    }

    #[test]
    fn test_teardown_order_and_idempotence() {
        let (core, _queue) = core_with_queue();
        core.activate();

        let log = Arc::new(Mutex::new(Vec::new()));
        let released = Arc::new(AtomicUsize::new(0));

        let registry = core.registry::<Obj>("objects");
        registry.create(Obj(Arc::clone(&released))).unwrap();
        registry.create(Obj(Arc::clone(&released))).unwrap();

        let l = Arc::clone(&log);
        core.acquire_shared("proxy", move || {
            l.lock().push("shared");
            Ok(())
        });
        let l = Arc::clone(&log);
        core.register_callback("listener", move || {
            l.lock().push("callback");
            Ok(())
        });

        let report = core.teardown();
        assert!(report.is_clean());
        assert!(!report.already_torn_down);
        assert_eq!(report.callbacks_unregistered, 1);
        assert_eq!(report.objects_released, 2);
        assert_eq!(report.shared_released, 1);
        assert_eq!(*log.lock(), vec!["callback", "shared"]);
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert!(registry.is_empty());

        let again = core.teardown();
        assert!(again.already_torn_down);
        assert_eq!(again.objects_released, 0);
        assert_eq!(released.load(Ordering::SeqCst), 2);
        assert_eq!(core.state(), FacadeState::TornDown);
    }

    #[test]
    fn test_teardown_continues_after_failure() {
        let (core, _queue) = core_with_queue();
        core.activate();
        let shared_released = Arc::new(AtomicUsize::new(0));

        core.register_callback("broken", || anyhow::bail!("listener already gone"));
        let counter = Arc::clone(&shared_released);
        core.acquire_shared("proxy", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = core.teardown();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].facade, "radio");
        assert_eq!(report.failures[0].resource, "broken");
        assert_eq!(shared_released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_teardown_of_uninitialized_facade() {
        let (core, _queue) = core_with_queue();
        let report = core.teardown();
        assert!(!report.already_torn_down);
        assert!(!core.activate());
        assert!(core.ensure_active().is_err());
    }

    #[test]
    fn test_registration_after_teardown_releases_immediately() {
        let (core, _queue) = core_with_queue();
        core.teardown();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        core.register_callback("late", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let released = Arc::new(AtomicUsize::new(0));
        let registry = core.registry::<Obj>("late objects");
        assert!(registry.create(Obj(Arc::clone(&released))).is_err());
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    struct Noop;
    impl FacadeFactory for Noop {
        fn name(&self) -> &'static str {
            "noop"
        }
        fn create(&self, _ctx: FacadeContext) -> anyhow::Result<Arc<dyn Facade>> {
            anyhow::bail!("not buildable")
        }
    }

    struct NeedsLater;
    impl FacadeFactory for NeedsLater {
        fn name(&self) -> &'static str {
            "early"
        }
        fn dependencies(&self) -> &'static [&'static str] {
            &["later"]
        }
        fn create(&self, _ctx: FacadeContext) -> anyhow::Result<Arc<dyn Facade>> {
            anyhow::bail!("not buildable")
        }
    }

    #[test]
    fn test_catalog_registration_rules() {
        let catalog = FacadeCatalog::builder().register(Noop).unwrap().build();
        assert_eq!(catalog.names(), &[EVENTS_FACADE, "noop"]);
        assert!(matches!(catalog.get("missing"), Err(CoreError::UnknownFacade(_))));

        let dup = FacadeCatalog::builder().register(Noop).unwrap().register(Noop);
        assert!(matches!(dup, Err(CatalogError::Duplicate(ref n)) if n == "noop"));

        let missing = FacadeCatalog::builder().register(NeedsLater);
        assert_eq!(
            missing.err(),
            Some(CatalogError::UnknownDependency {
                facade: "early".into(),
                dependency: "later".into(),
            })
        );
    }
}
