//! Testing utilities: a simulated platform layer and a domain facade built on
//! top of it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::errors::CoreError;
use crate::event_facade::{EventFacade, EVENTS_FACADE};
use crate::events::scoped_event_name;
use crate::facade::{Facade, FacadeContext, FacadeCore, FacadeFactory};
use crate::params::Params;
use crate::readiness::ReadySignal;
use crate::registry::{HandleRegistry, Resource};

/// Listener invoked by [`MockPlatform::fire`].
pub type Listener = Arc<dyn Fn(Value) + Send + Sync>;

/// Simulated hardware layer.
///
/// Listeners can be fired from any thread, like real platform callbacks.
/// Every object release and proxy acquisition is recorded so tests can check
/// that teardown released each resource exactly once.
pub struct MockPlatform {
    listeners: Mutex<HashMap<u64, (String, Listener)>>,
    next_listener: AtomicU64,
    proxies_held: AtomicUsize,
    facades_created: AtomicUsize,
    released: Mutex<Vec<String>>,
    fail_release: AtomicBool,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            proxies_held: AtomicUsize::new(0),
            facades_created: AtomicUsize::new(0),
            released: Mutex::new(Vec::new()),
            fail_release: AtomicBool::new(false),
        })
    }

    /// Register a listener for `topic`; returns its id.
    pub fn add_listener(&self, topic: &str, listener: Listener) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .insert(id, (topic.to_string(), listener));
        id
    }

    pub fn remove_listener(&self, id: u64) -> anyhow::Result<()> {
        match self.listeners.lock().remove(&id) {
            Some(_) => Ok(()),
            None => anyhow::bail!("listener {id} is not registered"),
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Invoke every listener for `topic` on the calling thread, outside the
    /// listener lock. Returns how many ran.
    pub fn fire(&self, topic: &str, payload: Value) -> usize {
        let targets: Vec<Listener> = self
            .listeners
            .lock()
            .values()
            .filter(|(t, _)| t == topic)
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in &targets {
            listener(payload.clone());
        }
        targets.len()
    }

    /// [`MockPlatform::fire`] from a freshly spawned thread.
    pub fn fire_from_thread(self: &Arc<Self>, topic: &str, payload: Value) -> JoinHandle<usize> {
        let platform = Arc::clone(self);
        let topic = topic.to_string();
        std::thread::spawn(move || platform.fire(&topic, payload))
    }

    pub fn acquire_proxy(&self) -> anyhow::Result<()> {
        self.proxies_held.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn release_proxy(&self) -> anyhow::Result<()> {
        let previous = self.proxies_held.fetch_sub(1, Ordering::SeqCst);
        if previous == 0 {
            self.proxies_held.store(0, Ordering::SeqCst);
            anyhow::bail!("proxy released more often than acquired");
        }
        Ok(())
    }

    pub fn proxies_held(&self) -> usize {
        self.proxies_held.load(Ordering::SeqCst)
    }

    pub fn facades_created(&self) -> usize {
        self.facades_created.load(Ordering::SeqCst)
    }

    /// Make every object release fail (the object is still recorded).
    pub fn set_fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    /// Labels of released objects, in release order.
    pub fn released(&self) -> Vec<String> {
        self.released.lock().clone()
    }

    /// How many times the object labelled `label` was released.
    pub fn release_count(&self, label: &str) -> usize {
        self.released.lock().iter().filter(|l| *l == label).count()
    }

    fn record_release(&self, label: &str) -> anyhow::Result<()> {
        self.released.lock().push(label.to_string());
        if self.fail_release.load(Ordering::SeqCst) {
            anyhow::bail!("platform refused to release {label}");
        }
        Ok(())
    }
}

/// Platform object held in a [`MockRadioFacade`] registry.
pub struct MockDevice {
    label: String,
    platform: Arc<MockPlatform>,
}

impl MockDevice {
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Resource for MockDevice {
    fn release(&self) -> anyhow::Result<()> {
        self.platform.record_release(&self.label)
    }
}

/// Name of [`MockRadioFacade`] in the catalog.
pub const RADIO_FACADE: &str = "radio";

/// Domain facade with two handle registries, a platform callback and a
/// shared proxy.
///
/// Operations: `connect {address}`, `disconnect {handle}`, `startScan`,
/// `stopScan {handle}`, `counts`, `waitReady {timeout_ms?}`.
pub struct MockRadioFacade {
    core: FacadeCore,
    platform: Arc<MockPlatform>,
    connections: Arc<HandleRegistry<MockDevice>>,
    scanners: Arc<HandleRegistry<MockDevice>>,
    ready: ReadySignal,
    events: Arc<EventFacade>,
}

impl MockRadioFacade {
    pub fn connections(&self) -> &Arc<HandleRegistry<MockDevice>> {
        &self.connections
    }

    pub fn scanners(&self) -> &Arc<HandleRegistry<MockDevice>> {
        &self.scanners
    }

    pub fn ready(&self) -> &ReadySignal {
        &self.ready
    }

    /// The session's event facade, resolved as a construction dependency.
    pub fn events(&self) -> &Arc<EventFacade> {
        &self.events
    }
}

#[async_trait]
impl Facade for MockRadioFacade {
    fn core(&self) -> &FacadeCore {
        &self.core
    }

    async fn invoke(&self, method: &str, params: Params) -> Result<Value, CoreError> {
        self.core.ensure_active()?;
        match method {
            "connect" => {
                let address: String = params.required("address")?;
                let handle = self.connections.create(MockDevice {
                    label: format!("connection:{address}"),
                    platform: Arc::clone(&self.platform),
                })?;
                self.core.emit(
                    scoped_event_name("RadioConnect", handle, "onConnectionStateChange"),
                    json!({ "address": address, "state": "connected" }),
                );
                Ok(json!(handle))
            }
            "disconnect" => {
                let handle = params.handle("handle")?;
                self.connections.release(handle)?;
                Ok(Value::Null)
            }
            "startScan" => {
                let index = self.scanners.last_issued().map_or(1, |h| h.get() + 1);
                let handle = self.scanners.create(MockDevice {
                    label: format!("scanner:{index}"),
                    platform: Arc::clone(&self.platform),
                })?;
                Ok(json!(handle))
            }
            "stopScan" => {
                let handle = params.handle("handle")?;
                self.scanners.release(handle)?;
                Ok(Value::Null)
            }
            "counts" => Ok(json!({
                "connections": self.connections.len(),
                "scanners": self.scanners.len(),
            })),
            "waitReady" => {
                let timeout = params.optional::<u64>("timeout_ms")?.unwrap_or(0);
                Ok(json!(
                    self.ready.wait_ready(Duration::from_millis(timeout)).await
                ))
            }
            other => Err(CoreError::UnknownMethod {
                facade: RADIO_FACADE.to_string(),
                method: other.to_string(),
            }),
        }
    }
}

/// Factory for [`MockRadioFacade`]; depends on the `events` facade.
pub struct MockRadioFactory {
    platform: Arc<MockPlatform>,
}

impl MockRadioFactory {
    pub fn new(platform: Arc<MockPlatform>) -> Self {
        Self { platform }
    }
}

impl FacadeFactory for MockRadioFactory {
    fn name(&self) -> &'static str {
        RADIO_FACADE
    }

    fn dependencies(&self) -> &'static [&'static str] {
        &[EVENTS_FACADE]
    }

    fn create(&self, ctx: FacadeContext) -> anyhow::Result<Arc<dyn Facade>> {
        let events = ctx.dependency::<EventFacade>(EVENTS_FACADE)?;
        let core = ctx.core();
        let platform = Arc::clone(&self.platform);

        platform.acquire_proxy()?;
        let proxy_platform = Arc::clone(&platform);
        core.acquire_shared("radio proxy", move || proxy_platform.release_proxy());

        let ready = ReadySignal::new("radio proxy");
        let connected = ready.clone();
        let id = platform.add_listener(
            "serviceConnected",
            Arc::new(move |_: Value| connected.set_ready()),
        );
        let listener_platform = Arc::clone(&platform);
        core.register_callback("serviceConnected listener", move || {
            listener_platform.remove_listener(id)
        });

        let emitter = core.emitter();
        let id = platform.add_listener(
            "stateChanged",
            Arc::new(move |payload: Value| {
                emitter.emit("RadioStateChanged", payload);
            }),
        );
        let listener_platform = Arc::clone(&platform);
        core.register_callback("stateChanged listener", move || {
            listener_platform.remove_listener(id)
        });

        let connections = core.registry("connection registry");
        let scanners = core.registry("scanner registry");

        platform.facades_created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockRadioFacade {
            core,
            platform,
            connections,
            scanners,
            ready,
            events,
        }))
    }
}
