//! Handle registry: a facade-local table of server-side objects addressed by
//! monotonically increasing handles.
//!
//! Each registry owns its own counter, so handles are scoped to the facade
//! instance (and therefore the session) that created them. A handle is never
//! reissued during the registry's lifetime, even after removal. Object
//! teardown (`Resource::release`) always runs after the registry lock has been
//! dropped.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::{CoreError, TeardownError};
use crate::types::Handle;

/// A server-side object that can be held in a [`HandleRegistry`].
pub trait Resource: Send + Sync + 'static {
    /// Stop, close, or disconnect the underlying platform object.
    ///
    /// Called exactly once when the object leaves the registry through
    /// [`HandleRegistry::release`] or [`HandleRegistry::release_all`].
    fn release(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Inner<T> {
    /// Next handle to issue; `None` once the handle space is exhausted
    next: Option<Handle>,
    last_issued: Option<Handle>,
    objects: BTreeMap<Handle, Arc<T>>,
    /// Set by `release_all`; no further objects are accepted
    closed: bool,
}

/// Thread-safe handle → object table.
pub struct HandleRegistry<T: Resource> {
    name: String,
    inner: Mutex<Inner<T>>,
}

impl<T: Resource> HandleRegistry<T> {
    /// Create an empty registry. `name` appears in invalid-handle errors.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                next: Some(Handle::FIRST),
                last_issued: None,
                objects: BTreeMap::new(),
                closed: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store an already-built object and return its handle.
    pub fn create(&self, object: T) -> Result<Handle, CoreError> {
        self.store(Arc::new(object))
    }

    /// Build an object with `factory` and store it.
    ///
    /// The factory runs without the registry lock held. If it fails no
    /// handle is consumed.
    pub fn try_create<F>(&self, factory: F) -> Result<Handle, CoreError>
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        let object = factory()?;
        self.store(Arc::new(object))
    }

    fn store(&self, object: Arc<T>) -> Result<Handle, CoreError> {
        let rejected = {
            let mut inner = self.inner.lock();
            if inner.closed {
                Err(CoreError::RegistryClosed {
                    registry: self.name.clone(),
                })
            } else if let Some(handle) = inner.next {
                inner.next = handle.next();
                inner.last_issued = Some(handle);
                inner.objects.insert(handle, object);
                debug!(registry = %self.name, handle = %handle, "object registered");
                return Ok(handle);
            } else {
                Err(CoreError::RegistryExhausted {
                    registry: self.name.clone(),
                })
            }
        };

        // Never stored, so nobody else can release it.
        if let Err(e) = object.release() {
            warn!(registry = %self.name, error = %e, "failed to release rejected object");
        }
        rejected
    }

    /// Look up an object without removing it.
    pub fn get(&self, handle: Handle) -> Result<Arc<T>, CoreError> {
        self.inner
            .lock()
            .objects
            .get(&handle)
            .cloned()
            .ok_or_else(|| self.invalid(handle))
    }

    /// Remove an object and hand it back to the caller.
    ///
    /// The registry does not call [`Resource::release`]; the caller owns
    /// teardown of the returned object.
    pub fn remove(&self, handle: Handle) -> Result<Arc<T>, CoreError> {
        let removed = self.inner.lock().objects.remove(&handle);
        removed.ok_or_else(|| self.invalid(handle))
    }

    /// Remove an object and release it.
    pub fn release(&self, handle: Handle) -> Result<(), CoreError> {
        let object = self.remove(handle)?;
        object.release().map_err(CoreError::Platform)
    }

    /// Visit every live object.
    ///
    /// Iterates a snapshot taken under the lock; `f` runs with the lock
    /// released and may call back into the registry.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(Handle, &Arc<T>),
    {
        let snapshot: Vec<(Handle, Arc<T>)> = self
            .inner
            .lock()
            .objects
            .iter()
            .map(|(h, o)| (*h, Arc::clone(o)))
            .collect();
        for (handle, object) in &snapshot {
            f(*handle, object);
        }
    }

    /// Remove every object, in handle order, without releasing them.
    pub fn drain_all(&self) -> Vec<(Handle, Arc<T>)> {
        let objects = std::mem::take(&mut self.inner.lock().objects);
        objects.into_iter().collect()
    }

    /// Remove and release every object and stop accepting new ones.
    ///
    /// A failed release is recorded and the remaining objects are still
    /// released. The `facade` field of each error is left empty for the
    /// owning facade to fill in.
    pub fn release_all(&self) -> Vec<TeardownError> {
        let drained = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.objects)
        };

        let mut failures = Vec::new();
        for (handle, object) in drained {
            if let Err(e) = object.release() {
                warn!(registry = %self.name, handle = %handle, error = %e, "release failed");
                failures.push(TeardownError::new(
                    String::new(),
                    format!("{} #{}", self.name, handle),
                    e,
                ));
            }
        }
        failures
    }

    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.inner.lock().objects.contains_key(&handle)
    }

    /// Live handles in ascending order.
    pub fn handles(&self) -> Vec<Handle> {
        self.inner.lock().objects.keys().copied().collect()
    }

    /// Most recently issued handle, live or not.
    pub fn last_issued(&self) -> Option<Handle> {
        self.inner.lock().last_issued
    }

    fn invalid(&self, handle: Handle) -> CoreError {
        debug!(registry = %self.name, handle = %handle, "invalid handle");
        CoreError::invalid_handle(&self.name, handle)
    }
}

/// Type-erased view of a registry, so one facade can own registries of
/// different object types and release them together.
pub trait TrackedRegistry: Send + Sync {
    fn name(&self) -> &str;
    fn live(&self) -> usize;
    fn release_all(&self) -> Vec<TeardownError>;
}

impl<T: Resource> TrackedRegistry for HandleRegistry<T> {
    fn name(&self) -> &str {
        HandleRegistry::name(self)
    }

    fn live(&self) -> usize {
        self.len()
    }

    fn release_all(&self) -> Vec<TeardownError> {
        HandleRegistry::release_all(self)
    }
}
