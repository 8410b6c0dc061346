//! Built-in `events` facade: the client's way to consume its session's queue.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::errors::CoreError;
use crate::events::{EventQueue, EventSink};
use crate::facade::{Facade, FacadeContext, FacadeCore, FacadeFactory};
use crate::params::Params;

/// Name of the built-in event facade in every catalog.
pub const EVENTS_FACADE: &str = "events";

/// Exposes `poll`, `wait`, `waitFor`, `post`, `clear` and `stats` over the
/// session's event queue.
pub struct EventFacade {
    core: FacadeCore,
    queue: Arc<EventQueue>,
    default_max: usize,
    default_timeout: Duration,
}

impl EventFacade {
    /// Queue sink for dependent facades that publish on the session's behalf.
    pub fn sink(&self) -> EventSink {
        self.queue.sink()
    }

    pub fn pending(&self) -> usize {
        self.queue.pending()
    }

    fn timeout(&self, params: &Params) -> Result<Duration, CoreError> {
        Ok(params
            .optional::<u64>("timeout_ms")?
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout))
    }

    fn max(&self, params: &Params) -> Result<usize, CoreError> {
        Ok(params.optional::<usize>("max")?.unwrap_or(self.default_max))
    }
}

#[async_trait]
impl Facade for EventFacade {
    fn core(&self) -> &FacadeCore {
        &self.core
    }

    async fn invoke(&self, method: &str, params: Params) -> Result<Value, CoreError> {
        self.core.ensure_active()?;
        match method {
            "poll" => {
                let records = self.queue.poll(self.max(&params)?);
                Ok(serde_json::to_value(records).map_err(anyhow::Error::from)?)
            }
            "wait" => {
                let max = self.max(&params)?;
                let timeout = self.timeout(&params)?;
                let records = self.queue.drain(max, timeout).await;
                Ok(serde_json::to_value(records).map_err(anyhow::Error::from)?)
            }
            "waitFor" => {
                let name: String = params.required("name")?;
                let timeout = self.timeout(&params)?;
                let record = self.queue.wait_for(&name, timeout).await;
                Ok(serde_json::to_value(record).map_err(anyhow::Error::from)?)
            }
            "post" => {
                let name: String = params.required("name")?;
                let data = params.optional::<Value>("data")?.unwrap_or(Value::Null);
                Ok(json!(self.queue.publish(name, data)))
            }
            "clear" => Ok(json!(self.queue.clear())),
            "stats" => Ok(serde_json::to_value(self.queue.stats()).map_err(anyhow::Error::from)?),
            other => Err(CoreError::UnknownMethod {
                facade: EVENTS_FACADE.to_string(),
                method: other.to_string(),
            }),
        }
    }
}

/// Factory registered automatically by [`crate::FacadeCatalog::builder`].
pub struct EventFacadeFactory;

impl FacadeFactory for EventFacadeFactory {
    fn name(&self) -> &'static str {
        EVENTS_FACADE
    }

    fn create(&self, ctx: FacadeContext) -> anyhow::Result<Arc<dyn Facade>> {
        Ok(Arc::new(EventFacade {
            core: ctx.core(),
            queue: Arc::clone(ctx.queue()),
            default_max: ctx.config().default_drain_max,
            default_timeout: ctx.config().default_wait_timeout(),
        }))
    }
}
