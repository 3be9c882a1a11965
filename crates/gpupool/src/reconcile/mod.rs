//! The pool reconciler: a linear chain of handlers driven once per
//! dequeued pool key.
//!
//! Each handler may mutate the in-memory pool status and side-effect the
//! cluster; the driver patches status once at chain end. A handler error
//! aborts the chain and drops the in-memory mutations — nothing
//! half-reconciled is persisted.

mod compatibility;
mod config_check;
mod dp_validation;
mod maintenance;
mod node_mark;
mod pod_usage;
mod render;
mod selection;

use std::time::Duration;

use async_trait::async_trait;
use kube::Client;
use tracing::{debug, instrument};

use crate::moduleconfig::SettingsStore;
use crate::pool::{PoolKey, PoolObject};

pub use render::cleanup as render_cleanup;

/// Shared dependencies handed to every handler.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub settings: SettingsStore,
}

/// What one handler asks of the driver.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct HandlerResult {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
    /// Stop the chain after this handler.
    pub halt: bool,
}

impl HandlerResult {
    pub fn proceed() -> Self {
        HandlerResult::default()
    }

    pub fn halt() -> Self {
        HandlerResult {
            halt: true,
            ..Default::default()
        }
    }

    pub fn halt_and_requeue_after(after: Duration) -> Self {
        HandlerResult {
            requeue: true,
            requeue_after: Some(after),
            halt: true,
        }
    }
}

/// Aggregated requeue hints of one chain run: any requeue wins, the
/// smallest positive delay wins.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub requeue: bool,
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    fn merge(&mut self, result: HandlerResult) {
        self.requeue |= result.requeue;
        if let Some(after) = result.requeue_after {
            self.requeue_after = match self.requeue_after {
                Some(current) => Some(std::cmp::min(current, after)),
                None => Some(after),
            };
        }
    }
}

#[async_trait]
pub trait PoolHandler: Send + Sync {
    fn name(&self) -> &'static str;
    async fn handle(&self, ctx: &Context, pool: &mut PoolObject)
        -> anyhow::Result<HandlerResult>;
}

pub struct Reconciler {
    ctx: Context,
    handlers: Vec<Box<dyn PoolHandler>>,
}

impl Reconciler {
    pub fn new(client: Client, settings: SettingsStore) -> Self {
        Reconciler {
            ctx: Context { client, settings },
            handlers: vec![
                Box::new(maintenance::MaintenanceHandler),
                Box::new(compatibility::CompatibilityHandler),
                Box::new(config_check::ConfigCheckHandler),
                Box::new(selection::SelectionSyncHandler),
                Box::new(node_mark::NodeMarkHandler),
                Box::new(render::RenderHandler),
                Box::new(dp_validation::DevicePluginValidationHandler),
                Box::new(pod_usage::PodUsageHandler),
            ],
        }
    }

    /// Runs the chain for one pool. A pool that is gone ends the reconcile
    /// quietly; that is not an error.
    #[instrument(level = "info", skip(self), fields(pool = %key))]
    pub async fn reconcile(&self, key: &PoolKey) -> anyhow::Result<ReconcileOutcome> {
        let mut pool = match PoolObject::get(&self.ctx.client, key).await? {
            Some(pool) => pool,
            None => {
                debug!("pool is gone, nothing to reconcile");
                return Ok(ReconcileOutcome::default());
            }
        };
        let observed_status = pool.status().cloned().unwrap_or_default();

        let mut outcome = ReconcileOutcome::default();
        for handler in &self.handlers {
            debug!(handler = handler.name(), "running handler");
            let result = handler.handle(&self.ctx, &mut pool).await.map_err(|e| {
                e.context(format!("handler {} failed for pool {}", handler.name(), key))
            })?;
            outcome.merge(result);
            if result.halt {
                debug!(handler = handler.name(), "handler halted the chain");
                break;
            }
        }

        if pool.status() != Some(&observed_status) {
            pool.patch_status(&self.ctx.client).await?;
        }
        Ok(outcome)
    }
}
