use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{Context, HandlerResult, PoolHandler};
use crate::api::CONDITION_MAINTENANCE;
use crate::pool::PoolObject;

const MAINTENANCE_REQUEUE: Duration = Duration::from_secs(30);

/// Suspends the chain while the pool's `Maintenance` condition is True.
/// The pool is checked again every 30 seconds so lifting the condition
/// resumes reconciliation without an external event.
pub struct MaintenanceHandler;

#[async_trait]
impl PoolHandler for MaintenanceHandler {
    fn name(&self) -> &'static str {
        "maintenance"
    }

    async fn handle(
        &self,
        _ctx: &Context,
        pool: &mut PoolObject,
    ) -> anyhow::Result<HandlerResult> {
        let in_maintenance = pool
            .status()
            .map(|s| s.condition_is_true(CONDITION_MAINTENANCE))
            .unwrap_or(false);
        if in_maintenance {
            info!("pool is in maintenance, skipping reconciliation");
            return Ok(HandlerResult::halt_and_requeue_after(MAINTENANCE_REQUEUE));
        }
        Ok(HandlerResult::proceed())
    }
}
