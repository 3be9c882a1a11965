use async_trait::async_trait;
use tracing::warn;

use super::{Context, HandlerResult, PoolHandler};
use crate::api::{CONDITION_CONFIGURED, PROVIDER_NVIDIA};
use crate::pool::PoolObject;

/// Parks pools whose provider this control plane cannot drive. An empty
/// provider counts as Nvidia so bare specs keep working.
pub struct CompatibilityHandler;

#[async_trait]
impl PoolHandler for CompatibilityHandler {
    fn name(&self) -> &'static str {
        "compatibility-check"
    }

    async fn handle(
        &self,
        _ctx: &Context,
        pool: &mut PoolObject,
    ) -> anyhow::Result<HandlerResult> {
        let provider = pool.spec().provider.clone().unwrap_or_default();
        if provider.is_empty() || provider == PROVIDER_NVIDIA {
            return Ok(HandlerResult::proceed());
        }
        warn!(%provider, "unsupported provider, parking pool");
        pool.status_mut().set_condition(
            CONDITION_CONFIGURED,
            false,
            "UnsupportedProvider",
            &format!("provider {:?} is not supported", provider),
        );
        Ok(HandlerResult::halt())
    }
}
