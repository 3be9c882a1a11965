use async_trait::async_trait;

use super::{Context, HandlerResult, PoolHandler};
use crate::api::{ResourceUnit, CONDITION_CONFIGURED};
use crate::pool::PoolObject;
use crate::selector;

/// Validates the pool spec against the module configuration and settles
/// the `Configured` condition the pod admission gate reads. A pool that
/// fails here is parked (the chain halts) until its spec or the module
/// config changes.
pub struct ConfigCheckHandler;

fn check(ctx: &Context, pool: &PoolObject) -> Result<(), (&'static str, String)> {
    let spec = pool.spec();

    if spec.resource.unit == ResourceUnit::MIG
        && spec.resource.mig_profile.as_deref().unwrap_or("").is_empty()
    {
        return Err((
            "MIGProfileRequired",
            "resource.unit is MIG but resource.migProfile is empty".to_string(),
        ));
    }
    if spec.resource.slices_per_unit < 0 {
        return Err((
            "InvalidSlicesPerUnit",
            format!(
                "resource.slicesPerUnit must not be negative, got {}",
                spec.resource.slices_per_unit
            ),
        ));
    }
    if let Some(node_selector) = &spec.node_selector {
        if let Err(e) = selector::compile(node_selector) {
            return Err(("InvalidNodeSelector", e.to_string()));
        }
    }

    let renderer = ctx.settings.current().renderer;
    if renderer.namespace.is_empty() || renderer.device_plugin_image.is_empty() {
        return Err((
            "RendererNotConfigured",
            "module settings must provide renderer.namespace and renderer.devicePluginImage"
                .to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl PoolHandler for ConfigCheckHandler {
    fn name(&self) -> &'static str {
        "config-check"
    }

    async fn handle(&self, ctx: &Context, pool: &mut PoolObject) -> anyhow::Result<HandlerResult> {
        match check(ctx, pool) {
            Ok(()) => {
                pool.status_mut()
                    .set_condition(CONDITION_CONFIGURED, true, "Ok", "pool is configured");
                Ok(HandlerResult::proceed())
            }
            Err((reason, message)) => {
                pool.status_mut()
                    .set_condition(CONDITION_CONFIGURED, false, reason, &message);
                Ok(HandlerResult::halt())
            }
        }
    }
}
