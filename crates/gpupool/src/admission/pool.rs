//! Pool admission: cluster-wide name uniqueness, spec immutability, and
//! the shared defaulting handlers that run in both the mutating and the
//! validating path.

use kube::api::{Api, ListParams};
use kube::ResourceExt;
use tracing::{info, instrument};

use crate::api::{
    ClusterGPUPool, GPUPool, GPUPoolSpec, ModuleSettings, ResourceUnit, STRATEGY_SPREAD,
};
use crate::pool::PoolObject;

use super::review::{AdmissionRequest, AdmissionResponse, Operation};
use super::{AdmissionError, Webhooks};

/// One defaulting/validation rule over a pool spec. The defaulter runs
/// them against the incoming object; the validator runs them against a
/// deep copy and turns any error into a denial.
pub trait PoolSyncHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn sync(&self, settings: &ModuleSettings, spec: &mut GPUPoolSpec) -> Result<(), String>;
}

struct SchedulingDefaults;

impl PoolSyncHandler for SchedulingDefaults {
    fn name(&self) -> &'static str {
        "scheduling-defaults"
    }

    fn sync(&self, settings: &ModuleSettings, spec: &mut GPUPoolSpec) -> Result<(), String> {
        if spec.scheduling.taints_enabled.is_none() {
            spec.scheduling.taints_enabled = Some(true);
        }
        if spec.scheduling.strategy.as_deref().unwrap_or("").is_empty() {
            spec.scheduling.strategy = settings.scheduling.default_strategy.clone();
        }
        if spec.scheduling.strategy.as_deref() == Some(STRATEGY_SPREAD)
            && spec.scheduling.topology_key.as_deref().unwrap_or("").is_empty()
        {
            spec.scheduling.topology_key = settings.scheduling.topology_key.clone();
        }
        Ok(())
    }
}

struct ResourceDefaults;

impl PoolSyncHandler for ResourceDefaults {
    fn name(&self) -> &'static str {
        "resource-defaults"
    }

    fn sync(&self, _settings: &ModuleSettings, spec: &mut GPUPoolSpec) -> Result<(), String> {
        if spec.resource.slices_per_unit < 0 {
            return Err(format!(
                "resource.slicesPerUnit must not be negative, got {}",
                spec.resource.slices_per_unit
            ));
        }
        match spec.resource.unit {
            ResourceUnit::MIG => {
                if spec.resource.mig_profile.as_deref().unwrap_or("").is_empty() {
                    return Err("resource.migProfile is required for MIG pools".to_string());
                }
            }
            ResourceUnit::Card => {
                if spec.resource.mig_profile.is_some() {
                    return Err("resource.migProfile is only valid for MIG pools".to_string());
                }
            }
        }
        Ok(())
    }
}

pub fn sync_handlers() -> Vec<Box<dyn PoolSyncHandler>> {
    vec![Box::new(SchedulingDefaults), Box::new(ResourceDefaults)]
}

fn decode_pool(request: &AdmissionRequest) -> Result<(PoolObject, Option<PoolObject>), AdmissionError> {
    match request.kind.kind.as_str() {
        "ClusterGPUPool" => {
            let new: ClusterGPUPool = request.decode()?;
            let old: Option<ClusterGPUPool> = request.decode_old()?;
            Ok((PoolObject::Cluster(new), old.map(PoolObject::Cluster)))
        }
        "GPUPool" => {
            let new: GPUPool = request.decode()?;
            let old: Option<GPUPool> = request.decode_old()?;
            Ok((PoolObject::Namespaced(new), old.map(PoolObject::Namespaced)))
        }
        other => Err(AdmissionError::Unprocessable(format!(
            "unexpected kind {:?} on the pool webhook",
            other
        ))),
    }
}

impl Webhooks {
    /// Validating webhook for GPUPool and ClusterGPUPool.
    #[instrument(level = "info", skip_all, fields(pool = %request.name, op = ?request.operation))]
    pub async fn validate_pool(
        &self,
        request: &AdmissionRequest,
    ) -> Result<AdmissionResponse, AdmissionError> {
        if request.operation == Operation::Delete {
            // rule misconfiguration: deletes are not gated, only observed
            info!("pool deletion observed by the validating webhook, allowing");
            return Ok(AdmissionResponse::allow(&request.uid));
        }
        let (pool, old) = decode_pool(request)?;

        if request.operation == Operation::Update {
            if let Some(old) = &old {
                let before = serde_json::to_value(old.spec()).unwrap_or_default();
                let after = serde_json::to_value(pool.spec()).unwrap_or_default();
                if before != after {
                    return Ok(AdmissionResponse::deny(
                        &request.uid,
                        "the GPUPool spec is immutable; delete and recreate the pool to change it",
                    ));
                }
            }
        }

        if let Some(collision) = self.name_collision(&pool).await? {
            return Ok(AdmissionResponse::deny(&request.uid, collision));
        }

        let settings = self.settings.current();
        let mut copy = pool.spec().clone();
        for handler in sync_handlers() {
            if let Err(reason) = handler.sync(&settings, &mut copy) {
                return Ok(AdmissionResponse::deny(
                    &request.uid,
                    format!("{}: {}", handler.name(), reason),
                ));
            }
        }
        Ok(AdmissionResponse::allow(&request.uid))
    }

    /// Mutating webhook for GPUPool and ClusterGPUPool: runs the same
    /// handlers, but keeps their mutations as a JSON patch.
    #[instrument(level = "info", skip_all, fields(pool = %request.name, op = ?request.operation))]
    pub async fn mutate_pool(
        &self,
        request: &AdmissionRequest,
    ) -> Result<AdmissionResponse, AdmissionError> {
        if request.operation == Operation::Delete {
            return Ok(AdmissionResponse::allow(&request.uid));
        }
        let (pool, _) = decode_pool(request)?;

        let settings = self.settings.current();
        let before = pool.spec().clone();
        let mut after = before.clone();
        for handler in sync_handlers() {
            if let Err(reason) = handler.sync(&settings, &mut after) {
                return Ok(AdmissionResponse::deny(
                    &request.uid,
                    format!("{}: {}", handler.name(), reason),
                ));
            }
        }

        let before = serde_json::json!({ "spec": before });
        let after = serde_json::json!({ "spec": after });
        let patch = json_patch::diff(&before, &after);
        if patch.0.is_empty() {
            return Ok(AdmissionResponse::allow(&request.uid));
        }
        AdmissionResponse::allow(&request.uid)
            .with_patch(&patch)
            .map_err(|e| AdmissionError::Unprocessable(format!("cannot encode patch: {}", e)))
    }

    /// Pool names are cluster-wide unique, across both scopes and across
    /// namespaces. Returns the denial message on collision.
    async fn name_collision(&self, pool: &PoolObject) -> Result<Option<String>, kube::Error> {
        let name = pool.name();
        let cluster_pools: Api<ClusterGPUPool> = Api::all(self.client.clone());
        let cluster_pools = cluster_pools.list(&ListParams::default()).await?.items;
        let namespaced_pools: Api<GPUPool> = Api::all(self.client.clone());
        let namespaced_pools = namespaced_pools.list(&ListParams::default()).await?.items;

        match pool {
            PoolObject::Cluster(_) => {
                if let Some(other) = namespaced_pools.iter().find(|p| p.name() == name) {
                    return Ok(Some(format!(
                        "a GPUPool named {:?} already exists in namespace {:?}",
                        name,
                        other.namespace().unwrap_or_default()
                    )));
                }
            }
            PoolObject::Namespaced(new) => {
                if cluster_pools.iter().any(|p| p.name() == name) {
                    return Ok(Some(format!(
                        "a ClusterGPUPool named {:?} already exists",
                        name
                    )));
                }
                if let Some(other) = namespaced_pools
                    .iter()
                    .find(|p| p.name() == name && p.namespace() != new.namespace())
                {
                    return Ok(Some(format!(
                        "a GPUPool named {:?} already exists in namespace {:?}",
                        name,
                        other.namespace().unwrap_or_default()
                    )));
                }
            }
        }
        Ok(None)
    }
}
