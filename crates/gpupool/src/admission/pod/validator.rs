//! Validating side of pod admission: single-pool, namespace enablement,
//! pool health, capacity.

use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::Api;
use kube::error::ErrorResponse;
use tracing::{debug, instrument};

use crate::api::{ClusterGPUPool, GPUPool, CONDITION_CONFIGURED, NAMESPACE_ENABLED_LABEL};
use crate::pool::{PoolObject, PoolScope};

use super::super::review::{AdmissionRequest, AdmissionResponse};
use super::super::{AdmissionError, Webhooks};
use super::{pool_reference, requested_units, PodPoolReference};

/// Resolves a pod's pool reference to the pool object; `None` when it does
/// not exist.
pub(crate) async fn load_pool_for(
    webhooks: &Webhooks,
    reference: &PodPoolReference,
    namespace: &str,
) -> Result<Option<PoolObject>, kube::Error> {
    let result = match reference.scope {
        PoolScope::Cluster => {
            let api: Api<ClusterGPUPool> = Api::all(webhooks.client.clone());
            api.get(&reference.name).await.map(PoolObject::Cluster)
        }
        PoolScope::Namespaced => {
            let api: Api<GPUPool> = Api::namespaced(webhooks.client.clone(), namespace);
            api.get(&reference.name).await.map(PoolObject::Namespaced)
        }
    };
    match result {
        Ok(pool) => Ok(Some(pool)),
        Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(None),
        Err(e) => Err(e),
    }
}

pub(crate) fn effective_namespace(request: &AdmissionRequest, pod: &Pod) -> String {
    pod.metadata
        .namespace
        .clone()
        .or_else(|| request.namespace.clone())
        .unwrap_or_else(|| "default".to_string())
}

async fn namespace_enabled(webhooks: &Webhooks, namespace: &str) -> Result<bool, kube::Error> {
    let api: Api<Namespace> = Api::all(webhooks.client.clone());
    match api.get(namespace).await {
        Ok(ns) => Ok(ns
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(NAMESPACE_ENABLED_LABEL))
            .map(|v| v == "true")
            .unwrap_or(false)),
        Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(false),
        Err(e) => Err(e),
    }
}

#[instrument(level = "info", skip_all, fields(pod = %request.name))]
pub(crate) async fn validate(
    webhooks: &Webhooks,
    request: &AdmissionRequest,
    pod: &Pod,
) -> Result<AdmissionResponse, AdmissionError> {
    let reference = match pool_reference(pod) {
        Ok(Some(reference)) => reference,
        Ok(None) => return Ok(AdmissionResponse::allow(&request.uid)),
        Err(e) => return Ok(AdmissionResponse::deny(&request.uid, e)),
    };
    debug!(pool = %reference.name, scope = reference.scope.as_str(), "pod requests pool");

    let namespace = effective_namespace(request, pod);
    if !namespace_enabled(webhooks, &namespace).await? {
        return Ok(AdmissionResponse::deny(
            &request.uid,
            format!(
                "namespace {:?} is not enabled for GPU workloads (label {}=true required)",
                namespace, NAMESPACE_ENABLED_LABEL
            ),
        ));
    }

    let pool = match load_pool_for(webhooks, &reference, &namespace).await? {
        Some(pool) => pool,
        None => {
            return Ok(AdmissionResponse::deny(
                &request.uid,
                format!("GPU pool {:?} not found", reference.name),
            ))
        }
    };

    let resource_name = pool.key().resource_name();
    let requested = requested_units(pod, &resource_name);
    if requested == 0 {
        // resource names matched but no amount was asked; nothing to gate
        return Ok(AdmissionResponse::allow(&request.uid));
    }

    if let Some(status) = pool.status() {
        if let Some(condition) = status.condition(CONDITION_CONFIGURED) {
            if condition.status == "False" {
                let reason = condition
                    .message
                    .clone()
                    .or_else(|| condition.reason.clone())
                    .unwrap_or_else(|| "pool is not configured".to_string());
                return Ok(AdmissionResponse::deny(
                    &request.uid,
                    format!("GPU pool {:?} is not configured: {}", reference.name, reason),
                ));
            }
        }
        let total = status.capacity.total;
        if total > 0 && requested > total {
            return Ok(AdmissionResponse::deny(
                &request.uid,
                format!(
                    "pod requests {} of {:?} but the pool only has {}",
                    requested, resource_name, total
                ),
            ));
        }
    }

    Ok(AdmissionResponse::allow(&request.uid))
}
