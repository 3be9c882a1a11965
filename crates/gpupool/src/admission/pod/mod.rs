//! Pod admission: pool selection scan, requested-unit accounting, and the
//! defaulting/validating handlers built on them.

mod defaulter;
mod validator;

pub use defaulter::{apply_defaults, DefaulterInput};
pub(crate) use validator::load_pool_for;

use k8s_openapi::api::core::v1::{Container, Pod};
use thiserror::Error;

use crate::pool::{parse_resource_name, PoolScope};

use super::review::{AdmissionRequest, AdmissionResponse};
use super::{AdmissionError, Webhooks};

/// The single pool a pod may consume.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodPoolReference {
    pub scope: PoolScope,
    pub name: String,
}

#[derive(Debug, Error)]
#[error("multiple GPU pools requested")]
pub struct MultiplePools;

/// Scans every container and init container for pool resource names.
/// No pool is a no-op for admission; more than one distinct pool is denied.
pub fn pool_reference(pod: &Pod) -> Result<Option<PodPoolReference>, MultiplePools> {
    let mut found: Option<PodPoolReference> = None;
    let spec = match &pod.spec {
        Some(spec) => spec,
        None => return Ok(None),
    };
    let init = spec.init_containers.iter().flatten();
    for container in spec.containers.iter().chain(init) {
        for name in container_resource_names(container) {
            if let Some((scope, pool)) = parse_resource_name(&name) {
                let reference = PodPoolReference {
                    scope,
                    name: pool.to_string(),
                };
                match &found {
                    None => found = Some(reference),
                    Some(existing) if *existing == reference => {}
                    Some(_) => return Err(MultiplePools),
                }
            }
        }
    }
    Ok(found)
}

fn container_resource_names(container: &Container) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(resources) = &container.resources {
        for map in [&resources.limits, &resources.requests] {
            if let Some(map) = map {
                names.extend(map.keys().cloned());
            }
        }
    }
    names
}

/// Units of `resource_name` one container asks for, preferring limits over
/// requests.
fn container_units(container: &Container, resource_name: &str) -> i64 {
    let resources = match &container.resources {
        Some(resources) => resources,
        None => return 0,
    };
    let quantity = resources
        .limits
        .as_ref()
        .and_then(|m| m.get(resource_name))
        .or_else(|| resources.requests.as_ref().and_then(|m| m.get(resource_name)));
    quantity
        .map(|q| q.0.parse::<i64>().unwrap_or(0))
        .unwrap_or(0)
}

/// Total units the pod requests of `resource_name`: regular containers run
/// together and sum; init containers run one at a time, so the largest
/// single init request competes with that sum.
pub fn requested_units(pod: &Pod, resource_name: &str) -> i64 {
    let spec = match &pod.spec {
        Some(spec) => spec,
        None => return 0,
    };
    let containers: i64 = spec
        .containers
        .iter()
        .map(|c| container_units(c, resource_name))
        .sum();
    let init_max: i64 = spec
        .init_containers
        .iter()
        .flatten()
        .map(|c| container_units(c, resource_name))
        .max()
        .unwrap_or(0);
    std::cmp::max(containers, init_max)
}

impl Webhooks {
    /// Validating webhook for workload pods.
    pub async fn validate_pod(
        &self,
        request: &AdmissionRequest,
    ) -> Result<AdmissionResponse, AdmissionError> {
        let pod: Pod = request.decode()?;
        validator::validate(self, request, &pod).await
    }

    /// Mutating webhook for workload pods.
    pub async fn mutate_pod(
        &self,
        request: &AdmissionRequest,
    ) -> Result<AdmissionResponse, AdmissionError> {
        let pod: Pod = request.decode()?;
        defaulter::mutate(self, request, &pod).await
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, ResourceRequirements};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    pub fn container_with_limit(resource: &str, amount: i64) -> Container {
        let mut limits = BTreeMap::new();
        limits.insert(resource.to_string(), Quantity(amount.to_string()));
        Container {
            name: "worker".to_string(),
            resources: Some(ResourceRequirements {
                limits: Some(limits),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn container_with_request(resource: &str, amount: i64) -> Container {
        let mut requests = BTreeMap::new();
        requests.insert(resource.to_string(), Quantity(amount.to_string()));
        Container {
            name: "worker".to_string(),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn pod_with(containers: Vec<Container>, init: Vec<Container>) -> Pod {
        Pod {
            spec: Some(PodSpec {
                containers,
                init_containers: if init.is_empty() { None } else { Some(init) },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
