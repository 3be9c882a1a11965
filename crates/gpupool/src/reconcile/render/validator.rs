//! Rendering of the data-plane validator DaemonSet. The validator's
//! readiness on a node gates device promotion (see the dp-validation
//! handler), so its `NVIDIA_RESOURCE_NAME` must equal the exposed
//! resource name exactly.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};

use crate::api::{VALIDATOR_APP, VALIDATOR_POOL_LABEL};
use crate::pool::PoolKey;

use super::{pool_affinity, validator_name, workload_meta};

pub fn daemon_set(
    key: &PoolKey,
    namespace: &str,
    image: &str,
    tolerations: Vec<Toleration>,
    owner: Option<OwnerReference>,
) -> DaemonSet {
    let name = validator_name(&key.name);
    let labels: BTreeMap<String, String> = [
        ("app".to_string(), VALIDATOR_APP.to_string()),
        (VALIDATOR_POOL_LABEL.to_string(), key.name.clone()),
    ]
    .into_iter()
    .collect();

    DaemonSet {
        metadata: workload_meta(&name, namespace, VALIDATOR_APP, &key.name, owner),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    affinity: Some(pool_affinity(key)),
                    tolerations: Some(tolerations),
                    containers: vec![Container {
                        name: "nvidia-operator-validator".to_string(),
                        image: Some(image.to_string()),
                        env: Some(vec![EnvVar {
                            name: "NVIDIA_RESOURCE_NAME".to_string(),
                            // exact match required for the validator to find
                            // the device plugin
                            value: Some(key.resource_name()),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resource_name_env_matches_exposed_resource() {
        let ds = daemon_set(&PoolKey::cluster("shared"), "d8-gpu", "validator:1", vec![], None);
        let env = ds.spec.unwrap().template.spec.unwrap().containers[0]
            .env
            .clone()
            .unwrap();
        assert_eq!(env[0].name, "NVIDIA_RESOURCE_NAME");
        assert_eq!(env[0].value.as_deref(), Some("cluster.gpu.deckhouse.io/shared"));
    }
}
