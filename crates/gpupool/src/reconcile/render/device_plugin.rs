//! Rendering of the NVIDIA device-plugin ConfigMap and DaemonSet for one
//! pool.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, HostPathVolumeSource, PodSpec, PodTemplateSpec,
    SecurityContext, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use serde::{Deserialize, Serialize};

use crate::api::{GPUPoolSpec, CLUSTER_GROUP, GROUP};
use crate::pool::PoolKey;

use super::{config_map_name, device_plugin_name, pool_affinity, workload_meta};

pub const APP: &str = "nvidia-device-plugin";

const CONFIG_MOUNT_PATH: &str = "/etc/nvidia-device-plugin";
const CONFIG_KEY: &str = "config.yaml";

/// `config.yaml` schema of the upstream device plugin, reduced to the
/// fields this module drives.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PluginConfig {
    pub version: String,
    pub flags: PluginFlags,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharing: Option<Sharing>,
    pub resources: PluginResources,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PluginFlags {
    pub mig_strategy: String,
    pub resource_prefix: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PluginResources {
    pub gpus: Vec<GpuResourceRule>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct GpuResourceRule {
    pub pattern: String,
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Sharing {
    pub time_slicing: TimeSlicing,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct TimeSlicing {
    pub resources: Vec<ReplicatedResource>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct ReplicatedResource {
    pub name: String,
    pub replicas: i64,
}

/// Builds the plugin configuration for a pool.
///
/// The advertised resource is the pool's short name under the scope
/// prefix; the validator finds the plugin by that exact string. Time
/// slicing is emitted only when something actually replicates: explicit
/// entries with a positive slice count, or the pool's own
/// `slicesPerUnit` when no entries are given. An entry name carrying a
/// prefix rewrites the config's resource prefix.
pub fn plugin_config(key: &PoolKey, spec: &GPUPoolSpec, mig_strategy: &str) -> PluginConfig {
    let mut resource_prefix = key.scope.prefix().to_string();
    let mut replicated: Vec<ReplicatedResource> = Vec::new();

    for entry in &spec.resource.time_slicing_resources {
        if entry.slices_per_unit < 1 {
            continue;
        }
        let mut name = entry.name.clone();
        if name.is_empty() {
            name = key.name.clone();
        }
        for prefix in [CLUSTER_GROUP, GROUP] {
            if let Some(short) = name.strip_prefix(&format!("{}/", prefix)) {
                resource_prefix = prefix.to_string();
                name = short.to_string();
                break;
            }
        }
        replicated.push(ReplicatedResource {
            name,
            replicas: entry.slices_per_unit,
        });
    }
    if replicated.is_empty() && spec.resource.slices_per_unit > 1 {
        replicated.push(ReplicatedResource {
            name: key.name.clone(),
            replicas: spec.resource.slices_per_unit,
        });
    }

    let sharing = if replicated.iter().any(|r| r.replicas > 1) {
        Some(Sharing {
            time_slicing: TimeSlicing {
                resources: replicated,
            },
        })
    } else {
        None
    };

    PluginConfig {
        version: "v1".to_string(),
        flags: PluginFlags {
            mig_strategy: if mig_strategy.is_empty() {
                "none".to_string()
            } else {
                mig_strategy.to_string()
            },
            resource_prefix,
        },
        sharing,
        resources: PluginResources {
            gpus: vec![GpuResourceRule {
                pattern: "*".to_string(),
                name: key.name.clone(),
            }],
        },
    }
}

pub fn config_map(
    key: &PoolKey,
    spec: &GPUPoolSpec,
    namespace: &str,
    mig_strategy: &str,
    owner: Option<OwnerReference>,
) -> anyhow::Result<ConfigMap> {
    let config = plugin_config(key, spec, mig_strategy);
    let mut data = BTreeMap::new();
    data.insert(CONFIG_KEY.to_string(), serde_yaml::to_string(&config)?);
    Ok(ConfigMap {
        metadata: workload_meta(&config_map_name(&key.name), namespace, APP, &key.name, owner),
        data: Some(data),
        ..Default::default()
    })
}

pub fn daemon_set(
    key: &PoolKey,
    namespace: &str,
    image: &str,
    tolerations: Vec<Toleration>,
    owner: Option<OwnerReference>,
) -> DaemonSet {
    let name = device_plugin_name(&key.name);
    let labels: BTreeMap<String, String> = [
        ("app".to_string(), APP.to_string()),
        ("pool".to_string(), key.name.clone()),
    ]
    .into_iter()
    .collect();

    DaemonSet {
        metadata: workload_meta(&name, namespace, APP, &key.name, owner),
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
                    priority_class_name: Some("system-node-critical".to_string()),
                    containers: vec![Container {
                        name: "nvidia-device-plugin-ctr".to_string(),
                        image: Some(image.to_string()),
                        args: Some(vec![
                            "--config-file".to_string(),
                            format!("{}/{}", CONFIG_MOUNT_PATH, CONFIG_KEY),
                        ]),
                        security_context: Some(SecurityContext {
                            privileged: Some(true),
                            ..Default::default()
                        }),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: "device-plugin-config".to_string(),
                                mount_path: CONFIG_MOUNT_PATH.to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "dev".to_string(),
                                mount_path: "/dev".to_string(),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        Volume {
                            name: "device-plugin-config".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: Some(config_map_name(&key.name)),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "dev".to_string(),
                            host_path: Some(HostPathVolumeSource {
                                path: "/dev".to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
