//! Rendering of the MIG manager workloads for MIG pools: the parted
//! config, its hook scripts, the gpu-clients list, and the DaemonSet
//! consuming them.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, EnvVar, PodSpec, PodTemplateSpec, SecurityContext,
    Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use serde::{Deserialize, Serialize};

use crate::api::{GPUPoolSpec, MigLayoutEntry};
use crate::pool::PoolKey;

use super::{
    mig_config_name, mig_gpu_clients_name, mig_manager_name, mig_scripts_name, pool_affinity,
    workload_meta,
};

pub const APP: &str = "nvidia-mig-manager";

/// Config consumed by `nvidia-mig-parted`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MigPartedConfig {
    pub version: String,
    #[serde(rename = "mig-configs")]
    pub mig_configs: BTreeMap<String, Vec<MigConfigEntry>>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct MigConfigEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<String>>,
    #[serde(rename = "pciBusId", default, skip_serializing_if = "Option::is_none")]
    pub pci_bus_id: Option<String>,
    #[serde(rename = "device-filter", default, skip_serializing_if = "Option::is_none")]
    pub device_filter: Option<String>,
    #[serde(rename = "mig-enabled")]
    pub mig_enabled: bool,
    #[serde(rename = "mig-devices")]
    pub mig_devices: BTreeMap<String, i64>,
}

fn config_entry(entry: &MigLayoutEntry) -> MigConfigEntry {
    let mut out = MigConfigEntry {
        devices: None,
        pci_bus_id: None,
        device_filter: None,
        mig_enabled: true,
        mig_devices: entry
            .profiles
            .iter()
            .map(|p| (p.name.clone(), p.count))
            .collect(),
    };
    if let Some(uuid) = &entry.uuid {
        out.devices = Some(vec![uuid.clone()]);
    } else if let Some(pci) = &entry.pci_bus_id {
        out.pci_bus_id = Some(pci.clone());
    } else if let Some(filter) = &entry.device_filter {
        out.device_filter = Some(filter.clone());
    } else {
        out.pci_bus_id = Some("all".to_string());
    }
    out
}

/// Builds the parted config from the pool's MIG layout. One input entry
/// becomes exactly one target with its full profile set.
pub fn parted_config(key: &PoolKey, spec: &GPUPoolSpec) -> MigPartedConfig {
    let entries = spec.resource.mig_layout.iter().map(config_entry).collect();
    let mut mig_configs = BTreeMap::new();
    mig_configs.insert(key.name.clone(), entries);
    MigPartedConfig {
        version: "v1".to_string(),
        mig_configs,
    }
}

pub fn config_map(
    key: &PoolKey,
    spec: &GPUPoolSpec,
    namespace: &str,
    owner: Option<OwnerReference>,
) -> anyhow::Result<ConfigMap> {
    let config = parted_config(key, spec);
    let mut data = BTreeMap::new();
    data.insert("config.yaml".to_string(), serde_yaml::to_string(&config)?);
    Ok(ConfigMap {
        metadata: workload_meta(&mig_config_name(&key.name), namespace, APP, &key.name, owner),
        data: Some(data),
        ..Default::default()
    })
}

/// Hook scripts the MIG manager runs around a reconfiguration: stop and
/// restart the other GPU clients on the node.
pub fn scripts_config_map(
    key: &PoolKey,
    namespace: &str,
    owner: Option<OwnerReference>,
) -> ConfigMap {
    let mut data = BTreeMap::new();
    data.insert(
        "reconfigure.sh".to_string(),
        include_str!("scripts/reconfigure.sh").to_string(),
    );
    ConfigMap {
        metadata: workload_meta(&mig_scripts_name(&key.name), namespace, APP, &key.name, owner),
        data: Some(data),
        ..Default::default()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
struct GpuClients {
    version: String,
    #[serde(rename = "systemd-services")]
    systemd_services: Vec<String>,
}

pub fn gpu_clients_config_map(
    key: &PoolKey,
    namespace: &str,
    owner: Option<OwnerReference>,
) -> anyhow::Result<ConfigMap> {
    let clients = GpuClients {
        version: "v1".to_string(),
        systemd_services: vec!["nvidia-dcgm.service".to_string(), "dcgm-exporter.service".to_string()],
    };
    let mut data = BTreeMap::new();
    data.insert("clients.yaml".to_string(), serde_yaml::to_string(&clients)?);
    Ok(ConfigMap {
        metadata: workload_meta(
            &mig_gpu_clients_name(&key.name),
            namespace,
            APP,
            &key.name,
            owner,
        ),
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
    let name = mig_manager_name(&key.name);
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
                    containers: vec![Container {
                        name: "nvidia-mig-manager".to_string(),
                        image: Some(image.to_string()),
                        env: Some(vec![
                            EnvVar {
                                name: "CONFIG_FILE".to_string(),
                                value: Some("/mig-parted-config/config.yaml".to_string()),
                                ..Default::default()
                            },
                            EnvVar {
                                name: "GPU_CLIENTS_FILE".to_string(),
                                value: Some("/gpu-clients/clients.yaml".to_string()),
                                ..Default::default()
                            },
                            EnvVar {
                                name: "DEFAULT_MIG_PARTED_CONFIG".to_string(),
                                value: Some(key.name.clone()),
                                ..Default::default()
                            },
                        ]),
                        security_context: Some(SecurityContext {
                            privileged: Some(true),
                            ..Default::default()
                        }),
                        volume_mounts: Some(vec![
                            VolumeMount {
                                name: "mig-parted-config".to_string(),
                                mount_path: "/mig-parted-config".to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "scripts".to_string(),
                                mount_path: "/scripts".to_string(),
                                ..Default::default()
                            },
                            VolumeMount {
                                name: "gpu-clients".to_string(),
                                mount_path: "/gpu-clients".to_string(),
                                ..Default::default()
                            },
                        ]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![
                        Volume {
                            name: "mig-parted-config".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: Some(mig_config_name(&key.name)),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "scripts".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: Some(mig_scripts_name(&key.name)),
                                default_mode: Some(0o550),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                        Volume {
                            name: "gpu-clients".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: Some(mig_gpu_clients_name(&key.name)),
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{MigProfileCount, PoolResource, ResourceUnit};

    fn layout_spec(layout: Vec<MigLayoutEntry>) -> GPUPoolSpec {
        GPUPoolSpec {
            resource: PoolResource {
                unit: ResourceUnit::MIG,
                mig_profile: Some("1g.10gb".into()),
                mig_layout: layout,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn every_layout_entry_appears_once_per_target() {
        let spec = layout_spec(vec![
            MigLayoutEntry {
                uuid: Some("GPU-aaaa".into()),
                profiles: vec![MigProfileCount {
                    name: "1g.10gb".into(),
                    count: 7,
                }],
                ..Default::default()
            },
            MigLayoutEntry {
                pci_bus_id: Some("0000:3b:00.0".into()),
                profiles: vec![MigProfileCount {
                    name: "2g.20gb".into(),
                    count: 3,
                }],
                ..Default::default()
            },
            MigLayoutEntry {
                device_filter: Some("0x20B010DE".into()),
                profiles: vec![MigProfileCount {
                    name: "3g.40gb".into(),
                    count: 2,
                }],
                ..Default::default()
            },
            MigLayoutEntry {
                profiles: vec![MigProfileCount {
                    name: "7g.80gb".into(),
                    count: 1,
                }],
                ..Default::default()
            },
        ]);
        let config = parted_config(&PoolKey::cluster("mig-pool"), &spec);
        let entries = &config.mig_configs["mig-pool"];
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].devices.as_deref(), Some(&["GPU-aaaa".to_string()][..]));
        assert_eq!(entries[0].mig_devices["1g.10gb"], 7);
        assert_eq!(entries[1].pci_bus_id.as_deref(), Some("0000:3b:00.0"));
        assert_eq!(entries[2].device_filter.as_deref(), Some("0x20B010DE"));
        // No target at all falls back to every device on the node.
        assert_eq!(entries[3].pci_bus_id.as_deref(), Some("all"));
        assert!(entries.iter().all(|e| e.mig_enabled));
    }

    #[test]
    fn parted_config_round_trips_through_yaml() {
        let spec = layout_spec(vec![MigLayoutEntry {
            profiles: vec![MigProfileCount {
                name: "1g.10gb".into(),
                count: 7,
            }],
            ..Default::default()
        }]);
        let config = parted_config(&PoolKey::cluster("mig-pool"), &spec);
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: MigPartedConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }
}
