//! Renders the per-pool data-plane workloads: device plugin, validator,
//! and (for MIG pools) the MIG manager.
//!
//! Objects are created when absent and replaced in place when their
//! rendered shape drifts. A pool that stops being renderable — wrong
//! backend, zero capacity — has its objects garbage-collected explicitly,
//! because owner references only apply when the target namespace equals
//! the pool namespace.

mod device_plugin;
mod mig_manager;
mod validator;

use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMap, NodeAffinity, NodeSelectorRequirement, NodeSelectorTerm, Toleration,
};
use k8s_openapi::api::core::v1::NodeSelector as KubeNodeSelector;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use super::{Context, HandlerResult, PoolHandler};
use crate::api::{ResourceUnit, BACKEND_DEVICE_PLUGIN, PROVIDER_NVIDIA};
use crate::client::{collect_node_taints, is_not_found};
use crate::pool::{PoolKey, PoolObject};

pub struct RenderHandler;

pub fn device_plugin_name(pool: &str) -> String {
    format!("nvidia-device-plugin-{}", pool)
}

pub fn config_map_name(pool: &str) -> String {
    format!("nvidia-device-plugin-{}-config", pool)
}

pub fn validator_name(pool: &str) -> String {
    format!("nvidia-operator-validator-{}", pool)
}

pub fn mig_manager_name(pool: &str) -> String {
    format!("nvidia-mig-manager-{}", pool)
}

pub fn mig_config_name(pool: &str) -> String {
    format!("nvidia-mig-manager-{}-config", pool)
}

pub fn mig_scripts_name(pool: &str) -> String {
    format!("nvidia-mig-manager-{}-scripts", pool)
}

pub fn mig_gpu_clients_name(pool: &str) -> String {
    format!("nvidia-mig-manager-{}-gpu-clients", pool)
}

fn workload_meta(
    name: &str,
    namespace: &str,
    app: &str,
    pool: &str,
    owner: Option<OwnerReference>,
) -> ObjectMeta {
    let labels: BTreeMap<String, String> = [
        ("app".to_string(), app.to_string()),
        ("pool".to_string(), pool.to_string()),
    ]
    .into_iter()
    .collect();
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        owner_references: owner.map(|o| vec![o]),
        ..Default::default()
    }
}

/// Pins a workload to nodes carrying the pool label.
fn pool_affinity(key: &PoolKey) -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(KubeNodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: key.node_label_key(),
                        operator: "In".to_string(),
                        values: Some(vec![key.name.clone()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Tolerations for a pool workload: the pool's own fence, the configured
/// custom keys, and an `Exists` toleration per distinct taint found on the
/// pool's nodes (deduplicated by key|value|effect).
fn workload_tolerations(
    key: &PoolKey,
    node_taints: &[k8s_openapi::api::core::v1::Taint],
    custom_keys: &[String],
) -> Vec<Toleration> {
    let mut tolerations = vec![Toleration {
        key: Some(key.node_label_key()),
        operator: Some("Equal".to_string()),
        value: Some(key.name.clone()),
        effect: Some("NoSchedule".to_string()),
        ..Default::default()
    }];
    for custom in custom_keys {
        tolerations.push(Toleration {
            key: Some(custom.clone()),
            operator: Some("Exists".to_string()),
            ..Default::default()
        });
    }
    let mut seen = std::collections::HashSet::new();
    for taint in node_taints {
        if taint.key == key.node_label_key() {
            continue;
        }
        let fingerprint = format!(
            "{}|{}|{}",
            taint.key,
            taint.value.as_deref().unwrap_or(""),
            taint.effect
        );
        if !seen.insert(fingerprint) {
            continue;
        }
        tolerations.push(Toleration {
            key: Some(taint.key.clone()),
            operator: Some("Exists".to_string()),
            effect: Some(taint.effect.clone()),
            ..Default::default()
        });
    }
    tolerations
}

/// Projection compared between the live and the rendered object. Anything
/// outside it (server-filled status, timestamps, managed fields) does not
/// trigger an update.
fn render_fingerprint<K: Serialize>(object: &K) -> serde_json::Value {
    let value = serde_json::to_value(object).unwrap_or_default();
    serde_json::json!({
        "labels": value["metadata"]["labels"],
        "annotations": value["metadata"]["annotations"],
        "ownerReferences": value["metadata"]["ownerReferences"],
        "data": value["data"],
        "spec": value["spec"],
    })
}

/// Create-or-replace with a drift check, so a settled world produces no
/// writes.
async fn apply<K>(api: &Api<K>, desired: K) -> anyhow::Result<()>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned + Serialize,
{
    let name = desired.name();
    match api.get(&name).await {
        Err(ref e) if is_not_found(e) => {
            info!(object = %name, "creating rendered object");
            api.create(&PostParams::default(), &desired).await?;
        }
        Err(e) => return Err(e.into()),
        Ok(current) => {
            if render_fingerprint(&current) != render_fingerprint(&desired) {
                info!(object = %name, "rendered object drifted, replacing");
                let mut replacement = desired;
                replacement.meta_mut().resource_version = current.resource_version();
                api.replace(&name, &PostParams::default(), &replacement)
                    .await?;
            }
        }
    }
    Ok(())
}

async fn delete_ignore_missing<K>(api: &Api<K>, name: &str) -> anyhow::Result<()>
where
    K: Resource<DynamicType = ()> + Clone + Debug + DeserializeOwned,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(()),
        Err(ref e) if is_not_found(e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn cleanup_mig(client: &Client, namespace: &str, pool: &str) -> anyhow::Result<()> {
    let daemon_sets: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    delete_ignore_missing(&daemon_sets, &mig_manager_name(pool)).await?;
    delete_ignore_missing(&config_maps, &mig_config_name(pool)).await?;
    delete_ignore_missing(&config_maps, &mig_scripts_name(pool)).await?;
    delete_ignore_missing(&config_maps, &mig_gpu_clients_name(pool)).await?;
    Ok(())
}

/// Removes every object rendered for the pool. Idempotent; NotFound is
/// fine.
pub async fn cleanup(client: &Client, namespace: &str, pool: &str) -> anyhow::Result<()> {
    let daemon_sets: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
    let config_maps: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    delete_ignore_missing(&daemon_sets, &device_plugin_name(pool)).await?;
    delete_ignore_missing(&daemon_sets, &validator_name(pool)).await?;
    delete_ignore_missing(&config_maps, &config_map_name(pool)).await?;
    cleanup_mig(client, namespace, pool).await
}

#[async_trait]
impl PoolHandler for RenderHandler {
    fn name(&self) -> &'static str {
        "renderer"
    }

    async fn handle(&self, ctx: &Context, pool: &mut PoolObject) -> anyhow::Result<HandlerResult> {
        let settings = ctx.settings.current();
        let renderer = settings.renderer;
        if renderer.namespace.is_empty() || renderer.device_plugin_image.is_empty() {
            anyhow::bail!(
                "renderer is not configured: namespace and devicePluginImage are required"
            );
        }

        let key = pool.key();
        let spec = pool.spec().clone();

        if let Some(provider) = spec.provider.as_deref() {
            if !provider.is_empty() && provider != PROVIDER_NVIDIA {
                return Ok(HandlerResult::proceed());
            }
        }

        let backend_renderable = spec
            .backend
            .as_deref()
            .map_or(true, |b| b.is_empty() || b == BACKEND_DEVICE_PLUGIN);
        let total = pool.status().map(|s| s.capacity.total).unwrap_or(0);
        if !backend_renderable || total == 0 {
            debug!(backend_renderable, total, "pool not renderable, cleaning up");
            cleanup(&ctx.client, &renderer.namespace, &key.name).await?;
            return Ok(HandlerResult::proceed());
        }

        let node_names: Vec<String> = pool
            .status()
            .map(|s| s.nodes.iter().map(|n| n.name.clone()).collect())
            .unwrap_or_default();
        let node_taints = collect_node_taints(&ctx.client, &node_names).await?;
        let tolerations = workload_tolerations(
            &key,
            &node_taints,
            &settings.placement.custom_toleration_keys,
        );
        let owner = if pool.owns_in_namespace(&renderer.namespace) {
            pool.controller_owner_reference()
        } else {
            None
        };

        let config_maps: Api<ConfigMap> = Api::namespaced(ctx.client.clone(), &renderer.namespace);
        let daemon_sets: Api<DaemonSet> = Api::namespaced(ctx.client.clone(), &renderer.namespace);

        apply(
            &config_maps,
            device_plugin::config_map(
                &key,
                &spec,
                &renderer.namespace,
                &renderer.mig_strategy,
                owner.clone(),
            )?,
        )
        .await?;
        apply(
            &daemon_sets,
            device_plugin::daemon_set(
                &key,
                &renderer.namespace,
                &renderer.device_plugin_image,
                tolerations.clone(),
                owner.clone(),
            ),
        )
        .await?;
        apply(
            &daemon_sets,
            validator::daemon_set(
                &key,
                &renderer.namespace,
                &renderer.validator_image,
                tolerations.clone(),
                owner.clone(),
            ),
        )
        .await?;

        if spec.resource.unit == ResourceUnit::MIG && !renderer.mig_manager_image.is_empty() {
            apply(
                &config_maps,
                mig_manager::config_map(&key, &spec, &renderer.namespace, owner.clone())?,
            )
            .await?;
            apply(
                &config_maps,
                mig_manager::scripts_config_map(&key, &renderer.namespace, owner.clone()),
            )
            .await?;
            apply(
                &config_maps,
                mig_manager::gpu_clients_config_map(&key, &renderer.namespace, owner.clone())?,
            )
            .await?;
            apply(
                &daemon_sets,
                mig_manager::daemon_set(
                    &key,
                    &renderer.namespace,
                    &renderer.mig_manager_image,
                    tolerations,
                    owner,
                ),
            )
            .await?;
        } else {
            cleanup_mig(&ctx.client, &renderer.namespace, &key.name).await?;
        }

        Ok(HandlerResult::proceed())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::Taint;

    #[test]
    fn tolerations_start_with_pool_fence_and_dedup_node_taints() {
        let key = PoolKey::cluster("shared");
        let taints = vec![
            Taint {
                key: "dedicated".into(),
                value: Some("gpu".into()),
                effect: "NoSchedule".into(),
                time_added: None,
            },
            Taint {
                key: "dedicated".into(),
                value: Some("gpu".into()),
                effect: "NoSchedule".into(),
                time_added: None,
            },
            // the pool's own taint never re-appears as Exists
            Taint {
                key: "cluster.gpu.deckhouse.io/shared".into(),
                value: Some("shared".into()),
                effect: "NoSchedule".into(),
                time_added: None,
            },
        ];
        let tolerations = workload_tolerations(&key, &taints, &["node.kubernetes.io/gpu".into()]);
        assert_eq!(tolerations.len(), 3);
        assert_eq!(
            tolerations[0].key.as_deref(),
            Some("cluster.gpu.deckhouse.io/shared")
        );
        assert_eq!(tolerations[0].operator.as_deref(), Some("Equal"));
        assert_eq!(tolerations[1].operator.as_deref(), Some("Exists"));
        assert_eq!(tolerations[2].key.as_deref(), Some("dedicated"));
    }

    #[test]
    fn fingerprint_ignores_server_side_fields() {
        let key = PoolKey::cluster("shared");
        let mut live = device_plugin::daemon_set(&key, "d8-gpu", "img:1", vec![], None);
        live.metadata.resource_version = Some("12345".into());
        live.metadata.uid = Some("abc".into());
        let rendered = device_plugin::daemon_set(&key, "d8-gpu", "img:1", vec![], None);
        assert_eq!(render_fingerprint(&live), render_fingerprint(&rendered));

        let drifted = device_plugin::daemon_set(&key, "d8-gpu", "img:2", vec![], None);
        assert_ne!(render_fingerprint(&live), render_fingerprint(&drifted));
    }

    mod against_fake_api {
        use super::*;
        use crate::admission::test_support::{scripted_kube_service, MockExchange};
        use crate::api::{ClusterGPUPool, ClusterGPUPoolSpec, ModuleSettings, PoolNodeStatus};
        use crate::moduleconfig::SettingsStore;

        fn created(kind: &str, name: &str) -> serde_json::Value {
            serde_json::json!({
                "apiVersion": if kind == "ConfigMap" { "v1" } else { "apps/v1" },
                "kind": kind,
                "metadata": { "name": name, "namespace": "d8-gpu" },
            })
        }

        fn settings() -> SettingsStore {
            let mut settings = ModuleSettings::default();
            settings.renderer.namespace = "d8-gpu".to_string();
            settings.renderer.device_plugin_image = "dp:1".to_string();
            settings.renderer.validator_image = "val:1".to_string();
            SettingsStore::new(settings)
        }

        /// A fresh Card pool with capacity renders its three workloads and
        /// garbage-collects the (absent) MIG objects.
        #[tokio::test]
        async fn card_pool_workloads_are_created_end_to_end() {
            let bare_node = serde_json::json!({
                "apiVersion": "v1",
                "kind": "Node",
                "metadata": { "name": "n1" },
            });
            let (client, api) = scripted_kube_service(vec![
                // taints of the pool's nodes
                MockExchange::get(bare_node),
                // device plugin config map and daemon set
                MockExchange::get_not_found(),
                MockExchange::post(created("ConfigMap", "nvidia-device-plugin-shared-config")),
                MockExchange::get_not_found(),
                MockExchange::post(created("DaemonSet", "nvidia-device-plugin-shared")),
                // validator daemon set
                MockExchange::get_not_found(),
                MockExchange::post(created("DaemonSet", "nvidia-operator-validator-shared")),
                // MIG cleanup for a Card pool
                MockExchange::delete_not_found(),
                MockExchange::delete_not_found(),
                MockExchange::delete_not_found(),
                MockExchange::delete_not_found(),
            ]);
            let ctx = Context {
                client,
                settings: settings(),
            };
            let mut pool = PoolObject::Cluster(ClusterGPUPool::new(
                "shared",
                ClusterGPUPoolSpec::default(),
            ));
            pool.status_mut().capacity.total = 1;
            pool.status_mut().nodes = vec![PoolNodeStatus {
                name: "n1".to_string(),
                total_devices: 1,
                assigned_devices: 0,
            }];
            let result = RenderHandler.handle(&ctx, &mut pool).await.unwrap();
            assert_eq!(result, HandlerResult::proceed());
            api.await.unwrap();
        }

        /// Zero capacity tears everything down instead of rendering.
        #[tokio::test]
        async fn zero_capacity_cleans_up_end_to_end() {
            let (client, api) = scripted_kube_service(vec![
                MockExchange::delete_not_found(),
                MockExchange::delete_not_found(),
                MockExchange::delete_not_found(),
                MockExchange::delete_not_found(),
                MockExchange::delete_not_found(),
                MockExchange::delete_not_found(),
                MockExchange::delete_not_found(),
            ]);
            let ctx = Context {
                client,
                settings: settings(),
            };
            let mut pool = PoolObject::Cluster(ClusterGPUPool::new(
                "shared",
                ClusterGPUPoolSpec::default(),
            ));
            let result = RenderHandler.handle(&ctx, &mut pool).await.unwrap();
            assert_eq!(result, HandlerResult::proceed());
            api.await.unwrap();
        }
    }
}
