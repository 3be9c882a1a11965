//! Validator-driven device promotion.
//!
//! A device stays in `PendingAssignment` until the data-plane validator
//! reports Ready on its node; if the validator goes away the device falls
//! back. Only this handler moves devices into `Assigned`.

use std::collections::HashSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use tracing::debug;

use super::{Context, HandlerResult, PoolHandler};
use crate::api::{DeviceState, VALIDATOR_APP, VALIDATOR_POOL_LABEL};
use crate::client::update_device_status;
use crate::pool::PoolObject;

pub struct DevicePluginValidationHandler;

pub(crate) fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

#[async_trait]
impl PoolHandler for DevicePluginValidationHandler {
    fn name(&self) -> &'static str {
        "dp-validation"
    }

    async fn handle(&self, ctx: &Context, pool: &mut PoolObject) -> anyhow::Result<HandlerResult> {
        let namespace = ctx.settings.current().renderer.namespace;
        if namespace.is_empty() {
            return Ok(HandlerResult::proceed());
        }

        let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
        let selector = format!(
            "app={},{}={}",
            VALIDATOR_APP,
            VALIDATOR_POOL_LABEL,
            pool.name()
        );
        let validators = pods.list(&ListParams::default().labels(&selector)).await?;

        let ready_nodes: HashSet<String> = validators
            .items
            .iter()
            .filter(|pod| pod_is_ready(pod))
            .filter_map(|pod| pod.spec.as_ref().and_then(|s| s.node_name.clone()))
            .collect();
        debug!(ready_nodes = ready_nodes.len(), "validator readiness collected");

        let pool_name = pool.name();
        let entries = pool.status().map(|s| s.devices.clone()).unwrap_or_default();
        for entry in entries {
            let validator_ready = ready_nodes.contains(&entry.node_name);
            let target = match (entry.state, validator_ready) {
                (DeviceState::PendingAssignment, true) => DeviceState::Assigned,
                (DeviceState::Assigned, false) => DeviceState::PendingAssignment,
                _ => continue,
            };
            let pool_name = pool_name.clone();
            let from = entry.state;
            let changed = update_device_status(&ctx.client, &entry.name, move |status| {
                // the world may have moved; only flip devices still ours
                // and still in the state the plan saw
                let still_ours = status
                    .pool_ref
                    .as_ref()
                    .map(|r| r.name == pool_name)
                    .unwrap_or(false);
                if still_ours && status.state == from {
                    status.state = target;
                }
            })
            .await?;
            if changed {
                if let Some(status) =
                    pool.status_mut().devices.iter_mut().find(|d| d.name == entry.name)
                {
                    status.state = target;
                }
            }
        }
        Ok(HandlerResult::proceed())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};

    mod against_fake_api {
        use super::*;
        use crate::admission::test_support::{scripted_kube_service, MockExchange};
        use crate::api::{ClusterGPUPool, ClusterGPUPoolSpec, ModuleSettings, PoolDeviceStatus};
        use crate::moduleconfig::SettingsStore;
        use crate::reconcile::Context;

        fn validator_pod(ready: bool) -> serde_json::Value {
            serde_json::json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": "nvidia-operator-validator-shared-abc",
                    "namespace": "d8-gpu",
                    "labels": { "app": VALIDATOR_APP, "pool": "shared" },
                },
                "spec": { "nodeName": "n1", "containers": [ { "name": "v" } ] },
                "status": {
                    "conditions": [
                        { "type": "Ready", "status": if ready { "True" } else { "False" } },
                    ],
                },
            })
        }

        fn device(state: &str) -> serde_json::Value {
            serde_json::json!({
                "apiVersion": "gpu.deckhouse.io/v1alpha1",
                "kind": "GPUDevice",
                "metadata": { "name": "d1" },
                "spec": {},
                "status": {
                    "inventoryId": "d1",
                    "nodeName": "n1",
                    "poolRef": { "name": "shared" },
                    "state": state,
                },
            })
        }

        fn pool_with_device(state: DeviceState) -> crate::pool::PoolObject {
            let mut pool = crate::pool::PoolObject::Cluster(ClusterGPUPool::new(
                "shared",
                ClusterGPUPoolSpec::default(),
            ));
            pool.status_mut().devices = vec![PoolDeviceStatus {
                name: "d1".to_string(),
                inventory_id: "d1".to_string(),
                node_name: "n1".to_string(),
                state,
            }];
            pool
        }

        fn settings() -> SettingsStore {
            let mut settings = ModuleSettings::default();
            settings.renderer.namespace = "d8-gpu".to_string();
            SettingsStore::new(settings)
        }

        #[tokio::test]
        async fn ready_validator_promotes_pending_device() {
            let (client, api) = scripted_kube_service(vec![
                MockExchange::list("PodList", vec![validator_pod(true)]),
                MockExchange::get(device("PendingAssignment")),
                MockExchange {
                    method: http::Method::PATCH,
                    status: 200,
                    body: device("Assigned"),
                },
            ]);
            let ctx = Context {
                client,
                settings: settings(),
            };
            let mut pool = pool_with_device(DeviceState::PendingAssignment);
            DevicePluginValidationHandler.handle(&ctx, &mut pool).await.unwrap();
            assert_eq!(pool.status().unwrap().devices[0].state, DeviceState::Assigned);
            api.await.unwrap();
        }

        #[tokio::test]
        async fn vanished_validator_demotes_assigned_device() {
            let (client, api) = scripted_kube_service(vec![
                MockExchange::list("PodList", vec![validator_pod(false)]),
                MockExchange::get(device("Assigned")),
                MockExchange {
                    method: http::Method::PATCH,
                    status: 200,
                    body: device("PendingAssignment"),
                },
            ]);
            let ctx = Context {
                client,
                settings: settings(),
            };
            let mut pool = pool_with_device(DeviceState::Assigned);
            DevicePluginValidationHandler.handle(&ctx, &mut pool).await.unwrap();
            assert_eq!(
                pool.status().unwrap().devices[0].state,
                DeviceState::PendingAssignment
            );
            api.await.unwrap();
        }
    }

    #[test]
    fn readiness_requires_true_ready_condition() {
        let mut pod = Pod::default();
        assert!(!pod_is_ready(&pod));
        pod.status = Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "Ready".into(),
                status: "False".into(),
                ..Default::default()
            }]),
            ..Default::default()
        });
        assert!(!pod_is_ready(&pod));
        pod.status.as_mut().unwrap().conditions = Some(vec![PodCondition {
            type_: "Ready".into(),
            status: "True".into(),
            ..Default::default()
        }]);
        assert!(pod_is_ready(&pod));
    }
}
