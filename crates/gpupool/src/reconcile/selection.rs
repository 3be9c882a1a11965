//! Selection sync: decides which devices belong to the pool, computes
//! capacity and node tallies, and settles the device side of the
//! pool↔device relation.
//!
//! The decision is a pure function over the pool, the node inventories,
//! and the device list; the handler then applies the planned device
//! mutations with conflict-retried status patches and fills the in-memory
//! pool status.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use kube::ResourceExt;
use tracing::debug;

use super::{Context, HandlerResult, PoolHandler};
use crate::api::{
    DeviceState, GPUDevice, GPUNodeInventory, PoolCapacity, PoolDeviceStatus, PoolNodeStatus,
};
use crate::client::update_device_status;
use crate::pool::PoolObject;
use crate::selector::SelectorError;
use crate::{capacity, matcher, selector};

pub struct SelectionSyncHandler;

/// Device mutations the plan wants applied.
#[derive(Debug, PartialEq)]
pub(crate) struct SelectionPlan {
    pub devices: Vec<PoolDeviceStatus>,
    pub capacity: PoolCapacity,
    pub nodes: Vec<PoolNodeStatus>,
    /// Devices to point at this pool (poolRef, and Ready/Assigned →
    /// PendingAssignment).
    pub assign: Vec<String>,
    /// Devices whose poolRef still names this pool although their
    /// annotation moved on: clear the ref, reset releasable states.
    pub release: Vec<String>,
}

#[derive(Default)]
struct NodeTally {
    total_devices: i64,
    assigned_devices: i64,
}

/// Whether the device holds a place in the pool's capacity. The policy
/// here counts `PendingAssignment`: a device the validator has not yet
/// promoted already occupies its slot and must not be double-promised.
/// The same predicate feeds both `total` and the node tallies.
fn capacity_eligible(state: DeviceState) -> bool {
    matches!(
        state,
        DeviceState::PendingAssignment
            | DeviceState::Assigned
            | DeviceState::Reserved
            | DeviceState::InUse
    )
}

pub(crate) fn plan(
    pool: &PoolObject,
    inventories: &[GPUNodeInventory],
    devices: &[GPUDevice],
    node_labels: Option<&HashMap<String, BTreeMap<String, String>>>,
) -> Result<SelectionPlan, SelectorError> {
    let pool_name = pool.name();
    let annotation = pool.scope().assignment_annotation();
    let spec = pool.spec();

    let compiled = spec.node_selector.as_ref().map(selector::compile).transpose()?;

    // The assignment annotation is authoritative; key devices by inventory
    // ID with the object name as fallback for agents that have not filled
    // the status in yet.
    let mut assigned: HashMap<&str, &GPUDevice> = HashMap::new();
    for device in devices {
        if device.assignment(annotation) == Some(pool_name.as_str()) {
            assigned.insert(device.inventory_key(), device);
        }
    }

    let mut pool_devices = Vec::new();
    let mut assign: Vec<String> = Vec::new();
    let mut tallies: BTreeMap<String, NodeTally> = BTreeMap::new();
    let mut total = 0i64;
    let mut used = 0i64;
    let mut base_units = 0i64;

    for inventory in inventories {
        let node_name = inventory.node_name();
        if let Some(compiled) = &compiled {
            let matched = match node_labels.and_then(|m| m.get(node_name)) {
                Some(labels) => compiled.matches(labels),
                None => compiled.matches(&inventory.labels_snapshot()),
            };
            if !matched {
                continue;
            }
        }

        let mut counted_on_node = 0i64;
        for candidate in matcher::filter(inventory.devices(), spec.device_selector.as_ref()) {
            let device = match assigned.get(candidate.inventory_id.as_str()) {
                Some(device) => *device,
                None => continue,
            };
            if device.is_ignored() {
                continue;
            }

            let state = device.state();
            let stale_ref = match device.status.as_ref().and_then(|s| s.pool_ref.as_ref()) {
                Some(pool_ref) => !pool.matches_pool_ref(pool_ref),
                None => true,
            };
            let needs_assignment =
                stale_ref || matches!(state, DeviceState::Ready | DeviceState::PendingAssignment);
            if needs_assignment {
                // queued even when only the ref is stale; the status patch
                // is a no-op if nothing actually changes
                assign.push(device.name());
            }

            // The status view and the capacity both use the state the
            // queued update will leave behind, so a freshly annotated
            // device shows up consistently within one chain run.
            let effective_state = if needs_assignment {
                match state {
                    DeviceState::Ready | DeviceState::Assigned => DeviceState::PendingAssignment,
                    other => other,
                }
            } else {
                state
            };
            pool_devices.push(PoolDeviceStatus {
                name: device.name(),
                inventory_id: candidate.inventory_id.clone(),
                node_name: node_name.to_string(),
                state: effective_state,
            });

            let under_cap = spec
                .resource
                .max_devices_per_node
                .map_or(true, |cap| counted_on_node < cap);
            if capacity_eligible(effective_state) && under_cap {
                let (units, base) = capacity::device_units(&candidate, &spec.resource);
                total += units;
                base_units += base;
                let tally = tallies.entry(node_name.to_string()).or_default();
                tally.total_devices += 1;
                if effective_state.is_consuming() {
                    used += units;
                    tally.assigned_devices += 1;
                }
                counted_on_node += 1;
            }
        }
    }

    // Devices annotated elsewhere (or nowhere) whose status still points at
    // this pool get unlinked; only releasable states fall back to Ready.
    let mut release = Vec::new();
    for device in devices {
        if device.assignment(annotation) == Some(pool_name.as_str()) {
            continue;
        }
        if let Some(pool_ref) = device.status.as_ref().and_then(|s| s.pool_ref.as_ref()) {
            if pool.matches_pool_ref(pool_ref) {
                release.push(device.name());
            }
        }
    }

    pool_devices.sort_by(|a, b| (&a.node_name, &a.name).cmp(&(&b.node_name, &b.name)));
    let nodes = tallies
        .into_iter()
        .map(|(name, tally)| PoolNodeStatus {
            name,
            total_devices: tally.total_devices,
            assigned_devices: tally.assigned_devices,
        })
        .collect();

    Ok(SelectionPlan {
        devices: pool_devices,
        capacity: capacity::finalize(total, used, base_units, &spec.resource),
        nodes,
        assign,
        release,
    })
}

#[async_trait]
impl PoolHandler for SelectionSyncHandler {
    fn name(&self) -> &'static str {
        "selection-sync"
    }

    async fn handle(&self, ctx: &Context, pool: &mut PoolObject) -> anyhow::Result<HandlerResult> {
        let inventories: Api<GPUNodeInventory> = Api::all(ctx.client.clone());
        let inventories = inventories.list(&ListParams::default()).await?.items;
        let devices: Api<GPUDevice> = Api::all(ctx.client.clone());
        let devices = devices.list(&ListParams::default()).await?.items;

        // Node labels are only loaded when a selector needs them.
        let node_labels = if pool.spec().node_selector.is_some() {
            let nodes: Api<Node> = Api::all(ctx.client.clone());
            let nodes = nodes.list(&ListParams::default()).await?.items;
            Some(
                nodes
                    .into_iter()
                    .map(|node| {
                        let labels = node.metadata.labels.clone().unwrap_or_default();
                        (node.name(), labels)
                    })
                    .collect::<HashMap<_, _>>(),
            )
        } else {
            None
        };

        let plan = plan(pool, &inventories, &devices, node_labels.as_ref())?;
        debug!(
            devices = plan.devices.len(),
            assign = plan.assign.len(),
            release = plan.release.len(),
            total = plan.capacity.total,
            "selection sync planned"
        );

        let scope = pool.scope();
        let pool_name = pool.name();
        let pool_namespace = pool.namespace();
        for name in &plan.release {
            update_device_status(&ctx.client, name, |status| {
                let matches = match &status.pool_ref {
                    Some(r) => {
                        r.name == pool_name
                            && match scope {
                                crate::pool::PoolScope::Cluster => {
                                    r.namespace.as_deref().unwrap_or("").is_empty()
                                }
                                crate::pool::PoolScope::Namespaced => {
                                    let ns = r.namespace.as_deref().unwrap_or("");
                                    ns.is_empty() || Some(ns.to_string()) == pool_namespace
                                }
                            }
                    }
                    None => false,
                };
                if matches {
                    status.pool_ref = None;
                    if status.state.is_releasable() {
                        status.state = DeviceState::Ready;
                    }
                }
            })
            .await?;
        }

        let pool_ref = pool.pool_ref();
        for name in &plan.assign {
            let pool_ref = pool_ref.clone();
            update_device_status(&ctx.client, name, move |status| {
                status.pool_ref = Some(pool_ref.clone());
                // only the validator promotes to Assigned
                if matches!(status.state, DeviceState::Ready | DeviceState::Assigned) {
                    status.state = DeviceState::PendingAssignment;
                }
            })
            .await?;
        }

        let status = pool.status_mut();
        status.devices = plan.devices;
        status.capacity = plan.capacity;
        status.nodes = plan.nodes;
        Ok(HandlerResult::proceed())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::api::{
        ClusterGPUPool, ClusterGPUPoolSpec, GPUDeviceSpec, GPUDeviceStatus, GPUNodeInventorySpec,
        GPUNodeInventoryStatus, GPUPool, GPUPoolSpec, InventoryDevice, PoolRef, PoolResource,
        ResourceUnit, CLUSTER_ASSIGNMENT_ANNOTATION,
    };

    fn inventory(node: &str, ids: &[&str]) -> GPUNodeInventory {
        let mut inv = GPUNodeInventory::new(node, GPUNodeInventorySpec::default());
        inv.status = Some(GPUNodeInventoryStatus {
            node_name: node.to_string(),
            labels: Default::default(),
            devices: ids
                .iter()
                .map(|id| InventoryDevice {
                    inventory_id: id.to_string(),
                    ..Default::default()
                })
                .collect(),
        });
        inv
    }

    fn device(name: &str, node: &str, state: DeviceState, annotation: Option<&str>) -> GPUDevice {
        let mut dev = GPUDevice::new(name, GPUDeviceSpec::default());
        if let Some(pool) = annotation {
            dev.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(CLUSTER_ASSIGNMENT_ANNOTATION.into(), pool.into());
        }
        dev.status = Some(GPUDeviceStatus {
            inventory_id: name.to_string(),
            node_name: node.to_string(),
            pool_ref: None,
            state,
        });
        dev
    }

    fn cluster_pool(name: &str, spec: GPUPoolSpec) -> PoolObject {
        PoolObject::Cluster(ClusterGPUPool::new(name, ClusterGPUPoolSpec { pool: spec }))
    }

    #[test]
    fn annotated_device_is_planned_for_assignment() {
        let pool = cluster_pool("shared", GPUPoolSpec::default());
        let invs = vec![inventory("n1", &["d1", "d2"])];
        let devs = vec![
            device("d1", "n1", DeviceState::Ready, Some("shared")),
            device("d2", "n1", DeviceState::Ready, None),
        ];
        let plan = plan(&pool, &invs, &devs, None).unwrap();
        assert_eq!(plan.assign, vec!["d1".to_string()]);
        assert!(plan.release.is_empty());
        assert_eq!(plan.devices.len(), 1);
        assert_eq!(plan.devices[0].state, DeviceState::PendingAssignment);
        // A freshly annotated device already holds its capacity slot.
        assert_eq!(plan.capacity.total, 1);
        assert_eq!(plan.capacity.used, 0);
    }

    #[test]
    fn capacity_counts_eligible_states_and_used() {
        let pool = cluster_pool("shared", GPUPoolSpec::default());
        let invs = vec![inventory("n1", &["d1", "d2", "d3"])];
        let mut d1 = device("d1", "n1", DeviceState::Assigned, Some("shared"));
        d1.status.as_mut().unwrap().pool_ref = Some(PoolRef {
            name: "shared".into(),
            namespace: None,
        });
        let mut d2 = device("d2", "n1", DeviceState::InUse, Some("shared"));
        d2.status.as_mut().unwrap().pool_ref = Some(PoolRef {
            name: "shared".into(),
            namespace: None,
        });
        let d3 = device("d3", "n1", DeviceState::Faulted, Some("shared"));
        let plan = plan(&pool, &invs, &[d1, d2, d3], None).unwrap();
        assert_eq!(plan.capacity.total, 2);
        assert_eq!(plan.capacity.used, 1);
        assert_eq!(plan.capacity.available, 1);
        // Faulted stays listed but adds nothing.
        assert_eq!(plan.devices.len(), 3);
        assert_eq!(plan.nodes.len(), 1);
        assert_eq!(plan.nodes[0].total_devices, 2);
        assert_eq!(plan.nodes[0].assigned_devices, 1);
        assert!(plan.assign.is_empty());
    }

    #[test]
    fn max_devices_per_node_caps_counted_units() {
        let spec = GPUPoolSpec {
            resource: PoolResource {
                unit: ResourceUnit::Card,
                max_devices_per_node: Some(1),
                ..Default::default()
            },
            ..Default::default()
        };
        let pool = cluster_pool("shared", spec);
        let invs = vec![inventory("n1", &["d1", "d2"])];
        let mut devs = Vec::new();
        for id in ["d1", "d2"] {
            let mut dev = device(id, "n1", DeviceState::Assigned, Some("shared"));
            dev.status.as_mut().unwrap().pool_ref = Some(PoolRef {
                name: "shared".into(),
                namespace: None,
            });
            devs.push(dev);
        }
        let plan = plan(&pool, &invs, &devs, None).unwrap();
        // Both devices are listed, only one is counted.
        assert_eq!(plan.devices.len(), 2);
        assert_eq!(plan.capacity.total, 1);
    }

    #[test]
    fn drifted_device_is_released() {
        let pool = cluster_pool("shared", GPUPoolSpec::default());
        let invs = vec![inventory("n1", &["d1"])];
        let mut dev = device("d1", "n1", DeviceState::Assigned, None);
        dev.status.as_mut().unwrap().pool_ref = Some(PoolRef {
            name: "shared".into(),
            namespace: None,
        });
        let plan = plan(&pool, &invs, &[dev], None).unwrap();
        assert_eq!(plan.release, vec!["d1".to_string()]);
        assert!(plan.devices.is_empty());
    }

    #[test]
    fn namespaced_pool_releases_legacy_refs_too() {
        let mut raw = GPUPool::new("team-a", GPUPoolSpec::default());
        raw.metadata.namespace = Some("ml".into());
        let pool = PoolObject::Namespaced(raw);
        let mut dev = device("d1", "n1", DeviceState::PendingAssignment, None);
        dev.status.as_mut().unwrap().pool_ref = Some(PoolRef {
            name: "team-a".into(),
            namespace: None,
        });
        let plan = plan(&pool, &[inventory("n1", &["d1"])], &[dev], None).unwrap();
        assert_eq!(plan.release, vec!["d1".to_string()]);
    }

    #[test]
    fn node_selector_filters_inventories() {
        let spec = GPUPoolSpec {
            node_selector: Some(crate::api::NodeSelector {
                match_labels: [("gpu-node".to_string(), "true".to_string())]
                    .into_iter()
                    .collect(),
                match_expressions: vec![],
            }),
            ..Default::default()
        };
        let pool = cluster_pool("shared", spec);
        let mut inv = inventory("n1", &["d1"]);
        inv.status.as_mut().unwrap().labels =
            [("gpu-node".to_string(), "false".to_string())].into_iter().collect();
        let devs = vec![device("d1", "n1", DeviceState::Ready, Some("shared"))];
        let plan_result = plan(&pool, &[inv], &devs, None).unwrap();
        assert!(plan_result.devices.is_empty());

        // Node labels, when loaded, win over the inventory snapshot.
        let mut labels = HashMap::new();
        labels.insert(
            "n1".to_string(),
            [("gpu-node".to_string(), "true".to_string())]
                .into_iter()
                .collect::<BTreeMap<_, _>>(),
        );
        let mut inv = inventory("n1", &["d1"]);
        inv.status.as_mut().unwrap().labels =
            [("gpu-node".to_string(), "false".to_string())].into_iter().collect();
        let devs = vec![device("d1", "n1", DeviceState::Ready, Some("shared"))];
        let plan_result = plan(&pool, &[inv], &devs, Some(&labels)).unwrap();
        assert_eq!(plan_result.devices.len(), 1);
    }

    #[test]
    fn plan_is_stable_when_world_is_settled() {
        let pool = cluster_pool("shared", GPUPoolSpec::default());
        let invs = vec![inventory("n1", &["d1"])];
        let mut dev = device("d1", "n1", DeviceState::Assigned, Some("shared"));
        dev.status.as_mut().unwrap().pool_ref = Some(PoolRef {
            name: "shared".into(),
            namespace: None,
        });
        let first = plan(&pool, &invs, &[dev.clone()], None).unwrap();
        assert!(first.assign.is_empty());
        assert!(first.release.is_empty());
        let second = plan(&pool, &invs, &[dev], None).unwrap();
        assert_eq!(first, second);
    }

    mod against_fake_api {
        use super::*;
        use crate::admission::test_support::{scripted_kube_service, MockExchange};
        use crate::moduleconfig::SettingsStore;

        fn inventory_item() -> serde_json::Value {
            serde_json::json!({
                "apiVersion": "gpu.deckhouse.io/v1alpha1",
                "kind": "GPUNodeInventory",
                "metadata": { "name": "n1" },
                "spec": {},
                "status": {
                    "nodeName": "n1",
                    "devices": [ { "inventoryId": "d1" } ],
                },
            })
        }

        fn device_item(state: &str) -> serde_json::Value {
            serde_json::json!({
                "apiVersion": "gpu.deckhouse.io/v1alpha1",
                "kind": "GPUDevice",
                "metadata": {
                    "name": "d1",
                    "annotations": { "cluster.gpu.deckhouse.io/assignment": "shared" },
                },
                "spec": {},
                "status": { "inventoryId": "d1", "nodeName": "n1", "state": state },
            })
        }

        /// The annotate → selection-sync round trip: the device ends up with
        /// a poolRef and `PendingAssignment`, the pool status carries it.
        #[tokio::test]
        async fn annotated_device_is_adopted_end_to_end() {
            let (client, api) = scripted_kube_service(vec![
                MockExchange::list("GPUNodeInventoryList", vec![inventory_item()]),
                MockExchange::list("GPUDeviceList", vec![device_item("Ready")]),
                // assignment patch round for d1
                MockExchange::get(device_item("Ready")),
                MockExchange {
                    method: http::Method::PATCH,
                    status: 200,
                    body: device_item("PendingAssignment"),
                },
            ]);
            let ctx = Context {
                client,
                settings: SettingsStore::default(),
            };
            let mut pool = cluster_pool("shared", GPUPoolSpec::default());
            let result = SelectionSyncHandler.handle(&ctx, &mut pool).await.unwrap();
            assert_eq!(result, HandlerResult::proceed());

            let status = pool.status().unwrap();
            assert_eq!(status.devices.len(), 1);
            assert_eq!(status.devices[0].state, DeviceState::PendingAssignment);
            assert_eq!(status.capacity.total, 1);
            assert_eq!(status.nodes.len(), 1);
            assert_eq!(status.nodes[0].name, "n1");
            api.await.unwrap();
        }
    }
}
