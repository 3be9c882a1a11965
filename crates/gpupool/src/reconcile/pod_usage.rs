//! Pod-driven device usage tracking.
//!
//! Workload pods carrying the pool label (stamped by the pod defaulter)
//! reserve devices on the node they were scheduled to: one device per
//! requested unit, picked deterministically by sorted inventory ID.
//! Ready pods promote their reservations to `InUse`; departed pods hand
//! the devices back to `Assigned`.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use tracing::debug;

use super::dp_validation::pod_is_ready;
use super::{Context, HandlerResult, PoolHandler};
use crate::admission::pod::requested_units;
use crate::api::{DeviceState, PoolDeviceStatus, POOL_NAME_LABEL};
use crate::client::update_device_status;
use crate::pool::PoolObject;

pub struct PodUsageHandler;

#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct NodeDemand {
    wanted: i64,
    ready: i64,
}

fn demand_per_node(pods: &[Pod], resource_name: &str) -> HashMap<String, NodeDemand> {
    let mut demand: HashMap<String, NodeDemand> = HashMap::new();
    for pod in pods {
        let phase = pod
            .status
            .as_ref()
            .and_then(|s| s.phase.as_deref())
            .unwrap_or("");
        if phase == "Succeeded" || phase == "Failed" {
            continue;
        }
        let node = match pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) {
            Some(node) if !node.is_empty() => node,
            _ => continue,
        };
        let units = requested_units(pod, resource_name);
        if units == 0 {
            continue;
        }
        let entry = demand.entry(node.to_string()).or_default();
        entry.wanted += units;
        if pod_is_ready(pod) {
            entry.ready += units;
        }
    }
    demand
}

/// Target states for the pool's devices on one node: the first `wanted`
/// devices in inventory order hold a reservation, of which the first
/// `ready` are in use.
fn node_transitions(
    devices: &mut [&PoolDeviceStatus],
    demand: NodeDemand,
) -> Vec<(String, DeviceState, DeviceState)> {
    devices.sort_by(|a, b| a.inventory_id.cmp(&b.inventory_id));
    let mut transitions = Vec::new();
    let mut covered = 0i64;
    for device in devices.iter() {
        let target = if covered < demand.ready {
            DeviceState::InUse
        } else if covered < demand.wanted {
            DeviceState::Reserved
        } else {
            DeviceState::Assigned
        };
        covered += 1;
        let valid = match (device.state, target) {
            (from, to) if from == to => false,
            (DeviceState::Assigned, DeviceState::Reserved) => true,
            (DeviceState::Assigned, DeviceState::InUse) => true,
            (DeviceState::Reserved, DeviceState::InUse) => true,
            (DeviceState::Reserved, DeviceState::Assigned) => true,
            (DeviceState::InUse, DeviceState::Assigned) => true,
            (DeviceState::InUse, DeviceState::Reserved) => true,
            _ => false,
        };
        if valid {
            transitions.push((device.name.clone(), device.state, target));
        }
    }
    transitions
}

#[async_trait]
impl PoolHandler for PodUsageHandler {
    fn name(&self) -> &'static str {
        "pod-usage"
    }

    async fn handle(&self, ctx: &Context, pool: &mut PoolObject) -> anyhow::Result<HandlerResult> {
        let key = pool.key();
        let resource_name = key.resource_name();

        let pods: Api<Pod> = Api::all(ctx.client.clone());
        let selector = format!("{}={}", POOL_NAME_LABEL, key.name);
        let pods = pods
            .list(&ListParams::default().labels(&selector))
            .await?
            .items;
        let demand = demand_per_node(&pods, &resource_name);

        let entries = pool.status().map(|s| s.devices.clone()).unwrap_or_default();
        let mut per_node: BTreeMap<&str, Vec<&PoolDeviceStatus>> = BTreeMap::new();
        for entry in &entries {
            if matches!(
                entry.state,
                DeviceState::Assigned | DeviceState::Reserved | DeviceState::InUse
            ) {
                per_node.entry(entry.node_name.as_str()).or_default().push(entry);
            }
        }

        let pool_name = key.name.clone();
        for (node, mut devices) in per_node {
            let node_demand = demand.get(node).copied().unwrap_or_default();
            let transitions = node_transitions(&mut devices, node_demand);
            if transitions.is_empty() {
                continue;
            }
            debug!(node, count = transitions.len(), "usage transitions planned");
            for (name, from, target) in transitions {
                let pool_name = pool_name.clone();
                let changed = update_device_status(&ctx.client, &name, move |status| {
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
                    if let Some(entry) =
                        pool.status_mut().devices.iter_mut().find(|d| d.name == name)
                    {
                        entry.state = target;
                    }
                }
            }
        }
        Ok(HandlerResult::proceed())
    }
}
