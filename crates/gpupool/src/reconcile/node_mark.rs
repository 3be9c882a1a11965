//! Idempotent label/taint reconciliation on the pool's nodes.
//!
//! Nodes with devices get the pool label and a NoSchedule fence (when
//! taints are enabled); nodes that lost all devices lose the label and get
//! a NoExecute taint to drain residual pool pods. Non-pool taints are
//! preserved; the pool's own taints (under either prefix) are replaced
//! atomically.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Taint};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::ResourceExt;
use tracing::debug;

use super::{Context, HandlerResult, PoolHandler};
use crate::client::{is_not_found, with_conflict_retry};
use crate::pool::{PoolObject, PoolScope};

pub struct NodeMarkHandler;

const NO_SCHEDULE: &str = "NoSchedule";
const NO_EXECUTE: &str = "NoExecute";

fn alternate_scope(scope: PoolScope) -> PoolScope {
    match scope {
        PoolScope::Cluster => PoolScope::Namespaced,
        PoolScope::Namespaced => PoolScope::Cluster,
    }
}

/// Desired state of one node with respect to one pool.
#[derive(Debug, PartialEq)]
struct NodePlan {
    labels: BTreeMap<String, Option<String>>,
    taints: Vec<Taint>,
}

/// Computes the label/taint changes a node needs, or `None` when it is
/// already in shape — that keeps the marker write-free on a settled world.
fn plan_node(
    labels: &BTreeMap<String, String>,
    taints: &[Taint],
    label_key: &str,
    alternate_key: &str,
    pool_name: &str,
    has_devices: bool,
    taints_enabled: bool,
) -> Option<NodePlan> {
    let mut label_changes: BTreeMap<String, Option<String>> = BTreeMap::new();
    if has_devices {
        if labels.get(label_key).map(|v| v.as_str()) != Some(pool_name) {
            label_changes.insert(label_key.to_string(), Some(pool_name.to_string()));
        }
    } else if labels.contains_key(label_key) {
        label_changes.insert(label_key.to_string(), None);
    }
    if labels.contains_key(alternate_key) {
        label_changes.insert(alternate_key.to_string(), None);
    }

    let mut desired_taints: Vec<Taint> = taints
        .iter()
        .filter(|t| t.key != label_key && t.key != alternate_key)
        .cloned()
        .collect();
    if taints_enabled {
        desired_taints.push(Taint {
            key: label_key.to_string(),
            value: Some(pool_name.to_string()),
            effect: if has_devices { NO_SCHEDULE } else { NO_EXECUTE }.to_string(),
            time_added: None,
        });
    }

    let taints_changed = desired_taints != taints;
    if label_changes.is_empty() && !taints_changed {
        return None;
    }
    Some(NodePlan {
        labels: label_changes,
        taints: desired_taints,
    })
}

fn node_is_marked(node: &Node, label_key: &str, alternate_key: &str) -> bool {
    if node.labels().contains_key(label_key) || node.labels().contains_key(alternate_key) {
        return true;
    }
    node.spec
        .as_ref()
        .and_then(|s| s.taints.as_ref())
        .map(|taints| {
            taints
                .iter()
                .any(|t| t.key == label_key || t.key == alternate_key)
        })
        .unwrap_or(false)
}

#[async_trait]
impl PoolHandler for NodeMarkHandler {
    fn name(&self) -> &'static str {
        "node-mark"
    }

    async fn handle(&self, ctx: &Context, pool: &mut PoolObject) -> anyhow::Result<HandlerResult> {
        let key = pool.key();
        let label_key = key.node_label_key();
        let alternate_key = format!("{}/{}", alternate_scope(key.scope).prefix(), key.name);
        let pool_name = pool.name();
        let taints_enabled = pool.spec().scheduling.taints_enabled();

        let device_counts: HashMap<String, i64> = pool
            .status()
            .map(|s| {
                s.nodes
                    .iter()
                    .map(|n| (n.name.clone(), n.total_devices))
                    .collect()
            })
            .unwrap_or_default();

        // Nodes to reconcile: everything the tally names, plus nodes still
        // carrying the pool mark from an earlier shape of the pool.
        let api: Api<Node> = Api::all(ctx.client.clone());
        let nodes = api.list(&ListParams::default()).await?.items;
        for node in nodes {
            let node_name = node.name();
            let tallied = device_counts.get(&node_name).copied();
            if tallied.is_none() && !node_is_marked(&node, &label_key, &alternate_key) {
                continue;
            }
            let has_devices = tallied.unwrap_or(0) > 0;

            let api = api.clone();
            let node_name_for_patch = node_name.clone();
            let changed = with_conflict_retry(|| {
                let api = api.clone();
                let label_key = label_key.clone();
                let alternate_key = alternate_key.clone();
                let pool_name = pool_name.clone();
                let node_name = node_name_for_patch.clone();
                async move {
                    let current = match api.get(&node_name).await {
                        Ok(node) => node,
                        Err(ref e) if is_not_found(e) => return Ok(false),
                        Err(e) => return Err(e),
                    };
                    let labels = current.metadata.labels.clone().unwrap_or_default();
                    let taints = current
                        .spec
                        .as_ref()
                        .and_then(|s| s.taints.clone())
                        .unwrap_or_default();
                    let plan = match plan_node(
                        &labels,
                        &taints,
                        &label_key,
                        &alternate_key,
                        &pool_name,
                        has_devices,
                        taints_enabled,
                    ) {
                        Some(plan) => plan,
                        None => return Ok(false),
                    };
                    let patch = serde_json::json!({
                        "metadata": { "labels": plan.labels },
                        "spec": { "taints": plan.taints },
                    });
                    match api
                        .patch(&node_name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await
                    {
                        Ok(_) => Ok(true),
                        Err(ref e) if is_not_found(e) => Ok(false),
                        Err(e) => Err(e),
                    }
                }
            })
            .await?;
            if changed {
                debug!(node = %node_name, has_devices, "node marks reconciled");
            }
        }
        Ok(HandlerResult::proceed())
    }
}
