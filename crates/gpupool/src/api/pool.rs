use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::device::DeviceState;

/// Spec shared by namespaced and cluster pools. Every field in here is
/// immutable after creation; the admission webhook enforces that.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gpu.deckhouse.io",
    version = "v1alpha1",
    kind = "GPUPool",
    plural = "gpupools",
    namespaced,
    status = "GPUPoolStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GPUPoolSpec {
    /// Hardware vendor backing the pool. Only `Nvidia` is rendered today;
    /// other values park the pool without error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Data-plane backend. Only `DevicePlugin` produces workloads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default)]
    pub resource: PoolResource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_selector: Option<DeviceSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<NodeSelector>,
    #[serde(default)]
    pub scheduling: PoolScheduling,
}

/// Cluster-scoped flavor of the pool. The spec is the same shape on the
/// wire; only the scope (and therefore the resource prefix) differs.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gpu.deckhouse.io",
    version = "v1alpha1",
    kind = "ClusterGPUPool",
    plural = "clustergpupools",
    status = "GPUPoolStatus"
)]
#[serde(transparent)]
pub struct ClusterGPUPoolSpec {
    pub pool: GPUPoolSpec,
}

impl std::ops::Deref for ClusterGPUPoolSpec {
    type Target = GPUPoolSpec;

    fn deref(&self) -> &GPUPoolSpec {
        &self.pool
    }
}

impl std::ops::DerefMut for ClusterGPUPoolSpec {
    fn deref_mut(&mut self) -> &mut GPUPoolSpec {
        &mut self.pool
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolResource {
    #[serde(default)]
    pub unit: ResourceUnit,
    /// MIG profile the pool counts, e.g. `1g.10gb`. Required for MIG pools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mig_profile: Option<String>,
    /// Time-slicing multiplier applied per base unit. Zero means no slicing.
    #[serde(default)]
    pub slices_per_unit: i64,
    /// Caps how many devices per node contribute capacity. Devices beyond
    /// the cap stay in the pool's device list but add no units.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_devices_per_node: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mig_layout: Vec<MigLayoutEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub time_slicing_resources: Vec<TimeSlicingResource>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ResourceUnit {
    Card,
    MIG,
}

impl Default for ResourceUnit {
    fn default() -> Self {
        ResourceUnit::Card
    }
}

/// One target of the rendered MIG configuration. Exactly one of `uuid`,
/// `pciBusId`, or `deviceFilter` selects the GPUs; with none set the entry
/// applies to all devices on the node.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigLayoutEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pci_bus_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<MigProfileCount>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct MigProfileCount {
    pub name: String,
    pub count: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeSlicingResource {
    /// Resource to replicate. Empty means the pool's own resource; a name
    /// carrying a `/` overrides the resource prefix of the rendered config.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slices_per_unit: i64,
}

/// Include/exclude rules evaluated against the node inventories. Within one
/// field values are ORed; across include fields the predicates are ANDed.
/// Any populated exclude predicate that matches drops the device.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include: Option<DeviceRules>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<DeviceRules>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRules {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inventory_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pci_vendors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pci_devices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mig_capable: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mig_profiles: Vec<String>,
}

/// Label selector restricting which nodes may contribute devices. The shape
/// mirrors the Kubernetes selector but is compiled up front so a bad
/// operator fails the reconcile instead of silently matching nothing.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelector {
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub match_labels: std::collections::BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<NodeSelectorRequirement>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NodeSelectorRequirement {
    pub key: String,
    /// One of `In`, `NotIn`, `Exists`, `DoesNotExist`.
    pub operator: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolScheduling {
    /// Defaults to true; `false` disables the NoSchedule fence on pool nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taints_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology_key: Option<String>,
}

impl PoolScheduling {
    pub fn taints_enabled(&self) -> bool {
        self.taints_enabled.unwrap_or(true)
    }
}

/// Spread workloads across the pool's topology domains.
pub const STRATEGY_SPREAD: &str = "Spread";

/// The only provider the renderer emits workloads for.
pub const PROVIDER_NVIDIA: &str = "Nvidia";

/// The only backend the renderer emits workloads for.
pub const BACKEND_DEVICE_PLUGIN: &str = "DevicePlugin";

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GPUPoolStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<PoolDeviceStatus>,
    #[serde(default)]
    pub capacity: PoolCapacity,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<PoolNodeStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<PoolCondition>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolDeviceStatus {
    pub name: String,
    #[serde(default)]
    pub inventory_id: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default)]
    pub state: DeviceState,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolCapacity {
    #[serde(default)]
    pub total: i64,
    #[serde(default)]
    pub used: i64,
    #[serde(default)]
    pub available: i64,
    #[serde(default)]
    pub base_units: i64,
    #[serde(default)]
    pub slices_per_unit: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolNodeStatus {
    pub name: String,
    #[serde(default)]
    pub total_devices: i64,
    #[serde(default)]
    pub assigned_devices: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl GPUPoolStatus {
    pub fn condition(&self, type_: &str) -> Option<&PoolCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    pub fn condition_is_true(&self, type_: &str) -> bool {
        matches!(self.condition(type_), Some(c) if c.status == "True")
    }

    /// Upserts a condition, bumping the transition time only when the status
    /// flips.
    pub fn set_condition(&mut self, type_: &str, status: bool, reason: &str, message: &str) {
        let status = if status { "True" } else { "False" };
        if let Some(existing) = self.conditions.iter_mut().find(|c| c.type_ == type_) {
            if existing.status != status {
                existing.last_transition_time = Some(Utc::now());
            }
            existing.status = status.to_string();
            existing.reason = Some(reason.to_string());
            existing.message = Some(message.to_string());
            return;
        }
        self.conditions.push(PoolCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            last_transition_time: Some(Utc::now()),
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn set_condition_keeps_transition_time_on_same_status() {
        let mut status = GPUPoolStatus::default();
        status.set_condition("Configured", true, "Ok", "all good");
        let first = status.condition("Configured").unwrap().last_transition_time;
        status.set_condition("Configured", true, "Ok", "still good");
        assert_eq!(
            status.condition("Configured").unwrap().last_transition_time,
            first
        );
        status.set_condition("Configured", false, "BadSelector", "broken");
        assert!(!status.condition_is_true("Configured"));
    }

    #[test]
    fn cluster_spec_is_transparent_on_the_wire() {
        let spec = ClusterGPUPoolSpec {
            pool: GPUPoolSpec {
                provider: Some("Nvidia".into()),
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["provider"], "Nvidia");
    }
}
