use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{HOSTNAME_LABEL, IGNORE_LABEL};

/// A single physical GPU or MIG partition, discovered and owned by the node
/// agent. The control plane only ever touches the status (`poolRef`,
/// `state`) and reads the assignment annotation.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gpu.deckhouse.io",
    version = "v1alpha1",
    kind = "GPUDevice",
    plural = "gpudevices",
    status = "GPUDeviceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GPUDeviceSpec {}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GPUDeviceStatus {
    #[serde(default)]
    pub inventory_id: String,
    #[serde(default)]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_ref: Option<PoolRef>,
    #[serde(default)]
    pub state: DeviceState,
}

/// Reflective back-pointer from a device to the pool it is assigned to. The
/// assignment annotation stays authoritative; this is a view the reconciler
/// maintains. Legacy refs written before namespaced pools existed carry no
/// namespace.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Ready,
    PendingAssignment,
    Assigned,
    Reserved,
    InUse,
    Faulted,
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState::Ready
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceState::Ready => "Ready",
            DeviceState::PendingAssignment => "PendingAssignment",
            DeviceState::Assigned => "Assigned",
            DeviceState::Reserved => "Reserved",
            DeviceState::InUse => "InUse",
            DeviceState::Faulted => "Faulted",
        };
        f.write_str(s)
    }
}

impl DeviceState {
    /// States that hold pool capacity against `used`.
    pub fn is_consuming(&self) -> bool {
        matches!(self, DeviceState::Reserved | DeviceState::InUse)
    }

    /// States an unassign may silently reset to `Ready`. `InUse` and
    /// `Faulted` devices are left for the operator to look at.
    pub fn is_releasable(&self) -> bool {
        matches!(
            self,
            DeviceState::Assigned | DeviceState::Reserved | DeviceState::PendingAssignment
        )
    }
}

impl GPUDevice {
    /// Pool name recorded under the given assignment annotation key.
    pub fn assignment(&self, key: &str) -> Option<&str> {
        self.annotations().get(key).map(|s| s.as_str())
    }

    pub fn is_ignored(&self) -> bool {
        self.labels().get(IGNORE_LABEL).map(|v| v.as_str()) == Some("true")
    }

    /// Node the device sits on: status first, hostname label as fallback for
    /// devices the agent has created but not yet fully reported.
    pub fn node_name(&self) -> Option<&str> {
        match &self.status {
            Some(status) if !status.node_name.is_empty() => Some(status.node_name.as_str()),
            _ => self.labels().get(HOSTNAME_LABEL).map(|s| s.as_str()),
        }
    }

    /// Stable identity used to join devices against inventories: the
    /// inventory ID when reported, the object name otherwise.
    pub fn inventory_key(&self) -> &str {
        match &self.status {
            Some(status) if !status.inventory_id.is_empty() => status.inventory_id.as_str(),
            _ => self.metadata.name.as_deref().unwrap_or_default(),
        }
    }

    pub fn state(&self) -> DeviceState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}
