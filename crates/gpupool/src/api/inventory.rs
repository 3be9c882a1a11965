use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::pool::MigProfileCount;

/// Per-node inventory written by the discovery agent. Read-only input to
/// the reconciler; named after the node it describes.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "gpu.deckhouse.io",
    version = "v1alpha1",
    kind = "GPUNodeInventory",
    plural = "gpunodeinventories",
    status = "GPUNodeInventoryStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct GPUNodeInventorySpec {}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GPUNodeInventoryStatus {
    #[serde(default)]
    pub node_name: String,
    /// Node labels as seen by the agent. Used for selector matching when the
    /// Node object itself is not loaded.
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub labels: std::collections::BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<InventoryDevice>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InventoryDevice {
    pub inventory_id: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub pci_vendor: String,
    #[serde(default)]
    pub pci_device: String,
    #[serde(default)]
    pub mig_capable: bool,
    /// Partition counts per supported MIG profile.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mig_profiles: Vec<MigProfileCount>,
}

impl GPUNodeInventory {
    /// Node this inventory describes; the object name doubles as the node
    /// name for agents that predate the status field.
    pub fn node_name(&self) -> &str {
        match &self.status {
            Some(status) if !status.node_name.is_empty() => status.node_name.as_str(),
            _ => self.metadata.name.as_deref().unwrap_or_default(),
        }
    }

    pub fn devices(&self) -> &[InventoryDevice] {
        self.status.as_ref().map(|s| s.devices.as_slice()).unwrap_or_default()
    }

    pub fn labels_snapshot(&self) -> std::collections::BTreeMap<String, String> {
        self.status
            .as_ref()
            .map(|s| s.labels.clone())
            .unwrap_or_default()
    }
}

impl InventoryDevice {
    /// Number of partitions the device exposes for the given MIG profile.
    pub fn profile_count(&self, profile: &str) -> i64 {
        self.mig_profiles
            .iter()
            .find(|p| p.name == profile)
            .map(|p| p.count)
            .unwrap_or(0)
    }
}
