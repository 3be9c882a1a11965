use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Deckhouse module configuration object. The control plane watches the
/// instance named `gpu` and snapshots its settings into the process-wide
/// store; see [`crate::moduleconfig`].
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "deckhouse.io",
    version = "v1alpha1",
    kind = "ModuleConfig",
    plural = "moduleconfigs"
)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub settings: ModuleSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<i64>,
}

/// Typed view of the `gpu` module settings. Unknown keys are ignored so the
/// module config may carry sections this process does not consume.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSettings {
    #[serde(default)]
    pub scheduling: SchedulingSettings,
    #[serde(default)]
    pub placement: PlacementSettings,
    #[serde(default)]
    pub renderer: RendererSettings,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingSettings {
    /// Strategy applied to pools that do not pin one themselves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology_key: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlacementSettings {
    /// Taint keys workloads tolerate with an `Exists` toleration on top of
    /// whatever the pool itself requires.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_toleration_keys: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RendererSettings {
    /// Namespace the per-pool workloads are rendered into.
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub device_plugin_image: String,
    #[serde(default)]
    pub validator_image: String,
    #[serde(default)]
    pub mig_manager_image: String,
    /// `migStrategy` flag handed to the device plugin, e.g. `single`.
    #[serde(default)]
    pub mig_strategy: String,
}
