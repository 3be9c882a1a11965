//! Custom resource definitions and wire-level constants shared by the
//! reconciler and the admission webhooks.

mod device;
mod inventory;
mod moduleconfig;
mod pool;

pub use device::{DeviceState, GPUDevice, GPUDeviceSpec, GPUDeviceStatus, PoolRef};
pub use inventory::{GPUNodeInventory, GPUNodeInventorySpec, GPUNodeInventoryStatus, InventoryDevice};
pub use moduleconfig::{
    ModuleConfig, ModuleConfigSpec, ModuleSettings, PlacementSettings, RendererSettings,
    SchedulingSettings,
};
pub use pool::{
    ClusterGPUPool, ClusterGPUPoolSpec, DeviceRules, DeviceSelector, GPUPool, GPUPoolSpec,
    GPUPoolStatus, MigLayoutEntry, MigProfileCount, NodeSelector, NodeSelectorRequirement,
    PoolCapacity, PoolCondition, PoolDeviceStatus, PoolNodeStatus, PoolResource, PoolScheduling,
    ResourceUnit, TimeSlicingResource, BACKEND_DEVICE_PLUGIN, PROVIDER_NVIDIA, STRATEGY_SPREAD,
};

/// API group of the namespaced pool resources and of every annotation, label,
/// and taint the control plane places on cluster objects.
pub const GROUP: &str = "gpu.deckhouse.io";

/// API group prefix used for cluster-scoped pools on the resource-name wire.
pub const CLUSTER_GROUP: &str = "cluster.gpu.deckhouse.io";

/// Version served by all custom resources of this module.
pub const VERSION: &str = "v1alpha1";

/// Authoritative link from a device to a namespaced pool.
pub const ASSIGNMENT_ANNOTATION: &str = "gpu.deckhouse.io/assignment";

/// Authoritative link from a device to a cluster pool.
pub const CLUSTER_ASSIGNMENT_ANNOTATION: &str = "cluster.gpu.deckhouse.io/assignment";

/// Opts a device out of pool membership entirely.
pub const IGNORE_LABEL: &str = "gpu.deckhouse.io/ignore";

/// Namespaces must carry this label with value `"true"` before any pod in
/// them may request pool resources.
pub const NAMESPACE_ENABLED_LABEL: &str = "gpu.deckhouse.io/enabled";

/// Label the pod defaulter stamps with the selected pool name.
pub const POOL_NAME_LABEL: &str = "gpu.deckhouse.io/pool-name";

/// Label the pod defaulter stamps with the selected pool scope.
pub const POOL_SCOPE_LABEL: &str = "gpu.deckhouse.io/pool-scope";

/// Fallback node-name label on devices whose status is not yet populated.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// `app` label value of the data-plane validator pods.
pub const VALIDATOR_APP: &str = "nvidia-operator-validator";

/// Label key carrying the pool name on validator pods.
pub const VALIDATOR_POOL_LABEL: &str = "pool";

/// `Configured` condition: the pool spec and module configuration are
/// consistent and the pool may admit workloads.
pub const CONDITION_CONFIGURED: &str = "Configured";

/// `Maintenance` condition: reconciliation is suspended for the pool.
pub const CONDITION_MAINTENANCE: &str = "Maintenance";
