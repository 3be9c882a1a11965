//! Prints the CustomResourceDefinitions this control plane serves, for
//! the deploy pipeline to apply. The ModuleConfig CRD belongs to
//! Deckhouse itself and is not emitted here.

use gpupool::api::{ClusterGPUPool, GPUDevice, GPUNodeInventory, GPUPool};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    let crds = [
        GPUPool::crd(),
        ClusterGPUPool::crd(),
        GPUDevice::crd(),
        GPUNodeInventory::crd(),
    ];
    for crd in &crds {
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
