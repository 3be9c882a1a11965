//! Device matching against pool include/exclude rules.

use crate::api::{DeviceRules, DeviceSelector, InventoryDevice};

/// Applies the pool's device selector to a node's inventory. With no
/// selector every device is kept. Exclude rules run first: a device matching
/// any populated exclude predicate is dropped regardless of include. The
/// include rules then keep devices satisfying every populated predicate
/// (values within one predicate are ORed); an empty include keeps all.
pub fn filter(devices: &[InventoryDevice], selector: Option<&DeviceSelector>) -> Vec<InventoryDevice> {
    let selector = match selector {
        Some(s) => s,
        None => return devices.to_vec(),
    };
    devices
        .iter()
        .filter(|dev| {
            if let Some(exclude) = &selector.exclude {
                if matches_any(dev, exclude) {
                    return false;
                }
            }
            match &selector.include {
                Some(include) => matches_all(dev, include),
                None => true,
            }
        })
        .cloned()
        .collect()
}

fn matches_any(dev: &InventoryDevice, rules: &DeviceRules) -> bool {
    if rules.inventory_ids.contains(&dev.inventory_id) {
        return true;
    }
    if rules.products.contains(&dev.product) {
        return true;
    }
    if rules.pci_vendors.contains(&dev.pci_vendor) {
        return true;
    }
    if rules.pci_devices.contains(&dev.pci_device) {
        return true;
    }
    if rules.mig_capable == Some(dev.mig_capable) {
        return true;
    }
    dev.mig_profiles
        .iter()
        .any(|p| rules.mig_profiles.contains(&p.name))
}

fn matches_all(dev: &InventoryDevice, rules: &DeviceRules) -> bool {
    if !rules.inventory_ids.is_empty() && !rules.inventory_ids.contains(&dev.inventory_id) {
        return false;
    }
    if !rules.products.is_empty() && !rules.products.contains(&dev.product) {
        return false;
    }
    if !rules.pci_vendors.is_empty() && !rules.pci_vendors.contains(&dev.pci_vendor) {
        return false;
    }
    if !rules.pci_devices.is_empty() && !rules.pci_devices.contains(&dev.pci_device) {
        return false;
    }
    if let Some(mig_capable) = rules.mig_capable {
        if dev.mig_capable != mig_capable {
            return false;
        }
    }
    if !rules.mig_profiles.is_empty()
        && !dev
            .mig_profiles
            .iter()
            .any(|p| rules.mig_profiles.contains(&p.name))
    {
        return false;
    }
    true
}
