//! Capacity arithmetic: devices to `(units, baseUnits)`, tallies to the
//! pool capacity block.

use crate::api::{InventoryDevice, PoolCapacity, PoolResource, ResourceUnit};

/// Units one device contributes to the pool.
///
/// A `Card` pool counts the whole device as one base unit, multiplied by
/// time slicing. A `MIG` pool counts the partitions matching the pool's
/// profile; a device without that profile contributes nothing.
pub fn device_units(device: &InventoryDevice, resource: &PoolResource) -> (i64, i64) {
    match resource.unit {
        ResourceUnit::Card => {
            let units = if resource.slices_per_unit > 0 {
                resource.slices_per_unit
            } else {
                1
            };
            (units, 1)
        }
        ResourceUnit::MIG => {
            let profile = match resource.mig_profile.as_deref() {
                Some(p) if !p.is_empty() => p,
                _ => return (0, 0),
            };
            let partitions = device.profile_count(profile);
            if partitions == 0 {
                return (0, 0);
            }
            let units = if resource.slices_per_unit > 0 {
                partitions * resource.slices_per_unit
            } else {
                partitions
            };
            (units, partitions)
        }
    }
}

/// Rolls the summed tallies into the status capacity block.
pub fn finalize(total: i64, used: i64, base_units: i64, resource: &PoolResource) -> PoolCapacity {
    PoolCapacity {
        total,
        used,
        available: (total - used).max(0),
        base_units,
        slices_per_unit: resource.slices_per_unit,
    }
}
