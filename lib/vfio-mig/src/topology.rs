// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The view of the device tree needed to order run-state notifications.
//!
//! Devices hang off buses, and buses (other than the root) are owned by a
//! parent device.  Only the upward links are needed here.

use std::sync::Arc;

/// A device in the VM's device tree.
pub trait DeviceNode: Send + Sync {
    /// The bus this device is attached to, if any.
    fn parent_bus(&self) -> Option<Arc<dyn BusNode>>;

    /// Stable, addressable path of the device, used to key its section in the
    /// migration stream.
    fn migration_path(&self) -> Option<String> {
        None
    }
}

/// A bus in the VM's device tree.
pub trait BusNode: Send + Sync {
    /// The device which provides this bus, or `None` for a root bus.
    fn parent(&self) -> Option<Arc<dyn DeviceNode>>;
}

/// Number of hops from `dev` up to the root of its tree.
///
/// Each bus crossed counts as one hop.  A device with no parent bus is at
/// depth 0; a device on a root bus is at depth 1.
pub fn tree_depth(dev: &dyn DeviceNode) -> u32 {
    let mut depth = 0;
    let mut bus = dev.parent_bus();
    while let Some(b) = bus {
        depth += 1;
        bus = match b.parent() {
            Some(parent) => parent.parent_bus(),
            None => break,
        };
    }
    depth
}
