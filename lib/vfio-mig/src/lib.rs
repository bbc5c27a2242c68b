// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live migration of VFIO passthrough devices.
//!
//! The device state itself is opaque: it is driven through the kernel's
//! migration state interface ([`ops::DeviceStateOps`]) and streamed through
//! the data channel the kernel hands back.  This crate sequences those
//! transitions, frames the device state into the migration stream, and
//! orders run-state changes across the device tree.

#![allow(clippy::style)]

#[macro_use]
extern crate bitflags;

pub mod codec;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod notifier;
pub mod ops;
pub mod precopy;
pub mod state;
pub mod stats;
pub mod stream;
#[cfg(target_os = "linux")]
pub mod sys;
pub mod topology;

#[cfg(test)]
mod test_util;

pub use device::DeviceStateMachine;
pub use error::MigrateError;
pub use lifecycle::{MigrationHost, MigrationOpts, VfioMigration};
pub use notifier::VmStateNotifier;
pub use state::{MigrationFlags, MigrationState};
pub use stats::TransferStats;
