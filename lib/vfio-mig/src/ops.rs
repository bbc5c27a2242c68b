// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface to the kernel-mediated device state controls.
//!
//! The device's internal state cannot be observed directly. All that the
//! host gets is a way to request a new migration state (which may hand back a
//! data channel through which the device state streams), a hard reset, and a
//! capability query.

use std::io::{self, Read, Write};

use crate::state::{MigrationFlags, MigrationState};

/// Byte channel carrying opaque device state between the kernel and the
/// migration stream.
///
/// During save, the device state is read from it; during load, the incoming
/// state is written into it.  Dropping the channel closes it.
pub trait DataChannel: Read + Write + Send {}
impl<T: Read + Write + Send> DataChannel for T {}

/// Kernel state-transition interface for a single device.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceStateOps: Send + Sync {
    /// Ask the kernel to move the device to `state`.
    ///
    /// On success the kernel may hand back a freshly opened data channel,
    /// which becomes the caller's to own.
    fn set_state(
        &self,
        state: MigrationState,
    ) -> io::Result<Option<Box<dyn DataChannel>>>;

    /// Hard-reset the device.
    fn reset(&self) -> io::Result<()>;

    /// Query the migration capabilities of the device.
    fn migration_flags(&self) -> io::Result<MigrationFlags>;
}
