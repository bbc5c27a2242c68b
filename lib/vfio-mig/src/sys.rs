// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Linux VFIO binding for [`DeviceStateOps`].

use std::fs::File;
use std::io::{Error, Result};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

use crate::ops::{DataChannel, DeviceStateOps};
use crate::state::{MigrationFlags, MigrationState};

const VFIO_TYPE: u32 = b';' as u32;
const VFIO_BASE: u32 = 100;

// _IO(VFIO_TYPE, nr): no direction or size bits
const fn vfio_io(nr: u32) -> u32 {
    (VFIO_TYPE << 8) | (VFIO_BASE + nr)
}

pub const VFIO_DEVICE_RESET: u32 = vfio_io(11);
pub const VFIO_DEVICE_FEATURE: u32 = vfio_io(17);

pub const VFIO_DEVICE_FEATURE_GET: u32 = 1 << 16;
pub const VFIO_DEVICE_FEATURE_SET: u32 = 1 << 17;

pub const VFIO_DEVICE_FEATURE_MIGRATION: u32 = 1;
pub const VFIO_DEVICE_FEATURE_MIG_DEVICE_STATE: u32 = 2;

/// `struct vfio_device_feature` followed by
/// `struct vfio_device_feature_migration`.
#[repr(C)]
#[derive(Default)]
struct FeatureMigration {
    argsz: u32,
    flags: u32,
    mig_flags: u64,
}

/// `struct vfio_device_feature` followed by
/// `struct vfio_device_feature_mig_state`.
#[repr(C)]
#[derive(Default)]
struct FeatureMigState {
    argsz: u32,
    flags: u32,
    device_state: u32,
    data_fd: i32,
}

/// An open VFIO device file descriptor.
pub struct VfioDeviceFd(File);

impl VfioDeviceFd {
    /// Wrap an already-opened VFIO device (as obtained through
    /// `VFIO_GROUP_GET_DEVICE_FD` or a cdev open).
    pub fn new(fp: File) -> Self {
        Self(fp)
    }

    fn ioctl<T>(&self, cmd: u32, data: *mut T) -> Result<()> {
        // Safety: callers pass a pointer to a properly sized, repr(C) request
        // structure which outlives the call.
        let res = unsafe { libc::ioctl(self.0.as_raw_fd(), cmd as _, data) };
        if res < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

impl AsRawFd for VfioDeviceFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl DeviceStateOps for VfioDeviceFd {
    fn set_state(
        &self,
        state: MigrationState,
    ) -> Result<Option<Box<dyn DataChannel>>> {
        let mut req = FeatureMigState {
            argsz: std::mem::size_of::<FeatureMigState>() as u32,
            flags: VFIO_DEVICE_FEATURE_SET
                | VFIO_DEVICE_FEATURE_MIG_DEVICE_STATE,
            device_state: state.raw(),
            data_fd: -1,
        };
        self.ioctl(VFIO_DEVICE_FEATURE, &mut req)?;

        if req.data_fd < 0 {
            return Ok(None);
        }
        // Safety: the kernel handed us a new descriptor which nothing else
        // holds a reference to.
        let fp = unsafe { File::from_raw_fd(req.data_fd) };
        Ok(Some(Box::new(fp)))
    }

    fn reset(&self) -> Result<()> {
        // Safety: VFIO_DEVICE_RESET takes no argument
        let res = unsafe {
            libc::ioctl(self.0.as_raw_fd(), VFIO_DEVICE_RESET as _)
        };
        if res < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }

    fn migration_flags(&self) -> Result<MigrationFlags> {
        let mut req = FeatureMigration {
            argsz: std::mem::size_of::<FeatureMigration>() as u32,
            flags: VFIO_DEVICE_FEATURE_GET | VFIO_DEVICE_FEATURE_MIGRATION,
            mig_flags: 0,
        };
        self.ioctl(VFIO_DEVICE_FEATURE, &mut req)?;
        Ok(MigrationFlags::from_bits_retain(req.mig_flags))
    }
}
