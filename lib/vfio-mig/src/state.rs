// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device migration states and capability bits, as exchanged with the
//! kernel's VFIO migration interface.

use std::fmt;

use strum::IntoStaticStr;

/// Migration state of a passthrough device.
///
/// Discriminants match the raw values of `enum vfio_device_mig_state`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, IntoStaticStr)]
#[repr(u32)]
pub enum MigrationState {
    #[strum(serialize = "ERROR")]
    Error = 0,
    #[strum(serialize = "STOP")]
    Stop = 1,
    #[strum(serialize = "RUNNING")]
    Running = 2,
    #[strum(serialize = "STOP_COPY")]
    StopCopy = 3,
    #[strum(serialize = "RESUMING")]
    Resuming = 4,
    #[strum(serialize = "RUNNING_P2P")]
    RunningP2P = 5,
}

impl MigrationState {
    /// Raw value handed to the kernel.
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Interpret a raw kernel value, if it names a known state.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => MigrationState::Error,
            1 => MigrationState::Stop,
            2 => MigrationState::Running,
            3 => MigrationState::StopCopy,
            4 => MigrationState::Resuming,
            5 => MigrationState::RunningP2P,
            _ => return None,
        })
    }

    /// Diagnostic name for a raw state value, including ones this crate does
    /// not know about.
    pub fn raw_name(raw: u32) -> &'static str {
        match Self::from_raw(raw) {
            Some(state) => state.into(),
            None => "UNKNOWN STATE",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: &'static str = self.into();
        f.write_str(s)
    }
}

bitflags! {
    /// Migration capabilities reported by the kernel for a device
    /// (`VFIO_DEVICE_FEATURE_MIGRATION`).
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct MigrationFlags: u64 {
        /// The device can be stopped and have its complete state read out.
        const STOP_COPY = 1 << 0;
        const P2P = 1 << 1;
        const PRE_COPY = 1 << 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_match_kernel_spelling() {
        assert_eq!(MigrationState::StopCopy.to_string(), "STOP_COPY");
        assert_eq!(MigrationState::RunningP2P.to_string(), "RUNNING_P2P");
        assert_eq!(MigrationState::raw_name(2), "RUNNING");
        assert_eq!(MigrationState::raw_name(42), "UNKNOWN STATE");
    }

    #[test]
    fn raw_values_are_stable() {
        for raw in 0..=5 {
            let state = MigrationState::from_raw(raw).unwrap();
            assert_eq!(state.raw(), raw);
        }
        assert!(MigrationState::from_raw(6).is_none());
    }

    #[test]
    fn unknown_capability_bits_are_kept() {
        let flags = MigrationFlags::from_bits_retain(0x11);
        assert!(flags.contains(MigrationFlags::STOP_COPY));
        assert!(!flags.contains(MigrationFlags::P2P));
    }
}
