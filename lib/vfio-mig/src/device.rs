// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-device migration state machine.
//!
//! A [`DeviceStateMachine`] tracks the migration state last accepted by the
//! kernel for one device, along with the data channel (if any) that the kernel
//! handed back for the current save/load session and the buffer used to shuttle
//! device state through it.

use std::io;
use std::sync::{Arc, Mutex};

use slog::{crit, debug, error};
use thiserror::Error;

use crate::ops::{DataChannel, DeviceStateOps};
use crate::state::MigrationState;

/// Size of the buffer used to move device state out of the data channel.
pub const DEFAULT_DATA_BUFFER_SIZE: usize = 1024 * 1024;

/// Failures of [`DeviceStateMachine::request_transition`].
#[derive(Debug, Error)]
pub enum TransitionError {
    /// The kernel refused the target state, but the device was placed in the
    /// recovery state instead.
    #[error("failed changing device state to {target}, recovered to {recovered}")]
    Rejected { target: MigrationState, recovered: MigrationState },

    /// Neither the target nor the recovery state was accepted, and the device
    /// had to be reset.  Migration cannot proceed for this device.
    #[error("device was reset due to failure in changing device state to recover state {recovery}")]
    RecoveryFailed { recovery: MigrationState },

    /// The device could not even be reset.  There is no safe way to continue.
    #[error("device in error state, can't recover (target {target}, recovery {recovery}): {source}")]
    Fatal {
        target: MigrationState,
        recovery: MigrationState,
        #[source]
        source: io::Error,
    },

    /// The kernel handed back a data channel while one was still open.
    #[error("data channel out of sync")]
    ChannelDesync,
}

impl TransitionError {
    /// Is this the unrecoverable variety of failure?
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransitionError::Fatal { .. })
    }
}

struct Inner {
    state: MigrationState,
    data_fd: Option<Box<dyn DataChannel>>,
    buffer: Vec<u8>,
}

/// Migration state tracking for one passthrough device.
pub struct DeviceStateMachine {
    name: String,
    ops: Arc<dyn DeviceStateOps>,
    inner: Mutex<Inner>,
    log: slog::Logger,
}

impl DeviceStateMachine {
    /// Create the state machine for a device which is currently running.
    ///
    /// The transfer buffer holds at least one byte.
    pub fn new(
        name: &str,
        ops: Arc<dyn DeviceStateOps>,
        buffer_size: usize,
        log: &slog::Logger,
    ) -> Self {
        Self {
            name: name.to_string(),
            ops,
            inner: Mutex::new(Inner {
                state: MigrationState::Running,
                data_fd: None,
                buffer: vec![0u8; buffer_size.max(1)],
            }),
            log: log.new(slog::o!("dev" => name.to_string())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Migration state last recorded for the device.
    pub fn state(&self) -> MigrationState {
        self.inner.lock().unwrap().state
    }

    /// Is a data channel currently open?
    pub fn has_data_channel(&self) -> bool {
        self.inner.lock().unwrap().data_fd.is_some()
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.lock().unwrap().buffer.len()
    }

    /// Move the device to `target`, falling back to `recovery` if the kernel
    /// refuses.
    ///
    /// When both are refused the device is reset.  A failed reset yields
    /// [`TransitionError::Fatal`], which callers must treat as unrecoverable.
    pub fn request_transition(
        &self,
        target: MigrationState,
        recovery: MigrationState,
    ) -> Result<(), TransitionError> {
        let mut inner = self.inner.lock().unwrap();

        let new_fd = match self.ops.set_state(target) {
            Ok(fd) => fd,
            Err(e) => {
                debug!(self.log, "state change rejected";
                    "target" => %target, "error" => %e);
                return Err(self.recover(&mut inner, target, recovery));
            }
        };

        if let Some(fd) = new_fd {
            if inner.data_fd.is_some() {
                // Can happen if the device is asynchronously reset and
                // terminates a data transfer.  The new channel is dropped
                // (closed) rather than adopted.
                error!(self.log, "data channel out of sync";
                    "target" => %target);
                drop(fd);
                return Err(TransitionError::ChannelDesync);
            }
            inner.data_fd = Some(fd);
        }
        inner.state = target;

        debug!(self.log, "set_state"; "state" => %target);
        Ok(())
    }

    fn recover(
        &self,
        inner: &mut Inner,
        target: MigrationState,
        recovery: MigrationState,
    ) -> TransitionError {
        if let Err(e) = self.ops.set_state(recovery) {
            debug!(self.log, "recovery state rejected";
                "recovery" => %recovery, "error" => %e);

            if let Err(e) = self.ops.reset() {
                crit!(self.log, "device in error state, can't recover";
                    "error" => %e);
                inner.state = MigrationState::Error;
                return TransitionError::Fatal { target, recovery, source: e };
            }

            // The device is back in its power-on state, which is not tracked
            // as a migration state; treat it as errored until told otherwise.
            error!(self.log,
                "device was reset due to failure in changing device state to recover state";
                "recovery" => %recovery);
            inner.state = MigrationState::Error;
            return TransitionError::RecoveryFailed { recovery };
        }

        // Any channel the kernel offered along with the recovery state is not
        // part of a session we know about.
        error!(self.log, "failed changing device state"; "target" => %target);
        inner.state = recovery;
        TransitionError::Rejected { target, recovered: recovery }
    }

    /// Halt on a device which could not be brought back to any known state,
    /// as reported by [`TransitionError::Fatal`].
    pub fn halt(&self, err: &TransitionError) -> ! {
        crit!(self.log, "unrecoverable device error"; "error" => %err);
        panic!("{}: {err}", self.name);
    }

    /// Close the data channel, if one is open.
    pub fn close_data_channel(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.data_fd.take().is_some() {
            debug!(self.log, "data channel closed");
        }
    }

    /// Check the data channel and transfer buffer out of the state machine
    /// for the duration of a bulk transfer, so that no lock is held while
    /// blocked on the channel.
    ///
    /// The pair must be handed back through [`Self::return_transfer`].
    pub(crate) fn take_transfer(&self) -> Option<Transfer> {
        let mut inner = self.inner.lock().unwrap();
        let channel = inner.data_fd.take()?;
        let buffer = std::mem::take(&mut inner.buffer);
        Some(Transfer { channel, buffer })
    }

    pub(crate) fn return_transfer(&self, xfer: Transfer) {
        let mut inner = self.inner.lock().unwrap();
        // A channel adopted while the transfer was checked out would be a
        // desync; the one in flight is the authoritative one.
        if inner.data_fd.replace(xfer.channel).is_some() {
            error!(self.log, "data channel replaced during transfer");
        }
        inner.buffer = xfer.buffer;
    }

    /// Hand back the buffer of a transfer whose channel failed.  The channel
    /// is closed.
    pub(crate) fn discard_transfer(&self, xfer: Transfer) {
        let Transfer { channel, buffer } = xfer;
        drop(channel);
        self.inner.lock().unwrap().buffer = buffer;
        debug!(self.log, "data channel closed after I/O error");
    }
}

/// Data channel and buffer checked out for a bulk transfer.
pub(crate) struct Transfer {
    pub channel: Box<dyn DataChannel>,
    pub buffer: Vec<u8>,
}
