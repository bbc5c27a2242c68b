// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Save/load handlers for a passthrough device.
//!
//! On the source, the stream for a device consists of a setup section (when
//! the migration starts), one data section per block read from the device's
//! data channel once the VM has stopped (closed by a bare end-of-state
//! marker), and a config section.  The destination consumes these in the same
//! order, one section per call of [`SaveVmHandlers::load_state`].

use std::io::{ErrorKind, Read};
use std::sync::Arc;

use slog::{debug, error, info};

use crate::codec::{self, DeviceConfigHooks, Tag};
use crate::device::{DeviceStateMachine, Transfer};
use crate::engine::SaveVmHandlers;
use crate::error::MigrateError;
use crate::state::MigrationState;
use crate::stats::TransferStats;
use crate::stream::SaveStream;

/// Outcome of moving one block from the data channel into the stream.
enum Block {
    More,
    Done,
}

/// The migration section of one passthrough device.
pub struct PrecopyHandlers {
    sm: Arc<DeviceStateMachine>,
    hooks: Option<Arc<dyn DeviceConfigHooks>>,
    stats: Arc<TransferStats>,
    log: slog::Logger,
}

impl PrecopyHandlers {
    pub fn new(
        sm: Arc<DeviceStateMachine>,
        hooks: Option<Arc<dyn DeviceConfigHooks>>,
        stats: Arc<TransferStats>,
        log: &slog::Logger,
    ) -> Self {
        let log = log.new(slog::o!("dev" => sm.name().to_string()));
        Self { sm, hooks, stats, log }
    }

    /// Move the device to `target`.  A device left in an unknown state
    /// halts here rather than surfacing as an error.
    fn transition(
        &self,
        target: MigrationState,
        recovery: MigrationState,
    ) -> Result<(), MigrateError> {
        match self.sm.request_transition(target, recovery) {
            Err(e) if e.is_fatal() => self.sm.halt(&e),
            res => Ok(res?),
        }
    }

    /// Hand a checked-out transfer back.  A channel which failed is not
    /// reused.
    fn finish_transfer(
        &self,
        xfer: Transfer,
        res: &Result<(), MigrateError>,
    ) {
        if let Err(MigrateError::ChannelIo(e)) = res {
            error!(self.log, "data channel failed"; "error" => %e);
            self.sm.discard_transfer(xfer);
        } else {
            self.sm.return_transfer(xfer);
        }
    }

    fn save_block(
        &self,
        f: &mut SaveStream,
        xfer: &mut Transfer,
    ) -> Result<Block, MigrateError> {
        let data_size = loop {
            match xfer.channel.read(&mut xfer.buffer) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(MigrateError::ChannelIo(e)),
            }
        };
        if data_size == 0 {
            return Ok(Block::Done);
        }

        let sent = codec::write_data_block(f, &xfer.buffer[..data_size])
            .map_err(codec::StreamError::from)?;
        self.stats.add(sent);
        debug!(self.log, "save_block"; "data_size" => data_size);

        f.check()?;
        Ok(Block::More)
    }

    /// Drain the data channel into the stream, one data section per block.
    fn save_blocks(&self, f: &mut SaveStream) -> Result<(), MigrateError> {
        let mut xfer =
            self.sm.take_transfer().ok_or(MigrateError::NoDataChannel)?;
        let res = loop {
            match self.save_block(f, &mut xfer) {
                Ok(Block::More) => continue,
                Ok(Block::Done) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.finish_transfer(xfer, &res);
        res
    }

    fn load_buffer(
        &self,
        f: &mut dyn Read,
        data_size: u64,
    ) -> Result<(), MigrateError> {
        let mut xfer =
            self.sm.take_transfer().ok_or(MigrateError::NoDataChannel)?;
        let res = codec::copy_data(
            f,
            &mut xfer.channel,
            data_size,
            &mut xfer.buffer,
        )
        .map_err(MigrateError::from);
        self.finish_transfer(xfer, &res);
        res?;

        debug!(self.log, "load_state_device_data"; "data_size" => data_size);
        Ok(())
    }
}

impl SaveVmHandlers for PrecopyHandlers {
    fn save_setup(&self, f: &mut SaveStream) -> Result<(), MigrateError> {
        debug!(self.log, "save_setup");
        codec::write_setup_section(f).map_err(codec::StreamError::from)?;
        f.check()?;
        Ok(())
    }

    fn save_cleanup(&self) {
        self.sm.close_data_channel();
        debug!(self.log, "save_cleanup");
    }

    fn save_live_complete_precopy(
        &self,
        f: &mut SaveStream,
    ) -> Result<(), MigrateError> {
        // Only reached with the device in STOP
        self.transition(MigrationState::StopCopy, MigrationState::Stop)?;

        self.save_blocks(f)?;

        codec::write_tag(f, Tag::EndOfState)
            .map_err(codec::StreamError::from)?;
        f.check()?;

        self.transition(MigrationState::Stop, MigrationState::Error)?;
        info!(self.log, "save_complete_precopy";
            "bytes_transferred" => self.stats.bytes_transferred());
        Ok(())
    }

    fn save_state(&self, f: &mut SaveStream) {
        let res = codec::write_config_section(f, self.hooks.as_deref())
            .map_err(codec::StreamError::from)
            .and_then(|_| f.check());
        match res {
            Ok(()) => debug!(self.log, "save_device_config_state"),
            Err(e) => {
                error!(self.log, "failed to save device config space";
                    "error" => %e);
                f.set_error(format!(
                    "{}: failed to save device config space: {e}",
                    self.sm.name()
                ));
            }
        }
    }

    fn load_setup(&self) -> Result<(), MigrateError> {
        let current = self.sm.state();
        self.transition(MigrationState::Resuming, current)
    }

    fn load_cleanup(&self) -> Result<(), MigrateError> {
        self.sm.close_data_channel();
        debug!(self.log, "load_cleanup");
        Ok(())
    }

    fn load_state(
        &self,
        f: &mut dyn Read,
        _version_id: u32,
    ) -> Result<(), MigrateError> {
        loop {
            let tag = codec::read_tag(f).map_err(|e| {
                error!(self.log, "failed to read tag"; "error" => %e);
                e
            })?;
            debug!(self.log, "load_state"; "tag" => %tag);

            match tag {
                Tag::EndOfState => return Ok(()),
                Tag::DevConfigState => {
                    codec::read_config_section(f, self.hooks.as_deref())
                        .map_err(|e| {
                            error!(self.log,
                                "failed loading device config space";
                                "error" => %e);
                            e
                        })?;
                    debug!(self.log, "load_device_config_state");
                    // Config state is the last thing sent for a device.
                    return Ok(());
                }
                Tag::DevSetupState => {
                    codec::expect_end_of_state(f, Tag::DevSetupState)
                        .map_err(|e| {
                            error!(self.log, "setup state"; "error" => %e);
                            e
                        })?;
                    return Ok(());
                }
                Tag::DevDataState => {
                    let data_size = codec::read_data_len(f)?;
                    if data_size > 0 {
                        self.load_buffer(f, data_size)?;
                    }
                }
            }
        }
    }
}
