// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;

use thiserror::Error;

use crate::codec::StreamError;
use crate::device::TransitionError;

/// Errors which may occur while migrating a passthrough device.
#[derive(Debug, Error)]
pub enum MigrateError {
    /// The device could not be moved to the requested migration state
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Malformed or unreadable device state in the migration stream
    #[error(transparent)]
    Stream(StreamError),

    /// Reading or writing the device's data channel failed
    #[error("data channel I/O error: {0}")]
    ChannelIo(#[source] io::Error),

    /// Device state was to be transferred with no data channel open
    #[error("no data channel open")]
    NoDataChannel,

    /// The device doesn't support migration
    #[error("device doesn't support migration")]
    NotSupported,

    /// Querying the device's migration capabilities failed
    #[error("failed to query migration capabilities: {0}")]
    Capability(#[source] io::Error),

    /// The configured transfer buffer cannot hold any device state
    #[error("data buffer size must be non-zero")]
    InvalidBufferSize,

    /// A migration blocker could not be installed
    #[error("failed to add migration blocker: {0}")]
    Blocker(String),
}

impl From<StreamError> for MigrateError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Sink(e) => MigrateError::ChannelIo(e),
            e => MigrateError::Stream(e),
        }
    }
}

impl MigrateError {
    /// Does this error leave the host in a state where it cannot safely
    /// continue?
    pub fn is_fatal(&self) -> bool {
        matches!(self, MigrateError::Transition(e) if e.is_fatal())
    }
}
