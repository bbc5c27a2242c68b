// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Framing of device state within the migration stream.
//!
//! Device state is carried as a sequence of sections, each opened by a 64-bit
//! big-endian tag and closed by the end-of-state tag.  Tags are composed as:
//!
//! ```text
//! 0xffffffff  all-ones upper half
//!     0xef10  magic, identifying a passthrough (VFIO) device
//!     0x000n  section kind
//! ```
//!
//! Config sections carry an opaque payload produced by the device-specific
//! config hooks.  Data sections carry a 64-bit big-endian length followed by
//! that many bytes of raw device state.  Setup sections carry nothing.

use std::fmt;
use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

pub const VFIO_MIG_FLAG_END_OF_STATE: u64 = 0xffff_ffff_ef10_0001;
pub const VFIO_MIG_FLAG_DEV_CONFIG_STATE: u64 = 0xffff_ffff_ef10_0002;
pub const VFIO_MIG_FLAG_DEV_SETUP_STATE: u64 = 0xffff_ffff_ef10_0003;
pub const VFIO_MIG_FLAG_DEV_DATA_STATE: u64 = 0xffff_ffff_ef10_0004;

/// Section delimiters in the device migration stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u64)]
pub enum Tag {
    EndOfState = VFIO_MIG_FLAG_END_OF_STATE,
    DevConfigState = VFIO_MIG_FLAG_DEV_CONFIG_STATE,
    DevSetupState = VFIO_MIG_FLAG_DEV_SETUP_STATE,
    DevDataState = VFIO_MIG_FLAG_DEV_DATA_STATE,
}

impl TryFrom<u64> for Tag {
    type Error = StreamError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            VFIO_MIG_FLAG_END_OF_STATE => Ok(Tag::EndOfState),
            VFIO_MIG_FLAG_DEV_CONFIG_STATE => Ok(Tag::DevConfigState),
            VFIO_MIG_FLAG_DEV_SETUP_STATE => Ok(Tag::DevSetupState),
            VFIO_MIG_FLAG_DEV_DATA_STATE => Ok(Tag::DevDataState),
            x => Err(StreamError::UnknownTag(x)),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Tag::EndOfState => "END_OF_STATE",
            Tag::DevConfigState => "DEV_CONFIG_STATE",
            Tag::DevSetupState => "DEV_SETUP_STATE",
            Tag::DevDataState => "DEV_DATA_STATE",
        };
        write!(f, "{s}")
    }
}

/// Errors encountered while framing or deframing device state.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A tag which does not open any known section
    #[error("unknown tag {0:#x}")]
    UnknownTag(u64),

    /// A section was not closed by the end-of-state marker
    #[error("{section}: end-of-state not found, got {found:#x}")]
    MissingEndOfState { section: Tag, found: u64 },

    /// The device-specific config hooks failed
    #[error("failed to load device config space: {0}")]
    Config(String),

    /// The migration stream was already marked as failed
    #[error("migration stream failed: {0}")]
    Failed(String),

    /// Reading or writing the migration stream failed
    #[error("stream I/O error: {0}")]
    Io(#[from] io::Error),

    /// Forwarding device data into its destination failed
    #[error("failed to write device data: {0}")]
    Sink(#[source] io::Error),
}

/// Device-specific encoding of config space, which the framing layer treats
/// as opaque.
///
/// The payload must be self-delimiting: `load_config` has to consume exactly
/// what `save_config` emitted.
pub trait DeviceConfigHooks: Send + Sync {
    fn save_config(&self, f: &mut dyn Write) -> io::Result<()>;
    fn load_config(&self, f: &mut dyn Read) -> io::Result<()>;
}

pub fn write_tag(f: &mut dyn Write, tag: Tag) -> io::Result<()> {
    f.write_u64::<BigEndian>(tag as u64)
}

/// Emit a config section, with the payload produced by `hooks` (if any).
pub fn write_config_section(
    f: &mut dyn Write,
    hooks: Option<&dyn DeviceConfigHooks>,
) -> io::Result<()> {
    write_tag(f, Tag::DevConfigState)?;
    if let Some(hooks) = hooks {
        hooks.save_config(f)?;
    }
    write_tag(f, Tag::EndOfState)
}

/// Emit an (empty) setup section.
pub fn write_setup_section(f: &mut dyn Write) -> io::Result<()> {
    write_tag(f, Tag::DevSetupState)?;
    write_tag(f, Tag::EndOfState)
}

/// Emit a data section holding `data`, returning the number of device-state
/// bytes it carries.
pub fn write_data_block(f: &mut dyn Write, data: &[u8]) -> io::Result<u64> {
    write_tag(f, Tag::DevDataState)?;
    f.write_u64::<BigEndian>(data.len() as u64)?;
    f.write_all(data)?;
    Ok(data.len() as u64)
}

/// Read the next tag from the stream.
pub fn read_tag(f: &mut dyn Read) -> Result<Tag, StreamError> {
    Tag::try_from(f.read_u64::<BigEndian>()?)
}

/// Require that the next tag closes `section`.
pub fn expect_end_of_state(
    f: &mut dyn Read,
    section: Tag,
) -> Result<(), StreamError> {
    let found = f.read_u64::<BigEndian>()?;
    if found != VFIO_MIG_FLAG_END_OF_STATE {
        return Err(StreamError::MissingEndOfState { section, found });
    }
    Ok(())
}

/// Consume the body of a config section whose tag was already read.
pub fn read_config_section(
    f: &mut dyn Read,
    hooks: Option<&dyn DeviceConfigHooks>,
) -> Result<(), StreamError> {
    if let Some(hooks) = hooks {
        hooks
            .load_config(f)
            .map_err(|e| StreamError::Config(e.to_string()))?;
    }
    expect_end_of_state(f, Tag::DevConfigState)
}

/// Read the length field of a data section whose tag was already read.
pub fn read_data_len(f: &mut dyn Read) -> Result<u64, StreamError> {
    Ok(f.read_u64::<BigEndian>()?)
}

/// Forward exactly `len` bytes of device data from the stream into `sink`,
/// staging them through `scratch`.
pub fn copy_data(
    f: &mut dyn Read,
    sink: &mut dyn Write,
    len: u64,
    scratch: &mut [u8],
) -> Result<(), StreamError> {
    let mut fallback = [0u8; 4096];
    let scratch = if scratch.is_empty() { &mut fallback[..] } else { scratch };

    let mut remaining = len;
    while remaining > 0 {
        let chunk = std::cmp::min(remaining, scratch.len() as u64) as usize;
        f.read_exact(&mut scratch[..chunk])?;
        sink.write_all(&scratch[..chunk]).map_err(StreamError::Sink)?;
        remaining -= chunk as u64;
    }
    Ok(())
}

/// Discard the `len` bytes of device data following a data section header.
pub fn skip_data(f: &mut dyn Read, len: u64) -> Result<(), StreamError> {
    copy_data(f, &mut io::sink(), len, &mut [])
}
