// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use slog::{debug, info, o, Drain, Level, Logger};

use vfio_mig::codec::{self, Tag, VFIO_MIG_FLAG_END_OF_STATE};
use vfio_mig::config;

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Inspect VFIO device migration streams and configuration
struct Opt {
    /// Enable debugging
    #[clap(short, long, action)]
    debug: bool,

    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Decode a captured device migration stream
    Inspect {
        /// File holding the device's section of the stream
        #[clap(action)]
        stream: PathBuf,
    },

    /// Check a configuration file and show the effective settings
    CheckConfig {
        /// TOML configuration file
        #[clap(action)]
        config: PathBuf,
    },
}

/// Create a top-level logger that outputs to stderr
fn create_logger(opt: &Opt) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let level = if opt.debug { Level::Debug } else { Level::Info };
    let drain = slog::LevelFilter(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Logger::root(drain, o!())
}

#[derive(Debug, PartialEq, Eq)]
enum SectionKind {
    Setup,
    Data(u64),
    /// Opaque config payload of the given length
    Config(u64),
    End,
}

#[derive(Debug, PartialEq, Eq)]
struct Section {
    offset: u64,
    kind: SectionKind,
}

/// Split a device's migration stream into its sections.
fn decode_sections(data: &[u8]) -> anyhow::Result<Vec<Section>> {
    let end_marker = VFIO_MIG_FLAG_END_OF_STATE.to_be_bytes();
    let mut rd = Cursor::new(data);
    let mut sections = Vec::new();

    while (rd.position() as usize) < data.len() {
        let offset = rd.position();
        let tag = codec::read_tag(&mut rd)
            .with_context(|| format!("bad tag at offset {offset:#x}"))?;

        let kind = match tag {
            Tag::EndOfState => SectionKind::End,
            Tag::DevSetupState => {
                codec::expect_end_of_state(&mut rd, Tag::DevSetupState)
                    .with_context(|| {
                        format!("setup section at offset {offset:#x}")
                    })?;
                SectionKind::Setup
            }
            Tag::DevDataState => {
                let len = codec::read_data_len(&mut rd)?;
                codec::skip_data(&mut rd, len).with_context(|| {
                    format!("truncated data section at offset {offset:#x}")
                })?;
                SectionKind::Data(len)
            }
            Tag::DevConfigState => {
                // The payload is device-defined, so the closing marker is
                // the only way to find where it ends.
                let start = rd.position() as usize;
                let len = data[start..]
                    .windows(end_marker.len())
                    .position(|w| w == end_marker)
                    .ok_or_else(|| {
                        anyhow!("unterminated config section at {offset:#x}")
                    })?;
                rd.set_position((start + len + end_marker.len()) as u64);
                SectionKind::Config(len as u64)
            }
        };
        sections.push(Section { offset, kind });
    }
    Ok(sections)
}

fn inspect(path: &Path, log: &Logger) -> anyhow::Result<()> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    debug!(log, "decoding stream"; "path" => %path.display(),
        "len" => data.len());

    let sections = decode_sections(&data)?;
    let mut blocks = 0;
    let mut total = 0;
    for s in sections.iter() {
        match s.kind {
            SectionKind::Setup => println!("{:#010x} SETUP", s.offset),
            SectionKind::Data(len) => {
                blocks += 1;
                total += len;
                println!("{:#010x} DATA   {len} bytes", s.offset);
            }
            SectionKind::Config(len) => {
                println!("{:#010x} CONFIG {len} bytes", s.offset)
            }
            SectionKind::End => println!("{:#010x} END", s.offset),
        }
    }
    println!("{blocks} data sections, {total} bytes of device state");
    Ok(())
}

fn check_config(path: &Path, log: &Logger) -> anyhow::Result<()> {
    let cfg = config::parse(path)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    info!(log, "configuration ok"; "devices" => cfg.devices.len());

    println!(
        "migration {} by default, {} byte data buffer",
        if cfg.migration.enable { "enabled" } else { "disabled" },
        cfg.migration.data_buffer_size
    );
    for (name, dev) in cfg.devices.iter() {
        let state =
            if cfg.enable_for(name) { "enabled" } else { "disabled" };
        println!("{name}: {} (migration {state})", dev.sysfsdev);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();
    let log = create_logger(&opt);

    match &opt.cmd {
        Command::Inspect { stream } => inspect(stream, &log)?,
        Command::CheckConfig { config } => check_config(config, &log)?,
    }
    Ok(())
}
