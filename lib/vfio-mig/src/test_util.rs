// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scaffolding shared by the tests: a simulated passthrough device, a
//! recording migration engine and some stream helpers.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Cursor, Read, Write};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use slog::{Drain, KV};

use crate::codec::{self, DeviceConfigHooks, Tag};
use crate::engine::*;
use crate::ops::{DataChannel, DeviceStateOps};
use crate::state::{MigrationFlags, MigrationState};
use crate::stream::SaveStream;

pub(crate) fn test_logger() -> slog::Logger {
    let dec = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(dec).build().fuse();
    slog::Logger::root(drain, slog::o!("component" => "test"))
}

/// Drain keeping the message and full key list of every record.
#[derive(Clone, Default)]
pub(crate) struct RecordedKeys(Arc<Mutex<Vec<(String, Vec<String>)>>>);
impl RecordedKeys {
    pub(crate) fn logger(&self) -> slog::Logger {
        slog::Logger::root(self.clone(), slog::o!())
    }
    pub(crate) fn records(&self) -> Vec<(String, Vec<String>)> {
        self.0.lock().unwrap().clone()
    }
}
struct KeyCollector(Vec<String>);
impl slog::Serializer for KeyCollector {
    fn emit_arguments(
        &mut self,
        key: slog::Key,
        _val: &std::fmt::Arguments,
    ) -> slog::Result {
        self.0.push(key.to_string());
        Ok(())
    }
}
impl Drain for RecordedKeys {
    type Ok = ();
    type Err = slog::Never;

    fn log(
        &self,
        record: &slog::Record,
        values: &slog::OwnedKVList,
    ) -> Result<(), slog::Never> {
        let mut keys = KeyCollector(Vec::new());
        let _ = record.kv().serialize(record, &mut keys);
        let _ = values.serialize(record, &mut keys);
        self.0.lock().unwrap().push((record.msg().to_string(), keys.0));
        Ok(())
    }
}

/// `Write` sink whose contents remain reachable after being handed off.
#[derive(Clone, Default)]
pub(crate) struct SharedBuf(Arc<Mutex<Vec<u8>>>);
impl SharedBuf {
    pub(crate) fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}
impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Data channel of a [`FakeDevice`]: reads yield the device's outgoing
/// state, writes accumulate as incoming state.
struct FakeChannel {
    outgoing: Cursor<Vec<u8>>,
    incoming: SharedBuf,
    fail_io: bool,
}
impl Read for FakeChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.fail_io {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        self.outgoing.read(buf)
    }
}
impl Write for FakeChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_io {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        self.incoming.write(buf)
    }
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeState {
    flags: MigrationFlags,
    rejected: BTreeSet<u32>,
    fail_reset: bool,
    fail_io: bool,
    outgoing: Vec<u8>,
    transitions: Vec<MigrationState>,
    resets: usize,
}

/// Simulated kernel interface for a passthrough device.
///
/// Entering STOP_COPY opens a channel holding the configured outgoing state;
/// entering RESUMING opens one which collects whatever is written into it.
pub(crate) struct FakeDevice {
    state: Mutex<FakeState>,
    incoming: SharedBuf,
}
impl FakeDevice {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                flags: MigrationFlags::STOP_COPY,
                ..Default::default()
            }),
            incoming: SharedBuf::default(),
        })
    }

    pub(crate) fn set_flags(&self, flags: MigrationFlags) {
        self.state.lock().unwrap().flags = flags;
    }
    pub(crate) fn set_outgoing(&self, data: &[u8]) {
        self.state.lock().unwrap().outgoing = data.to_vec();
    }
    pub(crate) fn reject(&self, state: MigrationState) {
        self.state.lock().unwrap().rejected.insert(state.raw());
    }
    pub(crate) fn fail_reset(&self) {
        self.state.lock().unwrap().fail_reset = true;
    }
    /// Channels opened from now on fail every read and write.
    pub(crate) fn fail_channel_io(&self) {
        self.state.lock().unwrap().fail_io = true;
    }

    /// States the device accepted, in order.
    pub(crate) fn transitions(&self) -> Vec<MigrationState> {
        self.state.lock().unwrap().transitions.clone()
    }
    pub(crate) fn resets(&self) -> usize {
        self.state.lock().unwrap().resets
    }
    pub(crate) fn incoming(&self) -> Vec<u8> {
        self.incoming.contents()
    }
}
impl DeviceStateOps for FakeDevice {
    fn set_state(
        &self,
        state: MigrationState,
    ) -> io::Result<Option<Box<dyn DataChannel>>> {
        let mut inner = self.state.lock().unwrap();
        if inner.rejected.contains(&state.raw()) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        inner.transitions.push(state);

        let outgoing = match state {
            MigrationState::StopCopy => inner.outgoing.clone(),
            MigrationState::Resuming => Vec::new(),
            _ => return Ok(None),
        };
        Ok(Some(Box::new(FakeChannel {
            outgoing: Cursor::new(outgoing),
            incoming: self.incoming.clone(),
            fail_io: inner.fail_io,
        })))
    }

    fn reset(&self) -> io::Result<()> {
        let mut inner = self.state.lock().unwrap();
        if inner.fail_reset {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        inner.resets += 1;
        Ok(())
    }

    fn migration_flags(&self) -> io::Result<MigrationFlags> {
        Ok(self.state.lock().unwrap().flags)
    }
}

/// Config hooks emitting a length-prefixed blob.
pub(crate) struct BlobConfig {
    out: Vec<u8>,
    pub loaded: Mutex<Option<Vec<u8>>>,
}
impl BlobConfig {
    pub(crate) fn new(out: &[u8]) -> Self {
        Self { out: out.to_vec(), loaded: Mutex::new(None) }
    }
}
impl DeviceConfigHooks for BlobConfig {
    fn save_config(&self, f: &mut dyn Write) -> io::Result<()> {
        f.write_u32::<BigEndian>(self.out.len() as u32)?;
        f.write_all(&self.out)
    }
    fn load_config(&self, f: &mut dyn Read) -> io::Result<()> {
        let len = f.read_u32::<BigEndian>()? as usize;
        let mut buf = vec![0u8; len];
        f.read_exact(&mut buf)?;
        *self.loaded.lock().unwrap() = Some(buf);
        Ok(())
    }
}

/// Config hooks which always fail.
pub(crate) struct FailingConfig;
impl DeviceConfigHooks for FailingConfig {
    fn save_config(&self, _f: &mut dyn Write) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Other, "config space unreadable"))
    }
    fn load_config(&self, _f: &mut dyn Read) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Other, "config space unwritable"))
    }
}

/// Split a run of data sections into their payloads.  Also reports whether
/// the run was closed by an end-of-state marker.
pub(crate) fn split_data_sections(stream: &[u8]) -> (Vec<Vec<u8>>, bool) {
    let mut rd = Cursor::new(stream);
    let mut blocks = Vec::new();
    loop {
        match codec::read_tag(&mut rd) {
            Ok(Tag::DevDataState) => {
                let len = codec::read_data_len(&mut rd).unwrap();
                let mut block = Vec::new();
                codec::copy_data(&mut rd, &mut block, len, &mut [0u8; 64])
                    .unwrap();
                blocks.push(block);
            }
            Ok(Tag::EndOfState) => return (blocks, true),
            _ => return (blocks, false),
        }
    }
}

#[derive(Default)]
struct EngineState {
    next_id: u64,
    sections: BTreeMap<u64, (String, Arc<dyn SaveVmHandlers>)>,
    blockers: BTreeMap<u64, String>,
    listeners: BTreeMap<u64, Arc<dyn MigrationStatusListener>>,
    outgoing: Option<SaveStream>,
    refuse_blockers: bool,
}

/// Migration engine which records registrations and lets tests drive status
/// changes.
#[derive(Default)]
pub(crate) struct FakeEngine {
    state: Mutex<EngineState>,
}
impl FakeEngine {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn next_id(state: &mut EngineState) -> u64 {
        state.next_id += 1;
        state.next_id
    }

    pub(crate) fn refuse_blockers(&self) {
        self.state.lock().unwrap().refuse_blockers = true;
    }
    pub(crate) fn section_names(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.sections.values().map(|(name, _)| name.clone()).collect()
    }
    pub(crate) fn section(
        &self,
        name: &str,
    ) -> Option<Arc<dyn SaveVmHandlers>> {
        let state = self.state.lock().unwrap();
        state
            .sections
            .values()
            .find(|(n, _)| n == name)
            .map(|(_, h)| h.clone())
    }
    pub(crate) fn blockers(&self) -> Vec<String> {
        self.state.lock().unwrap().blockers.values().cloned().collect()
    }
    pub(crate) fn listener_count(&self) -> usize {
        self.state.lock().unwrap().listeners.len()
    }

    /// Begin an outgoing migration into `sink`.
    pub(crate) fn start_outgoing(&self, sink: SharedBuf) {
        self.state.lock().unwrap().outgoing = Some(SaveStream::new(sink));
    }
    pub(crate) fn outgoing_error(&self) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.outgoing.as_ref().and_then(|s| s.error().map(str::to_string))
    }

    /// Publish a status change to every listener.
    pub(crate) fn publish(&self, status: MigrationStatus) {
        let listeners: Vec<_> =
            self.state.lock().unwrap().listeners.values().cloned().collect();
        for l in listeners {
            l.status_changed(status);
        }
    }
}
impl MigrationEngine for FakeEngine {
    fn register_savevm(
        &self,
        idstr: &str,
        _instance: InstanceId,
        _version_id: u32,
        handlers: Arc<dyn SaveVmHandlers>,
    ) -> SectionId {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_id(&mut state);
        state.sections.insert(id, (idstr.to_string(), handlers));
        SectionId(id)
    }
    fn unregister_savevm(&self, id: SectionId) {
        self.state.lock().unwrap().sections.remove(&id.0);
    }
    fn add_blocker(&self, reason: &str) -> Result<BlockerId, String> {
        let mut state = self.state.lock().unwrap();
        if state.refuse_blockers {
            return Err("migration in progress".to_string());
        }
        let id = Self::next_id(&mut state);
        state.blockers.insert(id, reason.to_string());
        Ok(BlockerId(id))
    }
    fn del_blocker(&self, id: BlockerId) {
        self.state.lock().unwrap().blockers.remove(&id.0);
    }
    fn add_status_listener(
        &self,
        listener: Arc<dyn MigrationStatusListener>,
    ) -> ListenerId {
        let mut state = self.state.lock().unwrap();
        let id = Self::next_id(&mut state);
        state.listeners.insert(id, listener);
        ListenerId(id)
    }
    fn remove_status_listener(&self, id: ListenerId) {
        self.state.lock().unwrap().listeners.remove(&id.0);
    }
    fn fail_outgoing(&self, reason: &str) -> bool {
        match self.state.lock().unwrap().outgoing.as_mut() {
            Some(stream) => {
                stream.set_error(reason);
                true
            }
            None => false,
        }
    }
}
