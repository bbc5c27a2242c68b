// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Attaching a passthrough device to the migration machinery.
//!
//! [`VfioMigration::probe`] decides whether the device can take part in
//! migration at all.  If it can, its save/load section, run-state handler and
//! status listener are registered; if not, a blocker is installed so that
//! migrations are refused while the device is attached.
//! [`VfioMigration::finalize`] unwinds whichever of the two took place.

use std::sync::{Arc, Mutex};

use slog::{debug, error, info};

use crate::codec::DeviceConfigHooks;
use crate::device::{DeviceStateMachine, DEFAULT_DATA_BUFFER_SIZE};
use crate::engine::{
    BlockerId, InstanceId, ListenerId, MigrationEngine, MigrationStatus,
    MigrationStatusListener, SectionId,
};
use crate::error::MigrateError;
use crate::notifier::{
    RunState, VmStateEntryId, VmStateHandler, VmStateNotifier,
};
use crate::ops::DeviceStateOps;
use crate::precopy::PrecopyHandlers;
use crate::state::{MigrationFlags, MigrationState};
use crate::stats::TransferStats;
use crate::topology::{tree_depth, DeviceNode};

/// Version of the device section in the migration stream.
pub const VFIO_MIG_VERSION: u32 = 1;

/// Blocker reason installed for devices which cannot be migrated.
pub const MIGRATION_BLOCKER_REASON: &str =
    "VFIO device doesn't support migration";

/// Per-device migration settings.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MigrationOpts {
    pub enable_migration: bool,
    pub data_buffer_size: usize,
}

impl Default for MigrationOpts {
    fn default() -> Self {
        Self {
            enable_migration: true,
            data_buffer_size: DEFAULT_DATA_BUFFER_SIZE,
        }
    }
}

/// Process-wide collaborators shared by every migrating device.
#[derive(Clone)]
pub struct MigrationHost {
    pub engine: Arc<dyn MigrationEngine>,
    pub vmstate: Arc<VmStateNotifier>,
    pub stats: Arc<TransferStats>,
}

/// Name of the migration section for a device.
pub fn section_name(node: &dyn DeviceNode) -> String {
    match node.migration_path() {
        Some(path) => format!("{path}/vfio"),
        None => "vfio".to_string(),
    }
}

struct Active {
    sm: Arc<DeviceStateMachine>,
    section: SectionId,
    vmstate: VmStateEntryId,
    listener: ListenerId,
}

enum Registration {
    Idle,
    Blocked(BlockerId),
    Active(Active),
}

/// Migration support for one passthrough device.
pub struct VfioMigration {
    name: String,
    host: MigrationHost,
    ops: Arc<dyn DeviceStateOps>,
    node: Arc<dyn DeviceNode>,
    hooks: Option<Arc<dyn DeviceConfigHooks>>,
    opts: MigrationOpts,
    reg: Mutex<Registration>,
    /// Parent of the loggers handed to the state machine and handlers, which
    /// add the device name themselves.
    component_log: slog::Logger,
    log: slog::Logger,
}

impl VfioMigration {
    pub fn new(
        name: &str,
        host: &MigrationHost,
        ops: Arc<dyn DeviceStateOps>,
        node: Arc<dyn DeviceNode>,
        hooks: Option<Arc<dyn DeviceConfigHooks>>,
        opts: MigrationOpts,
        log: &slog::Logger,
    ) -> Self {
        let component_log =
            log.new(slog::o!("component" => "vfio-migration"));
        let log = component_log.new(slog::o!("dev" => name.to_string()));
        Self {
            name: name.to_string(),
            host: host.clone(),
            ops,
            node,
            hooks,
            opts,
            reg: Mutex::new(Registration::Idle),
            component_log,
            log,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Is migration currently blocked on account of this device?
    pub fn is_blocked(&self) -> bool {
        matches!(*self.reg.lock().unwrap(), Registration::Blocked(_))
    }

    /// The device's state machine, if migration is set up.
    pub fn state_machine(&self) -> Option<Arc<DeviceStateMachine>> {
        match &*self.reg.lock().unwrap() {
            Registration::Active(a) => Some(a.sm.clone()),
            _ => None,
        }
    }

    /// Migration state of the device, if migration is set up.
    pub fn state(&self) -> Option<MigrationState> {
        self.state_machine().map(|sm| sm.state())
    }

    fn check_support(&self) -> Result<(), MigrateError> {
        if !self.opts.enable_migration {
            return Err(MigrateError::NotSupported);
        }
        if self.opts.data_buffer_size == 0 {
            return Err(MigrateError::InvalidBufferSize);
        }
        let flags =
            self.ops.migration_flags().map_err(MigrateError::Capability)?;
        if !flags.contains(MigrationFlags::STOP_COPY) {
            return Err(MigrateError::NotSupported);
        }
        Ok(())
    }

    /// Set up migration for the device, or block migration if the device
    /// cannot support it.
    ///
    /// An unsupported device yields an error once the blocker is in place;
    /// it is not a reason to fail device attachment.  Probing a device which
    /// was already probed repeats the earlier outcome: a blocked device stays
    /// blocked until [`Self::finalize`], and reports why it is unsupported.
    pub fn probe(&self) -> Result<(), MigrateError> {
        let mut reg = self.reg.lock().unwrap();
        match &*reg {
            Registration::Idle => {}
            Registration::Blocked(_) => {
                return Err(match self.check_support() {
                    Err(e) => e,
                    Ok(()) => MigrateError::NotSupported,
                });
            }
            Registration::Active(_) => return Ok(()),
        }

        if let Err(e) = self.check_support() {
            info!(self.log, "migration not supported"; "reason" => %e);
            let id = self
                .host
                .engine
                .add_blocker(MIGRATION_BLOCKER_REASON)
                .map_err(MigrateError::Blocker)?;
            *reg = Registration::Blocked(id);
            return Err(e);
        }

        let sm = Arc::new(DeviceStateMachine::new(
            &self.name,
            self.ops.clone(),
            self.opts.data_buffer_size,
            &self.component_log,
        ));

        let handlers = Arc::new(PrecopyHandlers::new(
            sm.clone(),
            self.hooks.clone(),
            self.host.stats.clone(),
            &self.component_log,
        ));
        let idstr = section_name(self.node.as_ref());
        let section = self.host.engine.register_savevm(
            &idstr,
            InstanceId::Any,
            VFIO_MIG_VERSION,
            handlers,
        );

        let depth = tree_depth(self.node.as_ref());
        let vmstate = {
            let sm = sm.clone();
            let engine = self.host.engine.clone();
            let log = self.log.clone();
            self.host.vmstate.register(
                depth,
                VmStateHandler::new(move |running, state| {
                    vmstate_change(&sm, engine.as_ref(), &log, running, state)
                }),
            )
        };

        let listener =
            self.host.engine.add_status_listener(Arc::new(StatusListener {
                sm: sm.clone(),
                stats: self.host.stats.clone(),
                log: self.log.clone(),
            }));

        info!(self.log, "migration probed";
            "section" => idstr, "priority" => depth,
            "buffer_size" => self.opts.data_buffer_size);
        *reg = Registration::Active(Active { sm, section, vmstate, listener });
        Ok(())
    }

    /// Undo whatever [`Self::probe`] set up.  Calling it again is a no-op.
    pub fn finalize(&self) {
        let reg = std::mem::replace(
            &mut *self.reg.lock().unwrap(),
            Registration::Idle,
        );
        match reg {
            Registration::Idle => {}
            Registration::Blocked(id) => {
                self.host.engine.del_blocker(id);
                debug!(self.log, "migration blocker removed");
            }
            Registration::Active(a) => {
                self.host.engine.remove_status_listener(a.listener);
                self.host.vmstate.unregister(a.vmstate);
                self.host.engine.unregister_savevm(a.section);
                a.sm.close_data_channel();
                debug!(self.log, "migration finalized");
            }
        }
    }
}

impl Drop for VfioMigration {
    fn drop(&mut self) {
        self.finalize();
    }
}

fn vmstate_change(
    sm: &DeviceStateMachine,
    engine: &dyn MigrationEngine,
    log: &slog::Logger,
    running: bool,
    state: RunState,
) {
    let target =
        if running { MigrationState::Running } else { MigrationState::Stop };

    match sm.request_transition(target, MigrationState::Error) {
        Ok(()) => {
            debug!(log, "vmstate_change";
                "running" => running, "reason" => %state,
                "dev_state" => %sm.state());
        }
        Err(e) if e.is_fatal() => sm.halt(&e),
        Err(e) => {
            // There is no error path back through the run-state notifier, so
            // the failure is pushed onto the outgoing stream instead.
            let reason =
                format!("{}: failed to change device state: {e}", sm.name());
            let marked = engine.fail_outgoing(&reason);
            error!(log, "failed to change device state";
                "running" => running, "reason" => %state,
                "error" => %e, "stream_failed" => marked);
        }
    }
}

struct StatusListener {
    sm: Arc<DeviceStateMachine>,
    stats: Arc<TransferStats>,
    log: slog::Logger,
}

impl MigrationStatusListener for StatusListener {
    fn status_changed(&self, status: MigrationStatus) {
        debug!(self.log, "migration_state_notifier"; "status" => %status);
        if !status.is_abandoned() {
            return;
        }

        self.stats.reset();
        match self
            .sm
            .request_transition(MigrationState::Running, MigrationState::Error)
        {
            Ok(()) => {}
            Err(e) if e.is_fatal() => self.sm.halt(&e),
            Err(e) => {
                error!(self.log, "failed to resume device after migration";
                    "status" => %status, "error" => %e);
            }
        }
    }
}
