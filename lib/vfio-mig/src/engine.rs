// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What a passthrough device needs from the generic migration engine.
//!
//! The engine owns the stream transport and the overall migration lifecycle.
//! Devices plug into it by registering a set of save/load handlers, by
//! installing blockers when they cannot be migrated, and by listening for
//! changes in the migration status.

use std::io::Read;
use std::sync::Arc;

use strum::Display;

use crate::error::MigrateError;
use crate::stream::SaveStream;

/// Instance number of a registered section.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InstanceId {
    /// Let the engine pick a free instance number.
    Any,
    Fixed(u32),
}

/// Overall status of a migration, as published by the engine.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum MigrationStatus {
    None,
    Setup,
    Cancelling,
    Cancelled,
    Active,
    PostcopyActive,
    Device,
    Completed,
    Failed,
}

impl MigrationStatus {
    /// Has the migration been (or is it being) abandoned?
    pub fn is_abandoned(self) -> bool {
        matches!(
            self,
            MigrationStatus::Cancelling
                | MigrationStatus::Cancelled
                | MigrationStatus::Failed
        )
    }
}

/// Save/load handlers registered for one migration section.
///
/// The engine calls these serially for a given section.  A device which
/// cannot be brought back to any known state halts the process instead of
/// returning an error.
pub trait SaveVmHandlers: Send + Sync {
    /// Called as the outgoing migration starts.
    fn save_setup(&self, f: &mut SaveStream) -> Result<(), MigrateError>;

    /// Called once the outgoing migration is done, successful or not.
    fn save_cleanup(&self);

    /// Called with the VM stopped, to emit the remaining state.
    fn save_live_complete_precopy(
        &self,
        f: &mut SaveStream,
    ) -> Result<(), MigrateError>;

    /// Emit non-iterative state.  Failures are recorded on the stream.
    fn save_state(&self, f: &mut SaveStream);

    fn load_setup(&self) -> Result<(), MigrateError>;

    fn load_cleanup(&self) -> Result<(), MigrateError>;

    /// Consume one section of incoming state.
    fn load_state(
        &self,
        f: &mut dyn Read,
        version_id: u32,
    ) -> Result<(), MigrateError>;
}

/// Listener for migration status changes.
pub trait MigrationStatusListener: Send + Sync {
    fn status_changed(&self, status: MigrationStatus);
}

/// Handle for a registered section.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct SectionId(pub u64);

/// Handle for an installed migration blocker.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct BlockerId(pub u64);

/// Handle for a registered status listener.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ListenerId(pub u64);

/// The generic migration engine.
pub trait MigrationEngine: Send + Sync {
    /// Register the handlers for a section named `idstr`.
    fn register_savevm(
        &self,
        idstr: &str,
        instance: InstanceId,
        version_id: u32,
        handlers: Arc<dyn SaveVmHandlers>,
    ) -> SectionId;

    fn unregister_savevm(&self, id: SectionId);

    /// Refuse migrations for as long as the blocker is installed.
    ///
    /// Fails if a migration is already under way.
    fn add_blocker(&self, reason: &str) -> Result<BlockerId, String>;

    fn del_blocker(&self, id: BlockerId);

    fn add_status_listener(
        &self,
        listener: Arc<dyn MigrationStatusListener>,
    ) -> ListenerId;

    fn remove_status_listener(&self, id: ListenerId);

    /// Mark the outgoing stream of an in-flight migration as failed.
    ///
    /// Returns `false` if there is no outgoing stream.
    fn fail_outgoing(&self, reason: &str) -> bool;
}
