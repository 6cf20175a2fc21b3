//! In-flight migration state on the receiver.
//!
//! An operation is created by the START handler and destroyed by END or on
//! a fatal error. The table lock only guards insertion, removal and lookup;
//! holders clone the operation handle out and release the table before
//! taking the operation's own mutex, which serializes END against in-flight
//! writes and guards the sticky error.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

use common::Fileset;
use common::device::Device;
use common::error::Error;

use crate::server::MigrationClass;

pub(crate) struct Operation {
    /// The transfer-time fileset received at START (root is the remote
    /// root, files the expanded list).
    pub fileset: Fileset,
    /// Declared byte size per file, aligned with the fileset's sorted
    /// file list.
    pub sizes: Vec<u64>,
    /// Backing device per file, recorded at START.
    pub devices: Vec<Device>,
    /// Callbacks resolved at START; kept so a concurrent deregistration
    /// cannot change which callbacks a running migration sees.
    pub class: Arc<MigrationClass>,
    pub state: tokio::sync::Mutex<OperationState>,
}

pub(crate) struct OperationState {
    /// Open destination descriptors, same order as the file list. Cleared
    /// exactly once, by END or error teardown.
    pub handles: Vec<Arc<std::fs::File>>,
    /// First write failure, surfaced at END.
    pub sticky: Option<Error>,
}

#[derive(Default)]
pub(crate) struct OperationTable {
    operations: Mutex<HashMap<Uuid, Arc<Operation>>>,
}

impl OperationTable {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<Operation>>> {
        self.operations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, op_id: Uuid, operation: Arc<Operation>) {
        self.lock().insert(op_id, operation);
    }

    pub fn lookup(&self, op_id: &Uuid) -> Option<Arc<Operation>> {
        self.lock().get(op_id).cloned()
    }

    pub fn remove(&self, op_id: &Uuid) -> Option<Arc<Operation>> {
        self.lock().remove(op_id)
    }
}
