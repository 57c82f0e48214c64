//! Bounded table of begun operations, keyed by handle.

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    error::KmResult,
    km_err,
    operation::Operation,
    types::OperationHandle,
};

enum Slot {
    Idle(Operation),
    /// Taken out by a caller that is running it.
    Busy,
}

/// Operations are taken out of the table while they run, so the lock is
/// never held across cryptographic work. A taken operation still counts
/// against the capacity until it is restored or removed.
pub struct OperationTable {
    max_operations: usize,
    slots: Mutex<HashMap<OperationHandle, Slot>>,
}

impl OperationTable {
    pub fn new(max_operations: usize) -> Self {
        Self {
            max_operations,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max_operations
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_operations
    }

    /// Stores a begun operation under its handle.
    pub fn add(&self, operation: Operation) -> KmResult<OperationHandle> {
        let handle = operation
            .operation_handle()
            .ok_or_else(|| km_err!(InvalidOperationHandle, "operation has not begun"))?;
        let mut slots = self.slots.lock();
        if slots.len() >= self.max_operations {
            warn!("operation table full at {} entries", slots.len());
            return Err(km_err!(
                TooManyOperations,
                "{} operations already in flight",
                slots.len()
            ));
        }
        if slots.contains_key(&handle) {
            return Err(km_err!(InvalidOperationHandle, "handle {handle} already in use"));
        }
        slots.insert(handle, Slot::Idle(operation));
        debug!("operation {handle} added");
        Ok(handle)
    }

    /// Checks an operation out for exclusive use.
    pub fn take(&self, handle: OperationHandle) -> KmResult<Operation> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(&handle)
            .ok_or_else(|| km_err!(InvalidOperationHandle, "unknown operation {handle}"))?;
        match std::mem::replace(slot, Slot::Busy) {
            Slot::Idle(operation) => Ok(operation),
            Slot::Busy => Err(km_err!(InvalidOperationHandle, "operation {handle} is in use")),
        }
    }

    /// Returns a taken operation to the table.
    pub fn restore(&self, operation: Operation) -> KmResult<()> {
        let handle = operation
            .operation_handle()
            .ok_or_else(|| km_err!(InvalidOperationHandle, "operation has not begun"))?;
        let mut slots = self.slots.lock();
        match slots.get_mut(&handle) {
            Some(slot) if matches!(slot, Slot::Busy) => {
                *slot = Slot::Idle(operation);
                Ok(())
            }
            _ => Err(km_err!(InvalidOperationHandle, "operation {handle} was not taken")),
        }
    }

    /// Drops the entry for `handle`, whether idle or taken.
    pub fn remove(&self, handle: OperationHandle) -> bool {
        let removed = self.slots.lock().remove(&handle).is_some();
        if removed {
            debug!("operation {handle} removed");
        }
        removed
    }
}
