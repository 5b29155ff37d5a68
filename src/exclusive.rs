//! Mutual exclusion between the long-running operations.
//!
//! Zero-offset calibration, setpoint seeking and the minimum search each need the
//! stage and/or the power sensor for their whole duration. At most one of them may be
//! active; a second request is refused with [`PolarizerError::Busy`] instead of queueing.

use crate::error::{AppResult, PolarizerError};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Long-running operations that need exclusive access to the devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Background zero-offset averaging
    Calibration,
    /// Proportional correction toward the setpoint
    SetpointSeek,
    /// Blocking angular sweep for the transmission minimum
    MinimumSearch,
}

impl Operation {
    /// Whether the operation commands the rotation stage.
    pub fn moves_stage(self) -> bool {
        matches!(self, Operation::SetpointSeek | Operation::MinimumSearch)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Calibration => "zero-offset calibration",
            Operation::SetpointSeek => "setpoint seek",
            Operation::MinimumSearch => "minimum search",
        };
        f.write_str(name)
    }
}

/// Shared slot recording which operation, if any, is running.
#[derive(Debug, Clone, Default)]
pub struct OperationLock {
    active: Arc<Mutex<Option<Operation>>>,
}

impl OperationLock {
    /// Create an empty lock.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Operation>> {
        // The slot only holds a Copy value, so a poisoned lock is still consistent.
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the devices for `operation`.
    ///
    /// # Errors
    /// Returns `Busy` when another operation is already running.
    pub fn try_acquire(&self, operation: Operation) -> AppResult<OperationGuard> {
        let mut slot = self.slot();
        if let Some(active) = *slot {
            return Err(PolarizerError::Busy {
                requested: operation,
                active,
            });
        }
        *slot = Some(operation);
        debug!(%operation, "operation started");
        Ok(OperationGuard {
            lock: self.clone(),
            operation,
        })
    }

    /// Operation currently holding the devices.
    pub fn active(&self) -> Option<Operation> {
        *self.slot()
    }

    /// Refuse manual stage moves while an operation owns the stage.
    pub fn ensure_stage_free(&self) -> AppResult<()> {
        match self.active() {
            Some(active) if active.moves_stage() => Err(PolarizerError::StageBusy(active)),
            _ => Ok(()),
        }
    }
}

/// Releases the operation slot when dropped.
#[derive(Debug)]
pub struct OperationGuard {
    lock: OperationLock,
    operation: Operation,
}

impl OperationGuard {
    /// Operation this guard holds.
    pub fn operation(&self) -> Operation {
        self.operation
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let mut slot = self.lock.slot();
        if *slot == Some(self.operation) {
            *slot = None;
        }
        debug!(operation = %self.operation, "operation finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_operation_is_refused() {
        let lock = OperationLock::new();
        let _calibration = lock.try_acquire(Operation::Calibration).unwrap();

        match lock.try_acquire(Operation::MinimumSearch) {
            Err(PolarizerError::Busy { requested, active }) => {
                assert_eq!(requested, Operation::MinimumSearch);
                assert_eq!(active, Operation::Calibration);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn dropping_guard_frees_slot() {
        let lock = OperationLock::new();
        {
            let guard = lock.try_acquire(Operation::SetpointSeek).unwrap();
            assert_eq!(guard.operation(), Operation::SetpointSeek);
            assert_eq!(lock.active(), Some(Operation::SetpointSeek));
        }
        assert_eq!(lock.active(), None);
        assert!(lock.try_acquire(Operation::MinimumSearch).is_ok());
    }

    #[test]
    fn calibration_does_not_block_manual_moves() {
        let lock = OperationLock::new();
        let _guard = lock.try_acquire(Operation::Calibration).unwrap();
        assert!(lock.ensure_stage_free().is_ok());
    }

    #[test]
    fn sweep_blocks_manual_moves() {
        let lock = OperationLock::new();
        let _guard = lock.try_acquire(Operation::MinimumSearch).unwrap();
        assert!(matches!(
            lock.ensure_stage_free(),
            Err(PolarizerError::StageBusy(Operation::MinimumSearch))
        ));
    }
}
