//! Counting, task-tagged device lock.
//!
//! One lock serializes every operation that touches shared device state.
//! The owning task may re-acquire freely (the depth counter grows instead
//! of blocking), which lets a high-level operation call into lower-level
//! ones without deadlocking itself. A second task blocks until the owner
//! drains its count to zero.

use nandfs_error::{FlashError, Result};
use parking_lot::{Condvar, Mutex};
use std::thread::{self, ThreadId};

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
}

/// Reentrant device lock keyed by calling task identity.
#[derive(Debug, Default)]
pub struct DeviceLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl DeviceLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire, blocking while another task holds the lock. Reentrant
    /// from the owning task.
    pub fn acquire(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                Some(_) => self.released.wait(&mut state),
            }
        }
    }

    /// Release one level of ownership.
    ///
    /// Release by a task that is not the current holder is a programming
    /// defect and surfaces as [`FlashError::LockMisuse`].
    pub fn release(&self) -> Result<()> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        match state.owner {
            Some(owner) if owner == me => {
                state.depth -= 1;
                if state.depth == 0 {
                    state.owner = None;
                    drop(state);
                    self.released.notify_one();
                }
                Ok(())
            }
            _ => Err(FlashError::LockMisuse("release from non-owning task")),
        }
    }

    /// RAII acquisition; the guard releases on drop.
    pub fn lock(&self) -> DeviceGuard<'_> {
        self.acquire();
        DeviceGuard { lock: self }
    }

    /// Current re-entry depth as seen by the calling task (0 when the
    /// caller does not hold the lock).
    #[must_use]
    pub fn hold_depth(&self) -> u32 {
        let state = self.state.lock();
        if state.owner == Some(thread::current().id()) {
            state.depth
        } else {
            0
        }
    }
}

/// Guard for one level of [`DeviceLock`] ownership.
#[derive(Debug)]
pub struct DeviceGuard<'a> {
    lock: &'a DeviceLock,
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        // Guards only exist on the owning task, so this release cannot
        // misuse; log rather than panic in a destructor if it ever does.
        if let Err(err) = self.lock.release() {
            tracing::error!(%err, "device lock guard dropped by non-owner");
        }
    }
}
