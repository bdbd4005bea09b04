//! Session handle table.
//!
//! Maps the small integer handles given to the kernel as `fh` onto open
//! backing files. Freed slots are reused first-fit; the table only grows
//! when every slot is occupied.

use std::fs::File;
use std::os::fd::IntoRawFd;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{BackupFsError, Result};

pub type HandleId = u64;

/// Slots created up front.
pub const INITIAL_SLOTS: usize = 10;

#[derive(Debug, Default)]
enum Slot {
    #[default]
    Free,
    Occupied(Arc<File>),
}

#[derive(Debug)]
pub struct HandleTable {
    slots: Mutex<Vec<Slot>>,
    max_slots: usize,
}

impl HandleTable {
    pub fn new(max_slots: usize) -> Self {
        Self::with_capacity(INITIAL_SLOTS.min(max_slots), max_slots)
    }

    pub fn with_capacity(initial: usize, max_slots: usize) -> Self {
        let mut slots = Vec::with_capacity(initial);
        slots.resize_with(initial, Slot::default);
        HandleTable {
            slots: Mutex::new(slots),
            max_slots,
        }
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        // A panic while holding the lock cannot leave a slot half-written.
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store `file` in the first free slot, growing the table if needed.
    pub fn allocate(&self, file: File) -> Result<HandleId> {
        let mut slots = self.slots();
        let id = match slots.iter().position(|s| matches!(s, Slot::Free)) {
            Some(id) => id,
            None => {
                let len = slots.len();
                if len >= self.max_slots {
                    return Err(BackupFsError::Exhausted(len));
                }
                let grown = (len * 2).clamp(len + 1, self.max_slots);
                slots
                    .try_reserve_exact(grown - len)
                    .map_err(|_| BackupFsError::Exhausted(len))?;
                slots.resize_with(grown, Slot::default);
                debug!("handle table grown from {len} to {grown} slots");
                len
            }
        };
        slots[id] = Slot::Occupied(Arc::new(file));
        Ok(id as HandleId)
    }

    /// The backing file of a live handle.
    pub fn lookup(&self, id: HandleId) -> Result<Arc<File>> {
        let slots = self.slots();
        let slot = usize::try_from(id).ok().and_then(|i| slots.get(i));
        match slot {
            Some(Slot::Occupied(file)) => Ok(Arc::clone(file)),
            _ => Err(BackupFsError::InvalidHandle(id)),
        }
    }

    /// Free the slot of `id` and close its backing file.
    pub fn release(&self, id: HandleId) -> Result<()> {
        let taken = {
            let mut slots = self.slots();
            usize::try_from(id)
                .ok()
                .and_then(|i| slots.get_mut(i))
                .map(std::mem::take)
                .unwrap_or_default()
        };
        match taken {
            Slot::Occupied(file) => close(file),
            Slot::Free => Err(BackupFsError::InvalidHandle(id)),
        }
    }

    /// Close every open backing file, reporting the first close error.
    pub fn close_all(&self) -> Result<()> {
        let files: Vec<Arc<File>> = self
            .slots()
            .iter_mut()
            .filter_map(|slot| match std::mem::take(slot) {
                Slot::Occupied(file) => Some(file),
                Slot::Free => None,
            })
            .collect();
        let mut first_err = None;
        for file in files {
            if let Err(e) = close(file) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Number of occupied slots.
    pub fn live(&self) -> usize {
        self.slots()
            .iter()
            .filter(|s| matches!(s, Slot::Occupied(_)))
            .count()
    }

    /// Number of slots, free or occupied.
    pub fn capacity(&self) -> usize {
        self.slots().len()
    }
}

/// Close explicitly so errors from `close(2)` reach the caller.
fn close(file: Arc<File>) -> Result<()> {
    match Arc::try_unwrap(file) {
        Ok(file) => {
            nix::unistd::close(file.into_raw_fd())?;
            Ok(())
        }
        Err(_) => {
            // A write on this handle is still in flight; the last clone closes it.
            warn!("backing file released while still in use");
            Ok(())
        }
    }
}
