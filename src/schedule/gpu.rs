//! GPU slot admission.
//!
//! Each device accepts at most `per_device` concurrent holders. A task asks
//! for a slot right before a GPU-bound stage and releases it (by dropping the
//! lease) right after, so CPU-bound work never occupies a device.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::trace;

#[derive(Debug)]
pub struct GpuSlots {
    active: Mutex<Vec<usize>>,
    per_device: usize,
    released: Condvar,
}

/// Exclusive use of one slot on `device` until dropped.
#[derive(Debug)]
pub struct GpuLease<'a> {
    slots: &'a GpuSlots,
    device: usize,
}

impl GpuSlots {
    pub fn new(devices: usize, per_device: usize) -> Self {
        Self {
            active: Mutex::new(vec![0; devices.max(1)]),
            per_device: per_device.max(1),
            released: Condvar::new(),
        }
    }

    pub fn devices(&self) -> usize {
        self.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.devices() * self.per_device
    }

    /// Tasks currently holding a slot.
    pub fn in_use(&self) -> usize {
        self.lock().iter().sum()
    }

    /// Block until a slot is free, preferring the least loaded device.
    pub fn acquire(&self) -> GpuLease<'_> {
        let mut active = self.lock();
        loop {
            let candidate = active
                .iter()
                .enumerate()
                .filter(|(_, n)| **n < self.per_device)
                .min_by_key(|(id, n)| (**n, *id))
                .map(|(id, _)| id);

            if let Some(device) = candidate {
                active[device] += 1;
                trace!(device, holders = active[device], "gpu slot acquired");
                return GpuLease { slots: self, device };
            }
            active = self
                .released
                .wait(active)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<usize>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl GpuLease<'_> {
    pub fn device(&self) -> usize {
        self.device
    }
}

impl Drop for GpuLease<'_> {
    fn drop(&mut self) {
        let mut active = self.slots.lock();
        active[self.device] = active[self.device].saturating_sub(1);
        drop(active);
        self.slots.released.notify_one();
    }
}
