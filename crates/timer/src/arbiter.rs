//! Per-group run lock. Devices sharing a group (water pressure, a common
//! transformer) must never run at the same time.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct GroupArbiter {
    locks: HashMap<i64, i64>, // group_id -> device_id
}

impl GroupArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the group lock for `device_id`. Re-entrant for the current holder;
    /// refused while another device holds it.
    pub fn try_acquire(&mut self, group_id: i64, device_id: i64) -> bool {
        match self.locks.get(&group_id) {
            Some(&holder) if holder != device_id => false,
            _ => {
                self.locks.insert(group_id, device_id);
                true
            }
        }
    }

    /// Drop the lock if (and only if) `device_id` holds it.
    pub fn release(&mut self, group_id: i64, device_id: i64) {
        if self.locks.get(&group_id) == Some(&device_id) {
            self.locks.remove(&group_id);
        }
    }

    pub fn holder(&self, group_id: i64) -> Option<i64> {
        self.locks.get(&group_id).copied()
    }
}
