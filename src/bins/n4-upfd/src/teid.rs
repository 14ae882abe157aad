//! F-TEID Allocator
//!
//! Closed pool of TEIDs over `[1, N]`. Every allocated TEID has exactly one
//! owner, identified by the local SEID of the session and the PDR ID.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use crate::config::ConfigError;
use crate::error::{UpfError, UpfResult};

/// Owner of a TEID allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TeidOwner {
    pub local_seid: u64,
    pub pdr_id: u16,
}

impl TeidOwner {
    pub fn new(local_seid: u64, pdr_id: u16) -> Self {
        Self { local_seid, pdr_id }
    }
}

/// Free TEIDs are `released ∪ [next_fresh, capacity]`; every released value
/// is below `next_fresh`, so the lowest free TEID is found without
/// materializing the whole range.
#[derive(Debug)]
struct TeidPool {
    released: BTreeSet<u32>,
    next_fresh: u64,
    busy: HashMap<TeidOwner, u32>,
}

impl TeidPool {
    fn take_lowest(&mut self, capacity: u32) -> Option<u32> {
        if let Some(teid) = self.released.pop_first() {
            return Some(teid);
        }
        if self.next_fresh > u64::from(capacity) {
            return None;
        }
        let teid = self.next_fresh as u32;
        self.next_fresh += 1;
        Some(teid)
    }

    fn put_back(&mut self, teid: u32) {
        self.released.insert(teid);
    }

    fn free_count(&self, capacity: u32) -> usize {
        self.released.len() + (u64::from(capacity) + 1 - self.next_fresh) as usize
    }
}

/// Thread-safe TEID allocator
#[derive(Debug)]
pub struct TeidAllocator {
    capacity: u32,
    pool: Mutex<TeidPool>,
}

impl TeidAllocator {
    pub fn new(capacity: u32) -> Result<Self, ConfigError> {
        if capacity == 0 || capacity == u32::MAX {
            return Err(ConfigError::ValidationError(format!(
                "TEID pool size must be in [1, {}], got {capacity}",
                u32::MAX - 1
            )));
        }
        Ok(Self {
            capacity,
            pool: Mutex::new(TeidPool {
                released: BTreeSet::new(),
                next_fresh: 1,
                busy: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> UpfResult<std::sync::MutexGuard<'_, TeidPool>> {
        self.pool
            .lock()
            .map_err(|_| UpfError::Internal("TEID pool lock poisoned".into()))
    }

    /// Allocate the lowest free TEID for `owner`
    pub fn allocate(&self, owner: TeidOwner) -> UpfResult<u32> {
        let mut pool = self.lock()?;
        if let Some(teid) = pool.busy.get(&owner) {
            return Err(UpfError::AlreadyAllocated(*teid));
        }
        let teid = pool
            .take_lowest(self.capacity)
            .ok_or(UpfError::ResourceExhausted)?;
        pool.busy.insert(owner, teid);
        log::debug!(
            "Allocated TEID {teid:#x} for SEID {:#x} PDR {}",
            owner.local_seid,
            owner.pdr_id
        );
        Ok(teid)
    }

    /// Return the TEID held by `owner` to the pool. Releasing twice is a no-op.
    pub fn release(&self, owner: TeidOwner) -> UpfResult<Option<u32>> {
        let mut pool = self.lock()?;
        let released = pool.busy.remove(&owner);
        if let Some(teid) = released {
            pool.put_back(teid);
            log::debug!(
                "Released TEID {teid:#x} of SEID {:#x} PDR {}",
                owner.local_seid,
                owner.pdr_id
            );
        }
        Ok(released)
    }

    /// Release every TEID owned by PDRs of one session
    pub fn release_session(&self, local_seid: u64) -> UpfResult<usize> {
        let mut pool = self.lock()?;
        let owners: Vec<TeidOwner> = pool
            .busy
            .keys()
            .filter(|owner| owner.local_seid == local_seid)
            .copied()
            .collect();
        for owner in &owners {
            if let Some(teid) = pool.busy.remove(owner) {
                pool.put_back(teid);
            }
        }
        Ok(owners.len())
    }

    /// Move the allocation held by `from` to `to`; the TEID stays busy
    pub fn transfer(&self, from: TeidOwner, to: TeidOwner) -> UpfResult<Option<u32>> {
        let mut pool = self.lock()?;
        if let Some(teid) = pool.busy.get(&to) {
            return Err(UpfError::AlreadyAllocated(*teid));
        }
        let moved = pool.busy.remove(&from);
        if let Some(teid) = moved {
            pool.busy.insert(to, teid);
            log::debug!(
                "TEID {teid:#x} of SEID {:#x} moved from PDR {} to PDR {}",
                from.local_seid,
                from.pdr_id,
                to.pdr_id
            );
        }
        Ok(moved)
    }

    pub fn owner_of(&self, teid: u32) -> UpfResult<Option<TeidOwner>> {
        let pool = self.lock()?;
        Ok(pool
            .busy
            .iter()
            .find(|(_, allocated)| **allocated == teid)
            .map(|(owner, _)| *owner))
    }

    pub fn free_count(&self) -> UpfResult<usize> {
        Ok(self.lock()?.free_count(self.capacity))
    }

    pub fn busy_count(&self) -> UpfResult<usize> {
        Ok(self.lock()?.busy.len())
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}
