//! Handle registry. Maps guest-visible `u64` handles to checked-out
//! connections.
//!
//! Handles are `(generation << 24) | slot`. Slots are recycled, generations
//! never are: every insert takes the next value of a monotonic counter, so
//! a handle kept after `close()` can never address a later connection that
//! happens to occupy the same slot.

use warp_core::DbProxyError;

use super::{ConnCell, PoolKey};

/// Identifies the guest instance a handle was issued to.
pub type InstanceId = u64;

const SLOT_BITS: u32 = 24;
const SLOT_MASK: u64 = (1 << SLOT_BITS) - 1;
const MAX_SLOTS: usize = 1 << SLOT_BITS;
const MAX_GENERATION: u64 = (1 << (64 - SLOT_BITS)) - 1;

/// A live checkout.
#[derive(Debug)]
pub struct Entry {
    pub generation: u64,
    pub owner: InstanceId,
    pub key: PoolKey,
    pub conn: ConnCell,
}

#[derive(Debug)]
enum Slot {
    Vacant,
    Occupied(Entry),
}

#[derive(Debug)]
pub struct HandleRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    next_generation: u64,
    live: usize,
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn encode(slot: u32, generation: u64) -> u64 {
    (generation << SLOT_BITS) | u64::from(slot)
}

fn decode(handle: u64) -> (usize, u64) {
    ((handle & SLOT_MASK) as usize, handle >> SLOT_BITS)
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            // Generation 0 is never issued, so handle 0 is always invalid.
            next_generation: 1,
            live: 0,
        }
    }

    /// Number of handles currently open.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Register a checkout and mint its handle.
    pub fn insert(
        &mut self,
        owner: InstanceId,
        key: PoolKey,
        conn: ConnCell,
    ) -> Result<u64, DbProxyError> {
        if self.next_generation > MAX_GENERATION {
            return Err(DbProxyError::PoolExhausted(
                "handle generations exhausted".into(),
            ));
        }
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                if self.slots.len() >= MAX_SLOTS {
                    return Err(DbProxyError::PoolExhausted(
                        "handle table is full".into(),
                    ));
                }
                self.slots.push(Slot::Vacant);
                (self.slots.len() - 1) as u32
            }
        };

        let generation = self.next_generation;
        self.next_generation += 1;
        self.slots[slot as usize] = Slot::Occupied(Entry {
            generation,
            owner,
            key,
            conn,
        });
        self.live += 1;
        Ok(encode(slot, generation))
    }

    /// Look up a live handle.
    pub fn get(&self, handle: u64) -> Result<&Entry, DbProxyError> {
        let (slot, generation) = decode(handle);
        match self.slots.get(slot) {
            Some(Slot::Occupied(entry)) if entry.generation == generation => Ok(entry),
            _ => Err(self.dead_handle(handle)),
        }
    }

    /// Remove a live handle. A second remove of the same handle fails.
    pub fn remove(&mut self, handle: u64) -> Result<Entry, DbProxyError> {
        let (slot, generation) = decode(handle);
        let live = matches!(
            self.slots.get(slot),
            Some(Slot::Occupied(entry)) if entry.generation == generation
        );
        if !live {
            return Err(self.dead_handle(handle));
        }
        self.vacate(slot).ok_or_else(|| self.dead_handle(handle))
    }

    /// Remove every handle owned by `owner`, returning them with their
    /// handle values.
    pub fn drain_owner(&mut self, owner: InstanceId) -> Vec<(u64, Entry)> {
        let slots: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Slot::Occupied(entry) if entry.owner == owner => Some(i),
                _ => None,
            })
            .collect();
        slots
            .into_iter()
            .filter_map(|slot| {
                let entry = self.vacate(slot)?;
                Some((encode(slot as u32, entry.generation), entry))
            })
            .collect()
    }

    /// Remove every live handle.
    pub fn drain_all(&mut self) -> Vec<(u64, Entry)> {
        let slots: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| matches!(s, Slot::Occupied(_)).then_some(i))
            .collect();
        slots
            .into_iter()
            .filter_map(|slot| {
                let entry = self.vacate(slot)?;
                Some((encode(slot as u32, entry.generation), entry))
            })
            .collect()
    }

    /// Handles currently open for `owner`.
    pub fn count_owned_by(&self, owner: InstanceId) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s, Slot::Occupied(entry) if entry.owner == owner))
            .count()
    }

    fn vacate(&mut self, slot: usize) -> Option<Entry> {
        match std::mem::replace(self.slots.get_mut(slot)?, Slot::Vacant) {
            Slot::Occupied(entry) => {
                self.free.push(slot as u32);
                self.live -= 1;
                Some(entry)
            }
            Slot::Vacant => None,
        }
    }

    /// A handle that was issued once and has since been closed reports
    /// `Closed`; anything never issued reports `InvalidHandle`.
    fn dead_handle(&self, handle: u64) -> DbProxyError {
        let (slot, generation) = decode(handle);
        if generation != 0 && generation < self.next_generation && slot < self.slots.len() {
            DbProxyError::Closed(format!("handle {handle} is closed"))
        } else {
            DbProxyError::InvalidHandle(handle)
        }
    }
}
