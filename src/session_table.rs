use crate::timer::TimerRegistry;
use tracing::trace;

/// Free-list terminator / "not on the free list" marker.
pub(crate) const NO_NEXT_FREE: u32 = u32::MAX;

/// What the session table needs from its entries. Whether a slot is in use is tracked
///  through `last_activity_time`: a slot with activity 0 is either free or freshly
///  acquired, and the sweep leaves both alone.
pub(crate) trait TableEntry {
    fn next_free(&self) -> u32;
    fn set_next_free(&mut self, next: u32);
    fn last_activity_time(&self) -> u64;

    /// Release everything and reset to the reusable state. Returns false if the entry
    ///  cannot be evicted right now (e.g. RPCs still bound to it).
    fn try_expire(&mut self, timers: &mut TimerRegistry) -> bool;
}

/// Bounded, indexable pool of sessions. Slots are allocated once and recycled through
///  an intrusive free list; the peer-visible session hint is simply the slot index.
pub(crate) struct SessionTable<T> {
    slots: Vec<T>,
    first_free: u32,
    max_sessions: u32,
    /// Where the amortized expiry sweep resumes.
    expire_cursor: u32,
}

impl<T: TableEntry> SessionTable<T> {
    pub fn new(max_sessions: u32) -> SessionTable<T> {
        SessionTable {
            slots: Vec::new(),
            first_free: NO_NEXT_FREE,
            max_sessions,
            expire_cursor: 0,
        }
    }

    pub fn len(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Bounds-checked lookup by (peer-supplied) hint. The caller still has to verify
    ///  the session token.
    pub fn get(&self, hint: u32) -> Option<&T> {
        self.slots.get(hint as usize)
    }

    pub fn get_mut(&mut self, hint: u32) -> Option<&mut T> {
        self.slots.get_mut(hint as usize)
    }

    /// Hand out an idle slot: recycle the free list, or grow up to `max_sessions`.
    pub fn acquire(&mut self, make: impl FnOnce(u32) -> T) -> Option<(u32, &mut T)> {
        if self.first_free != NO_NEXT_FREE {
            let id = self.first_free;
            let slot = &mut self.slots[id as usize];
            self.first_free = slot.next_free();
            slot.set_next_free(NO_NEXT_FREE);
            trace!("reusing session slot {}", id);
            return Some((id, slot));
        }
        if self.len() < self.max_sessions {
            let id = self.len();
            self.slots.push(make(id));
            trace!("growing session table to {} slots", id + 1);
            return Some((id, &mut self.slots[id as usize]));
        }
        None
    }

    /// Sweep a bounded number of slots, expiring those inactive for at least
    ///  `session_timeout` and returning them to the free list. Amortized: each call
    ///  resumes where the previous one stopped.
    pub fn expire(
        &mut self,
        now: u64,
        session_timeout: u64,
        slots_to_check: u32,
        timers: &mut TimerRegistry,
    ) {
        if self.slots.is_empty() {
            return;
        }

        for _ in 0..slots_to_check.min(self.len()) {
            let i = self.expire_cursor % self.len();
            self.expire_cursor = (i + 1) % self.len();

            let slot = &mut self.slots[i as usize];
            let last_activity = slot.last_activity_time();
            // activity 0 marks slots that are free or not yet started - nothing to do
            if last_activity == 0 {
                continue;
            }
            if now.saturating_sub(last_activity) < session_timeout {
                continue;
            }
            if slot.try_expire(timers) {
                trace!("expired session slot {}", i);
                slot.set_next_free(self.first_free);
                self.first_free = i;
            }
        }
    }
}
