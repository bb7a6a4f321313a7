use rustc_hash::FxHashMap;

/// Identifies one schedulable timer. Only client channels carry timers - the server is
///  prodded by client retransmits and inactivity acks, so it keeps no timer state.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum TimerKey {
    /// Retransmit timer of a client channel's outbound message.
    ClientOutbound { session: u32, channel: u8 },
    /// Inactivity timer of a client channel's inbound message.
    ClientInbound { session: u32, channel: u8 },
}

/// What a timer handler decided about the session that owns it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TimerOutcome {
    /// Progress was attempted, the timer may have been re-armed.
    Retrying,
    /// The retry budget is exhausted - the session is dead and its RPCs must be
    ///  aborted.
    SessionDead,
}

/// One-shot timers with a monotonic-millisecond deadline.
///
/// Timers are edge-triggered: firing removes the timer, and a handler that wants to
///  fire again must re-arm. `fire_due` collects the due keys before the caller
///  dispatches any of them, so handlers are free to add or remove timers (including
///  their own) while the collected batch is being processed.
pub struct TimerRegistry {
    deadlines: FxHashMap<TimerKey, u64>,
}

impl TimerRegistry {
    pub fn new() -> TimerRegistry {
        TimerRegistry {
            deadlines: FxHashMap::default(),
        }
    }

    /// Schedule `key` for `when`. Re-adding an already scheduled timer only moves its
    ///  deadline.
    pub fn add(&mut self, key: TimerKey, when: u64) {
        self.deadlines.insert(key, when);
    }

    pub fn remove(&mut self, key: TimerKey) {
        self.deadlines.remove(&key);
    }

    /// Remove and return every timer with a deadline at or before `now`, earliest
    ///  first.
    pub fn fire_due(&mut self, now: u64) -> Vec<TimerKey> {
        let mut due = self
            .deadlines
            .iter()
            .filter(|(_, &when)| when <= now)
            .map(|(&key, &when)| (when, key))
            .collect::<Vec<_>>();
        due.sort_by_key(|&(when, _)| when);

        for (_, key) in &due {
            self.deadlines.remove(key);
        }
        due.into_iter().map(|(_, key)| key).collect()
    }

    #[cfg(test)]
    fn is_scheduled(&self, key: TimerKey) -> bool {
        self.deadlines.contains_key(&key)
    }
}

impl Default for TimerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
