//! Hashed time wheel with cancellable entries.

use std::collections::HashMap;
use std::task::Poll;

struct Slot<T> {
    key: u64,
    round: u64,
    t: T,
}

pub struct TimeWheel<T> {
    hashed: HashMap<u64, Vec<Slot<T>>>,
    // entry key -> slot index, used by `cancel`
    index: HashMap<u64, u64>,
    steps: u64,
    tick: u64,
    next_key: u64,
}

impl<T> TimeWheel<T> {
    // create new hashed time wheel instance
    pub fn new(steps: u64) -> Self {
        TimeWheel {
            steps: steps.max(1),
            hashed: HashMap::new(),
            index: HashMap::new(),
            tick: 0,
            next_key: 0,
        }
    }

    /// Add `value` so that it is returned by the `ticks`-th call to [`tick`](Self::tick).
    ///
    /// `ticks` of zero is treated as one. Returns the key for [`cancel`](Self::cancel).
    pub fn add(&mut self, ticks: u64, value: T) -> u64 {
        let ticks = ticks.max(1);

        let slot = (self.tick + ticks - 1) % self.steps;
        let round = (ticks - 1) / self.steps;

        let key = self.next_key;
        self.next_key += 1;

        log::trace!(
            "add timeout({}) to slot({}) with round({}), current tick is {}",
            ticks,
            slot,
            round,
            self.tick
        );

        self.hashed.entry(slot).or_insert_with(Vec::new).push(Slot {
            key,
            round,
            t: value,
        });

        self.index.insert(key, slot);

        key
    }

    /// Remove a pending entry, returning it if it had not fired yet.
    pub fn cancel(&mut self, key: u64) -> Option<T> {
        let slot = self.index.remove(&key)?;

        let slots = self.hashed.get_mut(&slot)?;

        let pos = slots.iter().position(|s| s.key == key)?;

        let removed = slots.swap_remove(pos);

        if slots.is_empty() {
            self.hashed.remove(&slot);
        }

        Some(removed.t)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn tick(&mut self) -> Poll<Vec<(u64, T)>> {
        let step = self.tick % self.steps;

        self.tick += 1;

        if let Some(slots) = self.hashed.remove(&step) {
            let mut current = vec![];
            let mut reserved = vec![];

            for slot in slots {
                if slot.round == 0 {
                    self.index.remove(&slot.key);
                    current.push((slot.key, slot.t));
                } else {
                    reserved.push(Slot {
                        key: slot.key,
                        t: slot.t,
                        round: slot.round - 1,
                    });
                }
            }

            if !reserved.is_empty() {
                self.hashed.insert(step, reserved);
            }

            if !current.is_empty() {
                return Poll::Ready(current);
            }
        }

        Poll::Pending
    }
}
