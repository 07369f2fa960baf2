//! Windowed token buckets
//!
//! A bucket admits `capacity` units per `window`. Consumption is recorded in
//! slots of `window / SLOTS_PER_WINDOW`; a slot counts against the bucket while
//! any part of it overlaps the trailing window, so the units accepted in any
//! window-long interval never exceed the capacity. Tokens come back lazily as
//! slots age out.

use devgate_common::{Result, TransportError};
use std::collections::VecDeque;

const SLOTS_PER_WINDOW: i64 = 10;

/// One `capacity:windowSeconds` pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitWindow {
    pub capacity: u64,
    pub window_ms: i64,
}

/// Parsed bucket spec, e.g. `"100:1,3000:60"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitSpec {
    windows: Vec<LimitWindow>,
}

impl LimitSpec {
    /// Parse a spec; empty or blank input means unlimited (`None`)
    pub fn parse(spec: &str) -> Result<Option<Self>> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Ok(None);
        }

        let mut windows = Vec::new();
        for pair in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (capacity, seconds) = pair.split_once(':').ok_or_else(|| invalid(spec))?;
            let capacity: u64 = capacity.trim().parse().map_err(|_| invalid(spec))?;
            let seconds: i64 = seconds.trim().parse().map_err(|_| invalid(spec))?;
            if capacity == 0 || seconds <= 0 {
                return Err(invalid(spec));
            }
            windows.push(LimitWindow {
                capacity,
                window_ms: seconds * 1000,
            });
        }

        if windows.is_empty() {
            return Ok(None);
        }
        Ok(Some(Self { windows }))
    }

    pub fn windows(&self) -> &[LimitWindow] {
        &self.windows
    }

    pub fn new_bucket(&self) -> Bucket {
        Bucket {
            counters: self.windows.iter().map(|w| WindowCounter::new(*w)).collect(),
        }
    }
}

fn invalid(spec: &str) -> TransportError {
    TransportError::Configuration {
        message: format!("invalid rate limit spec '{}'", spec),
    }
}

#[derive(Debug)]
struct WindowCounter {
    limit: LimitWindow,
    slot_ms: i64,
    slots: VecDeque<(i64, u64)>,
    used: u64,
}

impl WindowCounter {
    fn new(limit: LimitWindow) -> Self {
        Self {
            limit,
            slot_ms: (limit.window_ms / SLOTS_PER_WINDOW).max(1),
            slots: VecDeque::new(),
            used: 0,
        }
    }

    fn slot_index(&self, now: i64) -> i64 {
        let idx = now.div_euclid(self.slot_ms);
        // clock stepping back lands in the newest slot
        match self.slots.back() {
            Some(&(last, _)) if last > idx => last,
            _ => idx,
        }
    }

    fn expire(&mut self, now: i64) {
        let horizon = now - self.limit.window_ms;
        while let Some(&(idx, count)) = self.slots.front() {
            if (idx + 1) * self.slot_ms <= horizon {
                self.slots.pop_front();
                self.used -= count;
            } else {
                break;
            }
        }
    }

    fn available(&mut self, now: i64) -> u64 {
        self.expire(now);
        self.limit.capacity.saturating_sub(self.used)
    }

    fn consume(&mut self, now: i64, units: u64) {
        let idx = self.slot_index(now);
        self.used += units;
        if let Some((last, count)) = self.slots.back_mut() {
            if *last == idx {
                *count += units;
                return;
            }
        }
        self.slots.push_back((idx, units));
    }

    fn refund(&mut self, now: i64, units: u64) {
        let idx = self.slot_index(now);
        if let Some((last, count)) = self.slots.back_mut() {
            if *last == idx {
                let refunded = units.min(*count);
                *count -= refunded;
                self.used -= refunded;
            }
        }
    }
}

/// Bucket enforcing every window of a spec at once
#[derive(Debug)]
pub struct Bucket {
    counters: Vec<WindowCounter>,
}

impl Bucket {
    /// Tokens left in the tightest window
    pub fn available(&mut self, now: i64) -> u64 {
        self.counters
            .iter_mut()
            .map(|c| c.available(now))
            .min()
            .unwrap_or(u64::MAX)
    }

    /// Whether `units` fit in every window, without consuming
    pub fn has_room(&mut self, now: i64, units: u64) -> bool {
        units == 0 || self.available(now) >= units
    }

    /// Consume `units` from every window; call only after `has_room`
    pub fn consume(&mut self, now: i64, units: u64) {
        if units == 0 {
            return;
        }
        for counter in &mut self.counters {
            counter.consume(now, units);
        }
    }

    /// Give back units consumed at the same `now`
    pub fn refund(&mut self, now: i64, units: u64) {
        if units == 0 {
            return;
        }
        for counter in &mut self.counters {
            counter.refund(now, units);
        }
    }

    pub fn try_consume(&mut self, now: i64, units: u64) -> bool {
        if !self.has_room(now, units) {
            return false;
        }
        self.consume(now, units);
        true
    }
}
