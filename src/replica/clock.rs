// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Hybrid logical clock.
//!
//! Timestamps order first by wall-clock milliseconds, then by a logical
//! counter, then by the writer's node id. The last field makes concurrent
//! writes at the same logical time resolve identically on every replica.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Logical write timestamp. Field order is the comparison order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub wall_ms: u64,
    pub counter: u32,
    pub node: String,
}

impl Timestamp {
    pub fn new(wall_ms: u64, counter: u32, node: impl Into<String>) -> Self {
        Self {
            wall_ms,
            counter,
            node: node.into(),
        }
    }

    /// Timestamp for snapshot rows that carry no write time.
    ///
    /// Sorts below every real write.
    pub fn restored(node: impl Into<String>) -> Self {
        Self::new(0, 0, node)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}@{}", self.wall_ms, self.counter, self.node)
    }
}

/// Parses the `wall.counter@node` form written by `Display`.
impl FromStr for Timestamp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid timestamp '{}'", s);
        let (wall, rest) = s.split_once('.').ok_or_else(invalid)?;
        let (counter, node) = rest.split_once('@').ok_or_else(invalid)?;
        if node.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            wall_ms: wall.parse().map_err(|_| invalid())?,
            counter: counter.parse().map_err(|_| invalid())?,
            node: node.to_string(),
        })
    }
}

/// Per-replica clock. Owned by one actor, so no interior locking.
#[derive(Debug)]
pub struct HybridClock {
    node: String,
    last_wall: u64,
    last_counter: u32,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl HybridClock {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            last_wall: 0,
            last_counter: 0,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Issue a timestamp strictly greater than any issued or observed so far.
    pub fn tick(&mut self) -> Timestamp {
        self.tick_at(now_ms())
    }

    fn tick_at(&mut self, wall_ms: u64) -> Timestamp {
        if wall_ms > self.last_wall {
            self.last_wall = wall_ms;
            self.last_counter = 0;
        } else if self.last_counter == u32::MAX {
            // Counter exhausted within one millisecond: borrow from the future
            self.last_wall += 1;
            self.last_counter = 0;
        } else {
            self.last_counter += 1;
        }
        Timestamp::new(self.last_wall, self.last_counter, self.node.clone())
    }

    /// Fold in a timestamp seen on a remote entry.
    pub fn observe(&mut self, ts: &Timestamp) {
        if ts.wall_ms > self.last_wall {
            self.last_wall = ts.wall_ms;
            self.last_counter = ts.counter;
        } else if ts.wall_ms == self.last_wall && ts.counter > self.last_counter {
            self.last_counter = ts.counter;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_fields() {
        let early = Timestamp::new(10, 5, "z");
        let later_wall = Timestamp::new(11, 0, "a");
        let later_counter = Timestamp::new(10, 6, "a");
        let tie_break = Timestamp::new(10, 5, "zz");

        assert!(later_wall > early);
        assert!(later_counter > early);
        assert!(tie_break > early);
        assert!(Timestamp::restored("a") < Timestamp::new(1, 0, "a"));
    }

    #[test]
    fn test_text_form_parses_back() {
        let ts = Timestamp::new(1_700_000_000_123, 7, "shelter-north.v2@dc1");
        let text = ts.to_string();
        assert_eq!(text, "1700000000123.7@shelter-north.v2@dc1");
        assert_eq!(text.parse::<Timestamp>(), Ok(ts));

        assert!("".parse::<Timestamp>().is_err());
        assert!("12@node".parse::<Timestamp>().is_err());
        assert!("12.x@node".parse::<Timestamp>().is_err());
        assert!("12.3@".parse::<Timestamp>().is_err());
    }

    #[test]
    fn test_tick_is_monotonic_with_stalled_wall() {
        let mut clock = HybridClock::new("node-a");
        let a = clock.tick_at(100);
        let b = clock.tick_at(100);
        let c = clock.tick_at(90); // wall went backwards
        assert!(b > a);
        assert!(c > b);
        assert_eq!(c.wall_ms, 100);
        assert_eq!(c.counter, 2);
    }

    #[test]
    fn test_tick_resets_counter_on_new_wall() {
        let mut clock = HybridClock::new("node-a");
        clock.tick_at(100);
        clock.tick_at(100);
        let ts = clock.tick_at(200);
        assert_eq!(ts, Timestamp::new(200, 0, "node-a"));
    }

    #[test]
    fn test_observe_orders_next_tick_after_remote() {
        let mut clock = HybridClock::new("node-a");
        clock.tick_at(100);

        let remote = Timestamp::new(500, 7, "node-b");
        clock.observe(&remote);
        let next = clock.tick_at(120);
        assert!(next > remote);
        assert_eq!(next.wall_ms, 500);
        assert_eq!(next.counter, 8);
    }

    #[test]
    fn test_observe_older_is_ignored() {
        let mut clock = HybridClock::new("node-a");
        let issued = clock.tick_at(1_000);
        clock.observe(&Timestamp::new(10, 99, "node-b"));
        assert!(clock.tick_at(1_000) > issued);
    }

    #[test]
    fn test_counter_overflow_advances_wall() {
        let mut clock = HybridClock::new("node-a");
        clock.observe(&Timestamp::new(50, u32::MAX, "node-b"));
        let ts = clock.tick_at(50);
        assert_eq!(ts.wall_ms, 51);
        assert_eq!(ts.counter, 0);
    }

    #[test]
    fn test_real_clock_ticks_increase() {
        let mut clock = HybridClock::new("node-a");
        let mut last = clock.tick();
        for _ in 0..100 {
            let next = clock.tick();
            assert!(next > last);
            last = next;
        }
        assert_eq!(clock.node(), "node-a");
    }

    #[test]
    fn test_display() {
        assert_eq!(Timestamp::new(5, 1, "n").to_string(), "5.1@n");
    }
}
