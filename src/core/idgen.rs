use parking_lot::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::core::error::{Error, ErrorKind, Result};

// 2024-01-01T00:00:00Z, keeps 41 bits of milliseconds good for ~69 years.
const EPOCH_MS: u64 = 1_704_067_200_000;

const NODE_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_NODE: u16 = (1 << NODE_BITS) - 1;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

/// Distributed unique ID allocator: 41 bits of milliseconds since a fixed
/// epoch, 10 bits of node id, 12 bits of per-millisecond counter. Values
/// from one node are strictly increasing; uniqueness across nodes holds as
/// long as node ids are unique.
pub struct IdGenerator {
    node_id: u16,
    skew_tolerance: Duration,
    state: Mutex<GenState>,
}

struct GenState {
    last_ms: u64,
    sequence: u64,
}

impl IdGenerator {
    pub fn new(node_id: u16, skew_tolerance: Duration) -> Self {
        IdGenerator {
            node_id: node_id & MAX_NODE,
            skew_tolerance,
            state: Mutex::new(GenState {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    pub fn next(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let mut now = Self::clock_ms()?;

        if now < state.last_ms {
            let regress = state.last_ms - now;
            if regress > self.skew_tolerance.as_millis() as u64 {
                return Err(Error::new(
                    ErrorKind::ClockSkew,
                    format!("clock moved backward by {}ms", regress),
                ));
            }
            // Within tolerance: wait the regression out.
            now = Self::wait_until(state.last_ms)?;
        }

        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // Counter exhausted for this millisecond, block until the
                // next tick rather than risk a duplicate.
                now = Self::wait_until(state.last_ms + 1)?;
                state.last_ms = now;
            }
        } else {
            state.last_ms = now;
            state.sequence = 0;
        }

        Ok(((now - EPOCH_MS) << (NODE_BITS + SEQUENCE_BITS))
            | ((self.node_id as u64) << SEQUENCE_BITS)
            | state.sequence)
    }

    fn clock_ms() -> Result<u64> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::new(ErrorKind::ClockSkew, e.to_string()))?
            .as_millis() as u64;
        if now < EPOCH_MS {
            return Err(Error::new(
                ErrorKind::ClockSkew,
                "system clock is before the generator epoch",
            ));
        }
        Ok(now)
    }

    fn wait_until(target_ms: u64) -> Result<u64> {
        loop {
            let now = Self::clock_ms()?;
            if now >= target_ms {
                return Ok(now);
            }
            std::thread::yield_now();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing() {
        let gen = IdGenerator::new(3, Duration::from_millis(500));
        let mut last = 0u64;
        for _ in 0..10_000 {
            let id = gen.next().unwrap();
            assert!(id > last, "id {} not greater than previous {}", id, last);
            last = id;
        }
    }

    #[test]
    fn node_id_is_embedded() {
        let gen = IdGenerator::new(42, Duration::from_millis(500));
        let id = gen.next().unwrap();
        assert_eq!((id >> SEQUENCE_BITS) & MAX_NODE as u64, 42);
    }

    #[test]
    fn distinct_nodes_distinct_ids() {
        let a = IdGenerator::new(1, Duration::from_millis(500));
        let b = IdGenerator::new(2, Duration::from_millis(500));
        assert_ne!(a.next().unwrap(), b.next().unwrap());
    }
}
