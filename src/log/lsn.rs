use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::log::Lsn;

/// Wall-clock milliseconds scaled so that collisions within one millisecond
/// advance linearly without catching up to the next millisecond's range.
fn clock_lsn() -> Lsn {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    ms * 1_000_000
}

/// Monotonic LSN source. Seeded from the wall clock so LSNs never regress
/// across restarts as long as the clock does not.
#[derive(Debug)]
pub struct LsnAllocator {
    last: Mutex<Lsn>,
}

impl LsnAllocator {
    pub fn new() -> Self {
        Self {
            last: Mutex::new(clock_lsn()),
        }
    }

    pub fn next(&self) -> Lsn {
        let mut last = self.last.lock();
        let next = (*last + 1).max(clock_lsn());
        *last = next;
        next
    }
}

impl Default for LsnAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strictly_increasing() {
        let alloc = LsnAllocator::new();
        let mut prev = alloc.next();
        for _ in 0..10_000 {
            let next = alloc.next();
            assert!(next > prev);
            prev = next;
        }
    }

    #[test]
    fn increasing_across_threads() {
        use std::sync::Arc;

        let alloc = Arc::new(LsnAllocator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                std::thread::spawn(move || (0..1000).map(|_| alloc.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<Lsn> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let len = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), len, "no two threads may observe the same LSN");
    }
}
