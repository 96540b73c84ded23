//! Exclusive locks on index ranges of a circular buffer
//!
//! A range is given as circular indices `[start, end)`. When `end < start`
//! the range wraps through index 0, and `start == end` covers the whole
//! buffer. Zero-length ranges are never locked.

use parking_lot::{Condvar, Mutex};

/// Registry of the currently locked ranges of one circular buffer
pub struct LockedRanges {
    /// Number of indices in the circular buffer
    size: usize,
    /// Ranges currently held, as normalized `(start, end)` pairs
    locked: Mutex<Vec<(usize, usize)>>,
    /// Signalled whenever a range is released
    released: Condvar,
}

/// Unlocks its range when dropped
pub struct RangeGuard<'a> {
    ranges: &'a LockedRanges,
    start: usize,
    end: usize,
}

impl Drop for RangeGuard<'_> {
    fn drop(&mut self) {
        self.ranges.unlock(self.start, self.end);
    }
}

impl LockedRanges {
    /// Create a lock registry for a circular buffer of `size` indices
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "circular buffer size must be positive");
        Self {
            size,
            locked: Mutex::new(Vec::new()),
            released: Condvar::new(),
        }
    }

    /// Size of the circular buffer
    pub fn size(&self) -> usize {
        self.size
    }

    /// Block until `[start, end)` overlaps no locked range, then lock it
    pub fn lock(&self, start: usize, end: usize) {
        let (start, end) = (start % self.size, end % self.size);
        let mut locked = self.locked.lock();

        while locked.iter().any(|&(s, e)| self.overlaps((s, e), (start, end))) {
            self.released.wait(&mut locked);
        }

        locked.push((start, end));
    }

    /// Release a range previously passed to [`LockedRanges::lock`]
    ///
    /// # Panics
    ///
    /// Panics if the range is not currently locked.
    pub fn unlock(&self, start: usize, end: usize) {
        let (start, end) = (start % self.size, end % self.size);
        let mut locked = self.locked.lock();

        let pos = locked
            .iter()
            .position(|&range| range == (start, end))
            .unwrap_or_else(|| panic!("unlocking range [{}, {}) which is not locked", start, end));

        locked.swap_remove(pos);
        self.released.notify_all();
    }

    /// Lock `[start, end)` and release it when the guard goes out of scope
    pub fn lock_guard(&self, start: usize, end: usize) -> RangeGuard<'_> {
        self.lock(start, end);
        RangeGuard {
            ranges: self,
            start: start % self.size,
            end: end % self.size,
        }
    }

    /// Number of ranges currently locked
    pub fn locked_count(&self) -> usize {
        self.locked.lock().len()
    }

    /// Split a circular range into at most two linear ones
    fn segments(&self, (start, end): (usize, usize)) -> [(usize, usize); 2] {
        if start < end {
            [(start, end), (0, 0)]
        } else {
            [(start, self.size), (0, end)]
        }
    }

    fn overlaps(&self, a: (usize, usize), b: (usize, usize)) -> bool {
        let a = self.segments(a);
        let b = self.segments(b);

        a.iter().any(|&(a_start, a_end)| {
            b.iter().any(|&(b_start, b_end)| {
                a_start < a_end && b_start < b_end && a_start < b_end && b_start < a_end
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_overlap_detection() {
        let ranges = LockedRanges::new(100);

        assert!(ranges.overlaps((10, 20), (15, 25)));
        assert!(!ranges.overlaps((10, 20), (20, 30)));
        // wraps through zero
        assert!(ranges.overlaps((90, 10), (5, 15)));
        assert!(ranges.overlaps((90, 10), (95, 99)));
        assert!(!ranges.overlaps((90, 10), (10, 90)));
        // whole buffer
        assert!(ranges.overlaps((40, 40), (0, 1)));
    }

    #[test]
    fn test_disjoint_locks_do_not_block() {
        let ranges = LockedRanges::new(100);
        ranges.lock(0, 50);
        ranges.lock(50, 0);
        assert_eq!(ranges.locked_count(), 2);

        ranges.unlock(0, 50);
        ranges.unlock(50, 100);
        assert_eq!(ranges.locked_count(), 0);
    }

    #[test]
    fn test_wrapping_lock_blocks_overlap() {
        let ranges = Arc::new(LockedRanges::new(100));
        ranges.lock(90, 10);

        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let ranges = ranges.clone();
            let acquired = acquired.clone();
            thread::spawn(move || {
                ranges.lock(5, 15);
                acquired.store(true, Ordering::SeqCst);
                ranges.unlock(5, 15);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst), "overlapping lock was granted");

        ranges.unlock(90, 10);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_guard_releases() {
        let ranges = LockedRanges::new(10);
        {
            let _guard = ranges.lock_guard(8, 2);
            assert_eq!(ranges.locked_count(), 1);
        }
        assert_eq!(ranges.locked_count(), 0);
    }

    #[test]
    #[should_panic(expected = "not locked")]
    fn test_unlock_unknown_range_panics() {
        let ranges = LockedRanges::new(10);
        ranges.unlock(1, 2);
    }

    #[test]
    fn test_concurrent_mutual_exclusion() {
        const SIZE: usize = 64;
        const THREADS: usize = 6;
        const ROUNDS: usize = 200;

        let ranges = Arc::new(LockedRanges::new(SIZE));
        let owners: Arc<Vec<AtomicU32>> = Arc::new((0..SIZE).map(|_| AtomicU32::new(0)).collect());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let ranges = ranges.clone();
                let owners = owners.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(t as u64);
                    barrier.wait();

                    for _ in 0..ROUNDS {
                        let start = rng.gen_range(0..SIZE);
                        let len = rng.gen_range(1..SIZE / 2);
                        let end = (start + len) % SIZE;

                        ranges.lock(start, end);
                        for offset in 0..len {
                            let prev = owners[(start + offset) % SIZE].fetch_add(1, Ordering::SeqCst);
                            assert_eq!(prev, 0, "index {} held twice", (start + offset) % SIZE);
                        }
                        thread::yield_now();
                        for offset in 0..len {
                            owners[(start + offset) % SIZE].fetch_sub(1, Ordering::SeqCst);
                        }
                        ranges.unlock(start, end);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ranges.locked_count(), 0);
    }
}
