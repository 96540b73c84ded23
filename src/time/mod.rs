//! Sample-clock time keeping
//!
//! Every buffer index and stream position in the pipeline is derived from a
//! [`TimeStamp`]: a signed count of samples since the epoch of the station
//! clock. Stations label their data with a `(sequence id, block id)` pair, the
//! sequence id being whole seconds and the block id the sample within that
//! second. Because the sample rate is `clock_speed / 1024` (195312.5 Hz for a
//! 200 MHz clock) a second does not always hold a whole number of samples, so
//! the conversion rounds with a `+512` bias. The rounding must stay exactly as
//! is: station firmware uses the same rule.

pub mod wall_clock;

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Default station clock in Hz
pub const DEFAULT_CLOCK_SPEED: u32 = 200_000_000;

/// Number of clock ticks per sample
const TICKS_PER_SAMPLE: i64 = 1024;

/// A point in time expressed in samples of the station clock
///
/// Comparison and hashing only look at the sample count; the clock speed is
/// carried along for conversions.
#[derive(Debug, Clone, Copy)]
pub struct TimeStamp {
    time: i64,
    clock_speed: u32,
}

impl TimeStamp {
    /// Create a timestamp from a raw sample count
    pub const fn new(time: i64, clock_speed: u32) -> Self {
        Self { time, clock_speed }
    }

    /// Create a timestamp from a station `(sequence id, block id)` pair
    pub fn from_seq_block(seq_id: u32, block_id: u32, clock_speed: u32) -> Self {
        let time = (seq_id as i64 * clock_speed as i64 + TICKS_PER_SAMPLE / 2) / TICKS_PER_SAMPLE
            + block_id as i64;

        Self { time, clock_speed }
    }

    /// Raw sample count
    pub fn time(&self) -> i64 {
        self.time
    }

    /// Clock speed in Hz
    pub fn clock_speed(&self) -> u32 {
        self.clock_speed
    }

    /// Whole second this sample falls in
    pub fn seq_id(&self) -> u32 {
        debug_assert!(self.clock_speed > 0, "clock speed not set");
        (TICKS_PER_SAMPLE * self.time / self.clock_speed as i64) as u32
    }

    /// Sample offset within the second
    pub fn block_id(&self) -> u32 {
        let second_start = (self.seq_id() as i64 * self.clock_speed as i64 + TICKS_PER_SAMPLE / 2)
            / TICKS_PER_SAMPLE;
        (self.time - second_start) as u32
    }

    /// Samples per second for this clock
    pub fn samples_per_second(&self) -> f64 {
        self.clock_speed as f64 / TICKS_PER_SAMPLE as f64
    }

    /// Seconds since the clock epoch
    pub fn seconds(&self) -> f64 {
        self.time as f64 * TICKS_PER_SAMPLE as f64 / self.clock_speed as f64
    }

    /// Convert to a `(seconds, nanoseconds)` pair
    pub fn to_timespec(&self) -> (i64, u32) {
        debug_assert!(self.clock_speed > 0, "clock speed not set");
        let ns = self.time as i128 * TICKS_PER_SAMPLE as i128 * 1_000_000_000
            / self.clock_speed as i128;

        (ns.div_euclid(1_000_000_000) as i64, ns.rem_euclid(1_000_000_000) as u32)
    }

    /// Timestamp closest to the given number of seconds since the epoch
    pub fn from_seconds(seconds: f64, clock_speed: u32) -> Self {
        let time = (seconds * clock_speed as f64 / TICKS_PER_SAMPLE as f64).round() as i64;
        Self { time, clock_speed }
    }

    /// Advance by one sample, returning the new value
    pub fn increment(&mut self) -> Self {
        self.time += 1;
        *self
    }

    /// Step back by one sample, returning the new value
    pub fn decrement(&mut self) -> Self {
        self.time -= 1;
        *self
    }
}

impl Default for TimeStamp {
    fn default() -> Self {
        Self::new(0, DEFAULT_CLOCK_SPEED)
    }
}

impl PartialEq for TimeStamp {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time
    }
}

impl Eq for TimeStamp {}

impl PartialOrd for TimeStamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeStamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time.cmp(&other.time)
    }
}

impl Hash for TimeStamp {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.time.hash(state);
    }
}

impl Add<i64> for TimeStamp {
    type Output = TimeStamp;

    fn add(self, samples: i64) -> TimeStamp {
        TimeStamp::new(self.time + samples, self.clock_speed)
    }
}

impl Sub<i64> for TimeStamp {
    type Output = TimeStamp;

    fn sub(self, samples: i64) -> TimeStamp {
        TimeStamp::new(self.time - samples, self.clock_speed)
    }
}

impl Sub<TimeStamp> for TimeStamp {
    type Output = i64;

    fn sub(self, other: TimeStamp) -> i64 {
        self.time - other.time
    }
}

impl AddAssign<i64> for TimeStamp {
    fn add_assign(&mut self, samples: i64) {
        self.time += samples;
    }
}

impl SubAssign<i64> for TimeStamp {
    fn sub_assign(&mut self, samples: i64) {
        self.time -= samples;
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clock_speed == 0 {
            write!(f, "{}", self.time)
        } else {
            write!(f, "[{}s, {}]", self.seq_id(), self.block_id())
        }
    }
}
