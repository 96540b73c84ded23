//! Mapping between sample time and the host's monotonic clock

use super::TimeStamp;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Anchors a [`TimeStamp`] to an [`Instant`] so that sample times can be
/// turned into wall-clock deadlines
#[derive(Debug, Clone, Copy)]
pub struct WallClock {
    origin: Instant,
    origin_stamp: TimeStamp,
}

impl WallClock {
    /// Anchor `origin_stamp` to the current instant
    pub fn new(origin_stamp: TimeStamp) -> Self {
        Self::with_origin(Instant::now(), origin_stamp)
    }

    /// Anchor sample time to the system clock, counting from the Unix epoch
    pub fn system(clock_speed: u32) -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        Self::with_origin(Instant::now(), TimeStamp::from_seconds(since_epoch, clock_speed))
    }

    /// Anchor `origin_stamp` to an explicit instant
    pub fn with_origin(origin: Instant, origin_stamp: TimeStamp) -> Self {
        Self { origin, origin_stamp }
    }

    /// Instant at which the sample `stamp` is expected to exist
    ///
    /// Stamps before the origin map onto the origin itself.
    pub fn instant_of(&self, stamp: TimeStamp) -> Instant {
        let samples = stamp - self.origin_stamp;
        if samples <= 0 {
            return self.origin;
        }

        let seconds = samples as f64 / self.origin_stamp.samples_per_second();
        self.origin + Duration::from_secs_f64(seconds)
    }

    /// Sample time corresponding to the current instant
    pub fn now_stamp(&self) -> TimeStamp {
        let elapsed = self.origin.elapsed().as_secs_f64();
        let samples = (elapsed * self.origin_stamp.samples_per_second()) as i64;
        self.origin_stamp + samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::DEFAULT_CLOCK_SPEED;

    #[test]
    fn test_instant_of() {
        let origin = Instant::now();
        let clock = WallClock::with_origin(origin, TimeStamp::new(0, 160_000_000));

        // 156250 samples per second at 160 MHz
        let later = clock.instant_of(TimeStamp::new(156_250, 160_000_000));
        let delta = later.duration_since(origin);
        assert!((delta.as_secs_f64() - 1.0).abs() < 1e-6);

        let earlier = clock.instant_of(TimeStamp::new(-1000, 160_000_000));
        assert_eq!(earlier, origin);
    }

    #[test]
    fn test_system_clock_is_recent() {
        let clock = WallClock::system(DEFAULT_CLOCK_SPEED);
        let now = clock.now_stamp();

        // after 2020-01-01
        assert!(now.seconds() > 1_577_836_800.0);
        assert!(clock.instant_of(TimeStamp::new(0, DEFAULT_CLOCK_SPEED)) <= Instant::now());
    }

    #[test]
    fn test_now_stamp_advances() {
        let clock = WallClock::new(TimeStamp::new(1000, DEFAULT_CLOCK_SPEED));
        let first = clock.now_stamp();
        std::thread::sleep(Duration::from_millis(5));
        let second = clock.now_stamp();

        assert!(first >= TimeStamp::new(1000, DEFAULT_CLOCK_SPEED));
        assert!(second > first);
    }
}
