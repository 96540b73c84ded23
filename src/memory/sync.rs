//! Pacing of the sample buffer's writer against its reader
//!
//! Both strategies track two pointers in sample time: how far the writer has
//! deposited data and how far the reader has released it. They differ in
//! what they wait for.
//!
//! - [`SynchronizedReaderWriter`] couples the two strictly: the writer waits
//!   until writing would not overwrite unreleased data, the reader waits until
//!   its whole window has been written.
//! - [`TimeSynchronizedReaderWriter`] paces both sides by the wall clock. A
//!   writer holding data from too far in the future waits at most the network
//!   delay, and a reader gives up waiting once the window plus the network
//!   delay lies in the past. Missing data then shows up as flags.

use crate::time::wall_clock::WallClock;
use crate::time::TimeStamp;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Outcome of waiting for a read window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// The writer covered the whole window
    Complete,
    /// The wait ended before the writer covered the whole window
    Incomplete,
}

/// Contract shared by the pacing strategies
pub trait ReaderWriterSynchronizer: Send + Sync {
    /// Called before depositing samples for `[begin, end)`
    fn start_write(&self, begin: TimeStamp, end: TimeStamp);
    /// Called after samples up to `end` have been deposited
    fn finished_write(&self, end: TimeStamp);
    /// Called before consuming `[begin, end)`
    fn start_read(&self, begin: TimeStamp, end: TimeStamp) -> ReadStatus;
    /// Called after the reader no longer needs data before `end`
    fn finished_read(&self, end: TimeStamp);
    /// The writer will not write again; wakes a waiting reader
    fn no_more_writes(&self);
    /// The reader will not read again; wakes a waiting writer
    fn no_more_reads(&self);
    /// Time up to which the writer has deposited data
    fn written_until(&self) -> TimeStamp;
    /// Time up to which the reader has released data
    fn released_until(&self) -> TimeStamp;
}

#[derive(Debug)]
struct Progress {
    written: TimeStamp,
    released: TimeStamp,
    writes_done: bool,
    reads_done: bool,
}

impl Progress {
    fn new(start: TimeStamp) -> Self {
        Self {
            written: start,
            released: start,
            writes_done: false,
            reads_done: false,
        }
    }
}

/// Lock-step pacing for a buffer of a fixed number of samples
pub struct SynchronizedReaderWriter {
    capacity: i64,
    progress: Mutex<Progress>,
    changed: Condvar,
}

impl SynchronizedReaderWriter {
    /// Pace a buffer of `capacity` samples whose first sample is `start`
    pub fn new(capacity: usize, start: TimeStamp) -> Self {
        Self {
            capacity: capacity as i64,
            progress: Mutex::new(Progress::new(start)),
            changed: Condvar::new(),
        }
    }
}

impl ReaderWriterSynchronizer for SynchronizedReaderWriter {
    fn start_write(&self, _begin: TimeStamp, end: TimeStamp) {
        let mut progress = self.progress.lock();
        while !progress.reads_done && progress.released < end - self.capacity {
            self.changed.wait(&mut progress);
        }
    }

    fn finished_write(&self, end: TimeStamp) {
        let mut progress = self.progress.lock();
        progress.written = progress.written.max(end);
        self.changed.notify_all();
    }

    fn start_read(&self, _begin: TimeStamp, end: TimeStamp) -> ReadStatus {
        let mut progress = self.progress.lock();
        while !progress.writes_done && progress.written < end {
            self.changed.wait(&mut progress);
        }

        if progress.written >= end {
            ReadStatus::Complete
        } else {
            ReadStatus::Incomplete
        }
    }

    fn finished_read(&self, end: TimeStamp) {
        let mut progress = self.progress.lock();
        progress.released = progress.released.max(end);
        self.changed.notify_all();
    }

    fn no_more_writes(&self) {
        self.progress.lock().writes_done = true;
        self.changed.notify_all();
    }

    fn no_more_reads(&self) {
        self.progress.lock().reads_done = true;
        self.changed.notify_all();
    }

    fn written_until(&self) -> TimeStamp {
        self.progress.lock().written
    }

    fn released_until(&self) -> TimeStamp {
        self.progress.lock().released
    }
}

/// Wall-clock pacing with a bounded network delay
pub struct TimeSynchronizedReaderWriter {
    clock: WallClock,
    max_network_delay: Duration,
    progress: Mutex<Progress>,
    changed: Condvar,
}

impl TimeSynchronizedReaderWriter {
    /// Pace a buffer whose first sample is `start` against `clock`
    pub fn new(clock: WallClock, max_network_delay: Duration, start: TimeStamp) -> Self {
        Self {
            clock,
            max_network_delay,
            progress: Mutex::new(Progress::new(start)),
            changed: Condvar::new(),
        }
    }

    /// Maximum network delay tolerated
    pub fn max_network_delay(&self) -> Duration {
        self.max_network_delay
    }
}

impl ReaderWriterSynchronizer for TimeSynchronizedReaderWriter {
    fn start_write(&self, begin: TimeStamp, _end: TimeStamp) {
        let expected = self.clock.instant_of(begin);
        let earliest = expected.checked_sub(self.max_network_delay).unwrap_or(expected);
        let until = earliest.min(Instant::now() + self.max_network_delay);

        let mut progress = self.progress.lock();
        while !progress.reads_done && Instant::now() < until {
            if self.changed.wait_until(&mut progress, until).timed_out() {
                break;
            }
        }
    }

    fn finished_write(&self, end: TimeStamp) {
        let mut progress = self.progress.lock();
        progress.written = progress.written.max(end);
        self.changed.notify_all();
    }

    fn start_read(&self, begin: TimeStamp, end: TimeStamp) -> ReadStatus {
        let deadline = self.clock.instant_of(end) + self.max_network_delay;

        let mut progress = self.progress.lock();
        while !progress.writes_done && progress.written < end {
            if self.changed.wait_until(&mut progress, deadline).timed_out() {
                break;
            }
        }

        if progress.written >= end {
            ReadStatus::Complete
        } else {
            log::debug!(
                "window {} - {} incomplete: data written up to {}",
                begin,
                end,
                progress.written
            );
            ReadStatus::Incomplete
        }
    }

    fn finished_read(&self, end: TimeStamp) {
        let mut progress = self.progress.lock();
        progress.released = progress.released.max(end);
        self.changed.notify_all();
    }

    fn no_more_writes(&self) {
        self.progress.lock().writes_done = true;
        self.changed.notify_all();
    }

    fn no_more_reads(&self) {
        self.progress.lock().reads_done = true;
        self.changed.notify_all();
    }

    fn written_until(&self) -> TimeStamp {
        self.progress.lock().written
    }

    fn released_until(&self) -> TimeStamp {
        self.progress.lock().released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::DEFAULT_CLOCK_SPEED;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn stamp(time: i64) -> TimeStamp {
        TimeStamp::new(time, DEFAULT_CLOCK_SPEED)
    }

    #[test]
    fn test_reader_waits_for_writer() {
        let sync = Arc::new(SynchronizedReaderWriter::new(100, stamp(0)));
        let done = Arc::new(AtomicBool::new(false));

        let reader = {
            let sync = sync.clone();
            let done = done.clone();
            thread::spawn(move || {
                let status = sync.start_read(stamp(0), stamp(50));
                done.store(true, Ordering::SeqCst);
                status
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!done.load(Ordering::SeqCst));

        sync.start_write(stamp(0), stamp(50));
        sync.finished_write(stamp(50));

        assert_eq!(reader.join().unwrap(), ReadStatus::Complete);
    }

    #[test]
    fn test_writer_does_not_lap_reader() {
        let sync = Arc::new(SynchronizedReaderWriter::new(100, stamp(0)));
        sync.start_write(stamp(0), stamp(100));
        sync.finished_write(stamp(100));

        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let sync = sync.clone();
            let done = done.clone();
            thread::spawn(move || {
                sync.start_write(stamp(100), stamp(150));
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!done.load(Ordering::SeqCst), "writer overwrote unread data");

        sync.finished_read(stamp(50));
        writer.join().unwrap();
        assert_eq!(sync.released_until(), stamp(50));
    }

    #[test]
    fn test_no_more_writes_releases_reader() {
        let sync = Arc::new(SynchronizedReaderWriter::new(100, stamp(0)));
        let reader = {
            let sync = sync.clone();
            thread::spawn(move || sync.start_read(stamp(0), stamp(10)))
        };

        thread::sleep(Duration::from_millis(10));
        sync.no_more_writes();
        assert_eq!(reader.join().unwrap(), ReadStatus::Incomplete);
    }

    #[test]
    fn test_time_windowed_read_times_out() {
        let clock = WallClock::new(stamp(0));
        let sync = TimeSynchronizedReaderWriter::new(clock, Duration::from_millis(50), stamp(0));

        // 1000 samples is about 5 ms at 195312.5 samples per second
        let started = Instant::now();
        let status = sync.start_read(stamp(0), stamp(1000));
        let waited = started.elapsed();

        assert_eq!(status, ReadStatus::Incomplete);
        assert!(waited >= Duration::from_millis(45), "gave up after {:?}", waited);
        assert!(waited < Duration::from_millis(500), "waited {:?}", waited);
    }

    #[test]
    fn test_time_windowed_read_completes_early() {
        let clock = WallClock::new(stamp(0));
        let sync = Arc::new(TimeSynchronizedReaderWriter::new(clock, Duration::from_secs(5), stamp(0)));

        let writer = {
            let sync = sync.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                sync.start_write(stamp(0), stamp(100));
                sync.finished_write(stamp(100));
            })
        };

        let started = Instant::now();
        assert_eq!(sync.start_read(stamp(0), stamp(100)), ReadStatus::Complete);
        assert!(started.elapsed() < Duration::from_secs(2));
        writer.join().unwrap();
    }

    #[test]
    fn test_time_windowed_write_of_future_data_is_bounded() {
        let clock = WallClock::new(stamp(0));
        let sync = TimeSynchronizedReaderWriter::new(clock, Duration::from_millis(40), stamp(0));

        // ten seconds ahead of the wall clock
        let future = stamp(1_953_125);
        let started = Instant::now();
        sync.start_write(future, future + 100);
        let waited = started.elapsed();

        assert!(waited >= Duration::from_millis(40), "waited {:?}", waited);
        assert!(waited < Duration::from_millis(500), "waited {:?}", waited);
    }

    #[test]
    fn test_time_windowed_write_of_current_data_does_not_wait() {
        let clock = WallClock::new(stamp(0));
        let sync = TimeSynchronizedReaderWriter::new(clock, Duration::from_secs(5), stamp(0));

        let started = Instant::now();
        sync.start_write(stamp(0), stamp(100));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
