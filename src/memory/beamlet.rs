//! Circular buffer of station samples indexed by time
//!
//! The buffer holds `capacity` samples for each subband. A sample for time
//! `t` lives at circular index `t mod capacity`, so the array is laid out as
//! `[subband][capacity][polarization]`. Writers (network receivers) deposit
//! blocks of samples for a time window; a single reader brackets its access
//! in a read transaction.
//!
//! Writes and the read transaction lock their index ranges in a
//! [`LockedRanges`], so a writer may run concurrently with the reader as long
//! as they touch different parts of the array. Which times actually hold
//! data is tracked in a [`SparseSet`]; missing data is reported to the reader
//! as flags, never as an error.

use crate::config::{BufferConfig, LateDataPolicy, SyncMode};
use crate::error::Result;
use crate::memory::locked_ranges::LockedRanges;
use crate::memory::sparse_set::SparseSet;
use crate::memory::sync::{
    ReadStatus, ReaderWriterSynchronizer, SynchronizedReaderWriter, TimeSynchronizedReaderWriter,
};
use crate::memory::SampleArray;
use crate::time::wall_clock::WallClock;
use crate::time::TimeStamp;
use bytemuck::Pod;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counters describing the buffer's activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// Samples per subband deposited by writers
    pub samples_written: u64,
    /// Writes dropped entirely because their data was older than the buffer holds
    pub late_writes: u64,
    /// Read transactions started
    pub read_transactions: u64,
}

/// The padded window transferred by [`BeamletBuffer::send_subband`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignedWindow {
    /// First sample time sent
    pub begin: TimeStamp,
    /// One past the last sample time sent
    pub end: TimeStamp,
    /// Extra samples sent before the requested window
    pub lead: usize,
    /// Extra samples sent after the requested window
    pub trail: usize,
}

/// Valid-data bookkeeping, guarded together
struct ValidData {
    ranges: SparseSet,
    newest_end: i64,
}

/// State of the active read transaction
struct ReadTransaction {
    begin: TimeStamp,
    end: TimeStamp,
    aligned_begin: TimeStamp,
    aligned_end: TimeStamp,
    status: ReadStatus,
    valid: SparseSet,
}

/// Circular per-subband sample buffer shared by writers and one reader
pub struct BeamletBuffer<S> {
    capacity: usize,
    subbands: usize,
    polarizations: usize,
    history: usize,
    alignment: usize,
    late_data_policy: LateDataPolicy,
    /// Sample storage, `[subband][capacity][polarization]`
    samples: SampleArray<S>,
    /// Times holding valid data
    valid: Mutex<ValidData>,
    /// Index ranges currently being written or read
    locked: LockedRanges,
    /// Pacing between writers and the reader
    sync: Box<dyn ReaderWriterSynchronizer>,
    /// Active read transaction, if any
    transaction: Mutex<Option<ReadTransaction>>,
    /// Set while a read transaction is being started or active
    reading: AtomicBool,
    samples_written: CachePadded<AtomicU64>,
    late_writes: CachePadded<AtomicU64>,
    read_transactions: CachePadded<AtomicU64>,
}

impl<S: Pod + Send + Sync> BeamletBuffer<S> {
    /// Create a buffer whose first expected sample is `start`
    ///
    /// The synchronizer is chosen by `config.mode`. In time-windowed mode the
    /// wall clock is the system clock, so `start` is expected to count from
    /// the Unix epoch.
    pub fn new(config: &BufferConfig, start: TimeStamp) -> Result<Self> {
        let sync: Box<dyn ReaderWriterSynchronizer> = match config.mode {
            SyncMode::Synchronous => Box::new(SynchronizedReaderWriter::new(config.capacity, start)),
            SyncMode::TimeWindowed => Box::new(TimeSynchronizedReaderWriter::new(
                WallClock::system(config.clock_speed),
                config.max_network_delay(),
                start,
            )),
        };

        Self::with_synchronizer(config, start, sync)
    }

    /// Create a buffer paced by an explicit synchronizer
    pub fn with_synchronizer(
        config: &BufferConfig,
        start: TimeStamp,
        sync: Box<dyn ReaderWriterSynchronizer>,
    ) -> Result<Self> {
        config.validate()?;

        let len = config.subbands * config.capacity * config.polarizations;
        let byte_alignment = config.alignment * std::mem::size_of::<S>();
        let samples = SampleArray::zeroed(len, byte_alignment);
        debug_assert_eq!(samples.len(), len);
        debug_assert!(samples.alignment() >= byte_alignment);

        Ok(Self {
            capacity: config.capacity,
            subbands: config.subbands,
            polarizations: config.polarizations,
            history: config.history,
            alignment: config.alignment,
            late_data_policy: config.late_data_policy,
            samples,
            valid: Mutex::new(ValidData {
                ranges: SparseSet::new(),
                newest_end: start.time(),
            }),
            locked: LockedRanges::new(config.capacity),
            sync,
            transaction: Mutex::new(None),
            reading: AtomicBool::new(false),
            samples_written: CachePadded::new(AtomicU64::new(0)),
            late_writes: CachePadded::new(AtomicU64::new(0)),
            read_transactions: CachePadded::new(AtomicU64::new(0)),
        })
    }

    /// Deposit `count` samples per subband starting at `begin`
    ///
    /// `data` is laid out as `[subband][count][polarization]`. Samples older
    /// than the buffer can hold relative to the newest data are discarded.
    ///
    /// # Panics
    ///
    /// Panics if `count` exceeds the capacity or `data` has the wrong length.
    pub fn write_elements(&self, data: &[S], begin: TimeStamp, count: usize) {
        assert!(
            count <= self.capacity,
            "write of {} samples exceeds buffer capacity {}",
            count,
            self.capacity
        );
        assert_eq!(
            data.len(),
            self.subbands * count * self.polarizations,
            "sample block does not match {} subbands x {} samples x {} polarizations",
            self.subbands,
            count,
            self.polarizations
        );

        if count == 0 {
            return;
        }

        let end = begin + count as i64;

        // Older data would overwrite samples newer than itself
        let horizon = self.valid.lock().newest_end.saturating_sub(self.capacity as i64);
        let skip = (horizon - begin.time()).max(0) as usize;
        if skip >= count {
            self.late_writes.fetch_add(1, Ordering::Relaxed);
            log::debug!("dropping write {} - {}: older than the buffer holds", begin, end);
            return;
        }
        if skip > 0 {
            log::debug!("clipping {} stale samples from write at {}", skip, begin);
        }

        let begin = begin + skip as i64;
        let written = count - skip;
        let start_index = self.index_of(begin);

        self.sync.start_write(begin, end);

        {
            let _guard = self.locked.lock_guard(start_index, self.index_of(end));

            for subband in 0..self.subbands {
                let source = &data[(subband * count + skip) * self.polarizations
                    ..(subband + 1) * count * self.polarizations];
                let mut consumed = 0;

                for (offset, len) in self.segments(subband, start_index, written) {
                    // Exclusive: the range is locked by this writer
                    unsafe { self.samples.region_mut(offset, len) }
                        .copy_from_slice(&source[consumed..consumed + len]);
                    consumed += len;
                }
            }

            let mut valid = self.valid.lock();
            valid.newest_end = valid.newest_end.max(end.time());
            valid.ranges.include(begin.time(), end.time());

            let horizon = valid.newest_end - self.capacity as i64;
            valid.ranges.exclude(i64::MIN, horizon);
        }

        self.samples_written.fetch_add(written as u64, Ordering::Relaxed);
        self.sync.finished_write(end);
    }

    /// Begin reading `count` samples per subband starting at `begin`
    ///
    /// Waits as the synchronizer dictates, then locks the window (padded to
    /// the alignment) against writers.
    ///
    /// # Panics
    ///
    /// Panics if another read transaction is active or the padded window is
    /// larger than the buffer.
    pub fn start_read_transaction(&self, begin: TimeStamp, count: usize) {
        assert!(count > 0, "empty read transaction");

        let end = begin + count as i64;
        let (aligned_begin, aligned_end) = self.align(begin, end);
        let span = (aligned_end - aligned_begin) as usize;
        assert!(
            span <= self.capacity,
            "read window of {} samples ({} aligned) exceeds buffer capacity {}",
            count,
            span,
            self.capacity
        );

        let already_reading = self.reading.swap(true, Ordering::AcqRel);
        assert!(!already_reading, "a read transaction is already active");

        let status = self.sync.start_read(begin, end);
        self.locked.lock(self.index_of(aligned_begin), self.index_of(aligned_end));

        let valid = self.valid.lock().ranges.subset(begin.time(), end.time());
        *self.transaction.lock() = Some(ReadTransaction {
            begin,
            end,
            aligned_begin,
            aligned_end,
            status,
            valid,
        });

        self.read_transactions.fetch_add(1, Ordering::Relaxed);
    }

    /// End the active read transaction and let writers reuse its space
    ///
    /// The last `history` samples of the window stay protected from the
    /// writer in synchronous mode.
    pub fn stop_read_transaction(&self) {
        let transaction = self
            .transaction
            .lock()
            .take()
            .unwrap_or_else(|| panic!("no read transaction is active"));

        self.locked.unlock(
            self.index_of(transaction.aligned_begin),
            self.index_of(transaction.aligned_end),
        );
        self.sync.finished_read(transaction.end - self.history as i64);
        self.reading.store(false, Ordering::Release);
    }

    /// Samples of the active window that hold no valid data
    ///
    /// The result is relative to the start of the window. A window whose
    /// data did not arrive in time is flagged entirely under
    /// [`LateDataPolicy::FlagWindow`].
    pub fn read_flags(&self) -> SparseSet {
        let guard = self.transaction.lock();
        let transaction = Self::active(&guard);
        let begin = transaction.begin.time();
        let end = transaction.end.time();

        if transaction.status == ReadStatus::Incomplete
            && self.late_data_policy == LateDataPolicy::FlagWindow
        {
            let mut flags = SparseSet::new();
            flags.include(0, end - begin);
            return flags;
        }

        transaction.valid.invert(begin, end).shifted(-begin)
    }

    /// Whether the writer covered the active window before the read started
    pub fn read_status(&self) -> ReadStatus {
        Self::active(&self.transaction.lock()).status
    }

    /// The padded window [`BeamletBuffer::send_subband`] transfers
    pub fn aligned_window(&self) -> AlignedWindow {
        let guard = self.transaction.lock();
        let transaction = Self::active(&guard);

        AlignedWindow {
            begin: transaction.aligned_begin,
            end: transaction.aligned_end,
            lead: (transaction.begin - transaction.aligned_begin) as usize,
            trail: (transaction.aligned_end - transaction.end) as usize,
        }
    }

    /// Write one subband of the active window to `out`
    ///
    /// The window is widened to the alignment unit on both sides, so up to
    /// one unit of neighbouring samples is included. Samples are written in
    /// their in-memory representation.
    pub fn send_subband<W: Write + ?Sized>(&self, out: &mut W, subband: usize) -> io::Result<()> {
        assert!(subband < self.subbands, "subband {} out of range", subband);

        let guard = self.transaction.lock();
        let transaction = Self::active(&guard);
        let count = (transaction.aligned_end - transaction.aligned_begin) as usize;

        for (offset, len) in self.segments(subband, self.index_of(transaction.aligned_begin), count) {
            // Shared: the window is locked by the read transaction
            let region = unsafe { self.samples.region(offset, len) };
            out.write_all(bytemuck::cast_slice(region))?;
        }

        Ok(())
    }

    /// Copy one subband of the active window, without padding, into `out`
    ///
    /// `out` must hold `count * polarizations` samples.
    pub fn read_samples(&self, subband: usize, out: &mut [S]) {
        assert!(subband < self.subbands, "subband {} out of range", subband);

        let guard = self.transaction.lock();
        let transaction = Self::active(&guard);
        let count = (transaction.end - transaction.begin) as usize;
        assert_eq!(out.len(), count * self.polarizations, "output slice has the wrong length");

        let mut filled = 0;
        for (offset, len) in self.segments(subband, self.index_of(transaction.begin), count) {
            let region = unsafe { self.samples.region(offset, len) };
            out[filled..filled + len].copy_from_slice(region);
            filled += len;
        }
    }

    /// Signal that no more data will be written
    pub fn no_more_writes(&self) {
        self.sync.no_more_writes();
    }

    /// Signal that no more data will be read
    pub fn no_more_reads(&self) {
        self.sync.no_more_reads();
    }

    /// Snapshot of the times currently holding valid data
    pub fn valid_ranges(&self) -> SparseSet {
        self.valid.lock().ranges.clone()
    }

    /// Time up to which writers have deposited data
    pub fn written_until(&self) -> TimeStamp {
        self.sync.written_until()
    }

    /// Snapshot of the activity counters
    pub fn stats(&self) -> BufferStats {
        BufferStats {
            samples_written: self.samples_written.load(Ordering::Relaxed),
            late_writes: self.late_writes.load(Ordering::Relaxed),
            read_transactions: self.read_transactions.load(Ordering::Relaxed),
        }
    }

    /// Samples per subband
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of subbands
    pub fn subbands(&self) -> usize {
        self.subbands
    }

    /// Polarizations per sample
    pub fn polarizations(&self) -> usize {
        self.polarizations
    }

    /// Alignment unit of subband transfers, in samples
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Largest span a read of `count` samples from `begin` on can lock once
    /// padded to the alignment
    ///
    /// Windows stepping on from `begin` by `count` stay aligned only when
    /// both are multiples of the alignment; otherwise any of them may pick
    /// up one extra unit.
    pub fn padded_span(&self, begin: TimeStamp, count: usize) -> usize {
        let unit = self.alignment;
        let rounded = count.div_ceil(unit) * unit;
        if begin.time().rem_euclid(unit as i64) == 0 && count % unit == 0 {
            rounded
        } else {
            rounded + unit
        }
    }

    fn active(transaction: &Option<ReadTransaction>) -> &ReadTransaction {
        transaction
            .as_ref()
            .unwrap_or_else(|| panic!("no read transaction is active"))
    }

    fn index_of(&self, time: TimeStamp) -> usize {
        time.time().rem_euclid(self.capacity as i64) as usize
    }

    /// Round `[begin, end)` outward to the alignment unit
    fn align(&self, begin: TimeStamp, end: TimeStamp) -> (TimeStamp, TimeStamp) {
        let unit = self.alignment as i64;
        let aligned_begin = begin - begin.time().rem_euclid(unit);
        let aligned_end = end + (unit - end.time().rem_euclid(unit)) % unit;
        (aligned_begin, aligned_end)
    }

    /// Storage regions, as `(offset, len)` in samples, holding `count`
    /// times of `subband` from `start_index` on; the second wraps to index 0
    fn segments(&self, subband: usize, start_index: usize, count: usize) -> [(usize, usize); 2] {
        let row = subband * self.capacity;
        let first = (self.capacity - start_index).min(count);

        [
            ((row + start_index) * self.polarizations, first * self.polarizations),
            (row * self.polarizations, (count - first) * self.polarizations),
        ]
    }
}

impl<S> Drop for BeamletBuffer<S> {
    fn drop(&mut self) {
        log::debug!(
            "beamlet buffer released: {} samples written, {} late writes, {} reads",
            self.samples_written.load(Ordering::Relaxed),
            self.late_writes.load(Ordering::Relaxed),
            self.read_transactions.load(Ordering::Relaxed)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::DEFAULT_CLOCK_SPEED;
    use std::sync::Arc;
    use std::thread;

    fn stamp(time: i64) -> TimeStamp {
        TimeStamp::new(time, DEFAULT_CLOCK_SPEED)
    }

    fn config(capacity: usize, subbands: usize, alignment: usize) -> BufferConfig {
        BufferConfig {
            capacity,
            subbands,
            polarizations: 2,
            history: 0,
            mode: SyncMode::TimeWindowed,
            max_network_delay_ms: 20,
            alignment,
            ..BufferConfig::default()
        }
    }

    fn pattern(subband: usize, time: i64, pol: usize) -> u32 {
        ((subband as u32) << 24) | ((time as u32) << 4) | pol as u32
    }

    fn block(subbands: usize, begin: i64, count: usize) -> Vec<u32> {
        let mut data = Vec::with_capacity(subbands * count * 2);
        for sb in 0..subbands {
            for t in begin..begin + count as i64 {
                for pol in 0..2 {
                    data.push(pattern(sb, t, pol));
                }
            }
        }
        data
    }

    fn expected(subband: usize, begin: i64, count: usize) -> Vec<u32> {
        block(subband + 1, begin, count)[subband * count * 2..].to_vec()
    }

    #[test]
    fn test_write_read_with_wraparound() {
        let buffer = BeamletBuffer::<u32>::new(&config(64, 2, 1), stamp(0)).unwrap();

        buffer.write_elements(&block(2, 0, 40), stamp(0), 40);
        buffer.write_elements(&block(2, 40, 40), stamp(40), 40);

        // [30, 70) crosses the end of the array
        buffer.start_read_transaction(stamp(30), 40);
        assert!(buffer.read_flags().is_empty());

        for sb in 0..2 {
            let mut out = Vec::new();
            buffer.send_subband(&mut out, sb).unwrap();
            assert_eq!(out, bytemuck::cast_slice::<u32, u8>(&expected(sb, 30, 40)));

            let mut samples = vec![0u32; 80];
            buffer.read_samples(sb, &mut samples);
            assert_eq!(samples, expected(sb, 30, 40));
        }
        buffer.stop_read_transaction();

        assert_eq!(buffer.stats().samples_written, 80);
        assert_eq!(buffer.stats().read_transactions, 1);
    }

    #[test]
    fn test_missing_data_flags_whole_window() {
        let buffer = BeamletBuffer::<u32>::new(&config(64, 1, 1), stamp(0)).unwrap();
        buffer.no_more_writes();

        buffer.start_read_transaction(stamp(10), 20);
        assert_eq!(buffer.read_status(), ReadStatus::Incomplete);
        assert_eq!(buffer.read_flags().ranges(), &[0..20]);
        buffer.stop_read_transaction();
    }

    #[test]
    fn test_partial_data_flags_missing_samples() {
        let cfg = BufferConfig {
            late_data_policy: LateDataPolicy::FlagMissing,
            ..config(64, 1, 1)
        };
        let buffer = BeamletBuffer::<u32>::new(&cfg, stamp(0)).unwrap();

        buffer.write_elements(&block(1, 0, 10), stamp(0), 10);
        buffer.write_elements(&block(1, 15, 5), stamp(15), 5);
        buffer.no_more_writes();

        buffer.start_read_transaction(stamp(5), 20);
        assert_eq!(buffer.read_flags().ranges(), &[5..10, 15..20]);
        buffer.stop_read_transaction();
    }

    #[test]
    fn test_old_data_is_evicted() {
        let buffer = BeamletBuffer::<u32>::new(&config(64, 1, 1), stamp(0)).unwrap();

        buffer.write_elements(&block(1, 0, 64), stamp(0), 64);
        buffer.start_read_transaction(stamp(0), 32);
        buffer.stop_read_transaction();

        buffer.write_elements(&block(1, 64, 16), stamp(64), 16);
        assert_eq!(buffer.valid_ranges().ranges(), &[16..80]);
    }

    #[test]
    fn test_stale_write_is_dropped() {
        let buffer = BeamletBuffer::<u32>::new(&config(64, 1, 1), stamp(0)).unwrap();

        buffer.write_elements(&block(1, 0, 64), stamp(0), 64);
        buffer.start_read_transaction(stamp(0), 64);
        buffer.stop_read_transaction();
        buffer.write_elements(&block(1, 64, 64), stamp(64), 64);

        // entirely behind the newest data by more than the capacity
        buffer.write_elements(&block(1, 0, 32), stamp(0), 32);
        assert_eq!(buffer.stats().late_writes, 1);
        assert_eq!(buffer.valid_ranges().ranges(), &[64..128]);
    }

    #[test]
    fn test_aligned_window() {
        let buffer = BeamletBuffer::<u32>::new(&config(64, 1, 8), stamp(0)).unwrap();
        buffer.write_elements(&block(1, 0, 40), stamp(0), 40);

        buffer.start_read_transaction(stamp(13), 16);
        let window = buffer.aligned_window();
        assert_eq!(window.begin, stamp(8));
        assert_eq!(window.end, stamp(32));
        assert_eq!(window.lead, 5);
        assert_eq!(window.trail, 3);

        let mut out = Vec::new();
        buffer.send_subband(&mut out, 0).unwrap();
        assert_eq!(out, bytemuck::cast_slice::<u32, u8>(&expected(0, 8, 24)));
        buffer.stop_read_transaction();
    }

    #[test]
    #[should_panic(expected = "already active")]
    fn test_second_transaction_panics() {
        let buffer = BeamletBuffer::<u32>::new(&config(64, 1, 1), stamp(0)).unwrap();
        buffer.write_elements(&block(1, 0, 32), stamp(0), 32);

        buffer.start_read_transaction(stamp(0), 8);
        buffer.start_read_transaction(stamp(8), 8);
    }

    #[test]
    #[should_panic(expected = "no read transaction")]
    fn test_flags_outside_transaction_panics() {
        let buffer = BeamletBuffer::<u32>::new(&config(64, 1, 1), stamp(0)).unwrap();
        buffer.read_flags();
    }

    #[test]
    fn test_writer_and_reader_threads() {
        const BLOCK: usize = 16;
        const BLOCKS: i64 = 64;

        let cfg = BufferConfig {
            mode: SyncMode::Synchronous,
            ..config(64, 2, 1)
        };
        let buffer = Arc::new(BeamletBuffer::<u32>::new(&cfg, stamp(0)).unwrap());

        let writer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                for b in 0..BLOCKS {
                    let begin = b * BLOCK as i64;
                    buffer.write_elements(&block(2, begin, BLOCK), stamp(begin), BLOCK);
                }
                buffer.no_more_writes();
            })
        };

        let mut samples = vec![0u32; BLOCK * 2];
        for b in 0..BLOCKS {
            let begin = b * BLOCK as i64;
            buffer.start_read_transaction(stamp(begin), BLOCK);
            assert!(buffer.read_flags().is_empty(), "block {} flagged", b);

            for sb in 0..2 {
                buffer.read_samples(sb, &mut samples);
                assert_eq!(samples, expected(sb, begin, BLOCK), "block {} subband {}", b, sb);
            }
            buffer.stop_read_transaction();
        }

        writer.join().unwrap();
        assert_eq!(buffer.stats().samples_written, (BLOCK as u64) * BLOCKS as u64);
    }
}
