//! Beamlet Pipeline - station sample buffering and real-time output
//! dispatch for a radio-telescope correlator.
//!
//! # Overview
//!
//! The pipeline has two halves:
//!
//! 1. A circular, time-indexed sample buffer ([`BeamletBuffer`]) written by
//!    network receivers and read in transactions by a processing thread
//! 2. Output dispatch: filled blocks travel through a [`Pool`] to one
//!    [`OutputThread`] per downstream stream
//!
//! A [`SubbandReader`] connects the two, reading consecutive windows from the
//! buffer and turning each subband into a [`SubbandBlock`].
//!
//! # Key Features
//!
//! - Concurrent writers and a reader on disjoint parts of the buffer
//! - Lock-step or wall-clock pacing of the writer against the reader
//! - Missing or late samples reported as flags, never as errors
//! - Alignment-padded subband transfers
//! - Bounded, process-wide number of concurrent stream writers
//! - Output failures contained in the dispatch thread and counted
//!
//! # Usage
//!
//! 1. Load and validate a [`PipelineConfig`]
//! 2. Create the buffer, one pool and output thread per subband, and the
//!    shared [`PipelineResources`]
//! 3. Start the subband reader and feed samples with
//!    [`BeamletBuffer::write_elements`]
//! 4. Signal the end of input and finish the output threads
//!
//! See the `demos` directory for a complete program.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod memory;
pub mod output;
pub mod time;

pub use config::{BufferConfig, LateDataPolicy, OutputConfig, PipelineConfig, SyncMode};
pub use error::{PipelineError, Result};
pub use memory::beamlet::{AlignedWindow, BeamletBuffer, BufferStats};
pub use memory::locked_ranges::LockedRanges;
pub use memory::sparse_set::SparseSet;
pub use memory::sync::{ReadStatus, ReaderWriterSynchronizer, SynchronizedReaderWriter, TimeSynchronizedReaderWriter};
pub use output::pool::Pool;
pub use output::queue::{Queue, QueueStats};
pub use output::stream::{connector_from_descriptor, Connector, StreamDescriptor};
pub use output::thread::{OutputState, OutputStats, OutputThread};
pub use output::{OutputBlock, PipelineResources, SubbandBlock};
pub use time::wall_clock::WallClock;
pub use time::TimeStamp;

use bytemuck::Pod;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Windows read by a [`SubbandReader`]
#[derive(Debug, Clone, Copy)]
pub struct ReaderConfig {
    /// Start of the first window
    pub first_window: TimeStamp,
    /// Samples per window
    pub window_samples: usize,
    /// Stop after this many windows; `None` runs until stopped
    pub windows: Option<u64>,
}

/// Handle of the thread moving windows from the sample buffer into output pools
pub struct SubbandReader {
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<u64>>,
}

impl SubbandReader {
    /// Ask the reader to stop after the current window
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait for the reader to exit; returns the number of windows read
    pub fn join(mut self) -> u64 {
        match self.handle.take().map(|handle| handle.join()) {
            Some(Ok(windows)) => windows,
            Some(Err(_)) => {
                log::error!("subband reader panicked");
                0
            }
            None => 0,
        }
    }
}

impl Drop for SubbandReader {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop();
            let _ = handle.join();
        }
    }
}

/// Releases the buffer's writer and ends every output stream when the
/// reader thread exits, including by panic
struct ReaderExit<S: Pod + Send + Sync> {
    buffer: Arc<BeamletBuffer<S>>,
    pools: Vec<Arc<Pool<SubbandBlock>>>,
}

impl<S: Pod + Send + Sync> Drop for ReaderExit<S> {
    fn drop(&mut self) {
        if thread::panicking() {
            log::error!("subband reader failed, ending {} output streams", self.pools.len());
        }

        self.buffer.no_more_reads();
        for pool in &self.pools {
            pool.filled.append_untimed(None);
        }
    }
}

/// Start reading consecutive windows from `buffer`, one pool per subband
///
/// Each window becomes one [`SubbandBlock`] per subband, numbered by window
/// index. When the reader exits it releases the buffer's writer and appends
/// the end-of-stream marker to every pool.
///
/// Fails with [`PipelineError::Config`] unless there is one pool per subband
/// and every window, padded to the alignment, fits in the buffer.
pub fn start_subband_reader<S: Pod + Send + Sync + 'static>(
    buffer: Arc<BeamletBuffer<S>>,
    pools: Vec<Arc<Pool<SubbandBlock>>>,
    config: ReaderConfig,
) -> Result<SubbandReader> {
    if pools.len() != buffer.subbands() {
        return Err(PipelineError::Config(format!(
            "{} output pools for {} subbands",
            pools.len(),
            buffer.subbands()
        )));
    }
    if config.window_samples == 0 {
        return Err(PipelineError::Config("empty read window".to_string()));
    }
    let span = buffer.padded_span(config.first_window, config.window_samples);
    if span > buffer.capacity() {
        return Err(PipelineError::Config(format!(
            "window of {} samples spans up to {} aligned samples, more than the buffer's {}",
            config.window_samples,
            span,
            buffer.capacity()
        )));
    }

    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();

    let handle = thread::Builder::new()
        .name("subband-reader".to_string())
        .spawn(move || {
            let exit = ReaderExit { buffer, pools };
            let mut begin = config.first_window;
            let mut sequence = 0u64;

            while flag.load(Ordering::SeqCst) && config.windows.map_or(true, |n| sequence < n) {
                exit.buffer.start_read_transaction(begin, config.window_samples);

                for (subband, pool) in exit.pools.iter().enumerate() {
                    let mut block = pool.free.remove();
                    match block.fill_from(&exit.buffer, subband, sequence) {
                        Ok(()) => pool.filled.append(Some(block)),
                        Err(err) => {
                            log::error!("subband {}: cannot fill block {}: {}", subband, sequence, err);
                            pool.free.append_untimed(block);
                        }
                    }
                }

                exit.buffer.stop_read_transaction();
                begin += config.window_samples as i64;
                sequence += 1;
            }

            log::info!("subband reader stopped after {} windows", sequence);
            sequence
        })?;

    Ok(SubbandReader {
        running,
        handle: Some(handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn lock_step_buffer(capacity: usize, alignment: usize) -> Arc<BeamletBuffer<u32>> {
        let config = BufferConfig {
            capacity,
            subbands: 1,
            history: 0,
            mode: SyncMode::Synchronous,
            alignment,
            ..BufferConfig::default()
        };
        Arc::new(BeamletBuffer::new(&config, TimeStamp::new(0, config.clock_speed)).unwrap())
    }

    fn pools(count: usize) -> Vec<Arc<Pool<SubbandBlock>>> {
        (0..count)
            .map(|i| Arc::new(Pool::with_blocks(&format!("reader-{}", i), 2, || SubbandBlock::with_capacity(64))))
            .collect()
    }

    fn reader_config(first_window: i64, window_samples: usize) -> ReaderConfig {
        ReaderConfig {
            first_window: TimeStamp::new(first_window, time::DEFAULT_CLOCK_SPEED),
            window_samples,
            windows: Some(4),
        }
    }

    /// Windows whose alignment padding would outgrow the buffer are refused up front
    #[test]
    fn test_rejects_windows_that_pad_past_capacity() {
        let buffer = lock_step_buffer(64, 8);

        for (first, samples) in [(0, 62), (0, 0), (4, 64), (0, 65), (4, 57)] {
            let result = start_subband_reader(buffer.clone(), pools(1), reader_config(first, samples));
            assert!(
                matches!(result, Err(PipelineError::Config(_))),
                "window of {} from {} was accepted",
                samples,
                first
            );
        }

        assert!(matches!(
            start_subband_reader(buffer.clone(), pools(2), reader_config(0, 32)),
            Err(PipelineError::Config(_))
        ));
    }

    /// Padded spans of aligned and unaligned window sequences
    #[test]
    fn test_padded_span() {
        let buffer = lock_step_buffer(64, 8);
        let stamp = |t| TimeStamp::new(t, time::DEFAULT_CLOCK_SPEED);

        assert_eq!(buffer.padded_span(stamp(0), 64), 64);
        assert_eq!(buffer.padded_span(stamp(16), 8), 8);
        assert_eq!(buffer.padded_span(stamp(0), 62), 72);
        assert_eq!(buffer.padded_span(stamp(3), 56), 64);
        assert_eq!(buffer.padded_span(stamp(3), 1), 16);
    }

    /// The largest accepted unaligned window reads without panicking
    #[test]
    fn test_unaligned_windows_within_capacity() {
        let buffer = lock_step_buffer(64, 8);
        let pools = pools(1);

        let writer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                for begin in (0..4 * 56).step_by(8) {
                    let data: Vec<u32> = (begin..begin + 8).flat_map(|t| [t as u32, t as u32]).collect();
                    buffer.write_elements(&data, TimeStamp::new(begin, time::DEFAULT_CLOCK_SPEED), 8);
                }
                buffer.no_more_writes();
            })
        };

        let consumer = {
            let pool = pools[0].clone();
            thread::spawn(move || {
                let mut leads = Vec::new();
                while let Some(block) = pool.filled.remove() {
                    leads.push(block.lead);
                    pool.free.append_untimed(block);
                }
                leads
            })
        };

        let reader = start_subband_reader(buffer, pools, reader_config(4, 52)).unwrap();
        assert_eq!(reader.join(), 4);
        writer.join().unwrap();
        assert_eq!(consumer.join().unwrap(), vec![4, 0, 4, 0]);
    }

    /// A reader thread that dies still releases the writer and ends every stream
    #[test]
    fn test_exit_path_runs_on_panic() {
        let buffer = lock_step_buffer(64, 8);
        let pools = pools(2);

        // fill the buffer so the next lock-step write waits for the reader
        let full: Vec<u32> = vec![0; 64 * 2];
        buffer.write_elements(&full, TimeStamp::new(0, time::DEFAULT_CLOCK_SPEED), 64);

        let writer = {
            let buffer = buffer.clone();
            thread::spawn(move || {
                buffer.write_elements(&[0; 16], TimeStamp::new(64, time::DEFAULT_CLOCK_SPEED), 8);
            })
        };

        let reader = {
            let exit = ReaderExit {
                buffer: buffer.clone(),
                pools: pools.clone(),
            };
            thread::spawn(move || {
                let _exit = exit;
                panic!("reader failure");
            })
        };
        assert!(reader.join().is_err());

        let started = Instant::now();
        while !writer.is_finished() {
            assert!(started.elapsed() < Duration::from_secs(5), "writer still blocked");
            thread::sleep(Duration::from_millis(5));
        }
        writer.join().unwrap();

        for pool in &pools {
            assert!(pool.filled.remove().is_none());
        }
    }
}
