//! Dispatch thread writing filled blocks to one downstream stream
//!
//! The thread connects lazily, then takes blocks from the pool's `filled`
//! queue, writes them while holding one of the process-wide writer permits,
//! and hands them back to the `free` queue. A `None` on the `filled` queue
//! ends the stream.
//!
//! If the stream cannot be opened, or a write fails, the thread keeps
//! draining the `filled` queue and recycling blocks so that producers never
//! stall on an unreachable receiver. Such blocks count as discarded.

use super::pool::Pool;
use super::stream::{Connector, OutputStream};
use super::{OutputBlock, PipelineResources};
use crate::error::Result;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Lifecycle of an output thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    /// Opening the stream
    Connecting,
    /// Writing blocks
    Streaming,
    /// End of stream reached, or the stream failed and was closed
    Closed,
    /// Stopped by [`OutputThread::abort`] or a pipeline-wide abort
    Aborted,
}

/// Block counters of an output thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputStats {
    /// Blocks written to the stream
    pub written: u64,
    /// Blocks missing from the sequence, lost before reaching this thread
    pub dropped: u64,
    /// Blocks received but never written
    pub discarded: u64,
}

struct Shared {
    state: Mutex<OutputState>,
    aborted: AtomicBool,
    written: CachePadded<AtomicU64>,
    dropped: CachePadded<AtomicU64>,
    discarded: CachePadded<AtomicU64>,
}

impl Shared {
    fn set_state(&self, state: OutputState) {
        *self.state.lock() = state;
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

enum Flow {
    EndOfStream,
    Aborted,
    Failed,
}

struct Worker<B> {
    name: String,
    pool: Arc<Pool<B>>,
    connector: Arc<dyn Connector>,
    resources: Arc<PipelineResources>,
    shared: Arc<Shared>,
    with_sequence_numbers: bool,
}

impl<B: OutputBlock> Worker<B> {
    fn run(&self) {
        let mut next_sequence = 0;
        let target = self.connector.description();

        log::info!("{}: connecting to {}", self.name, target);
        let flow = match self.connector.connect() {
            Ok(stream) => {
                self.shared.set_state(OutputState::Streaming);
                log::info!("{}: connected to {}", self.name, target);
                self.stream(stream, &mut next_sequence)
            }
            Err(_) if self.shared.is_aborted() => Flow::Aborted,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                log::warn!("{}: connecting to {} was interrupted", self.name, target);
                Flow::Failed
            }
            Err(err) => {
                log::error!("{}: cannot connect to {}: {}", self.name, target, err);
                Flow::Failed
            }
        };

        let flow = match flow {
            Flow::Failed => {
                self.shared.set_state(OutputState::Closed);
                self.discard_remaining(&mut next_sequence)
            }
            other => other,
        };

        match flow {
            Flow::Aborted => {
                self.shared.set_state(OutputState::Aborted);
                log::warn!("{}: aborted", self.name);
            }
            _ => {
                self.shared.set_state(OutputState::Closed);
                log::info!("{}: end of stream", self.name);
            }
        }
    }

    fn stream(&self, mut stream: OutputStream, next_sequence: &mut u64) -> Flow {
        loop {
            let Some(block) = self.pool.filled.remove() else {
                return self.end_of_stream();
            };
            if self.shared.is_aborted() {
                self.pool.filled.prepend(Some(block));
                return Flow::Aborted;
            }
            self.track_sequence(next_sequence, block.sequence_number());

            let result = {
                let Some(_permit) = self.resources.writers().acquire_unless(&self.shared.aborted) else {
                    self.pool.filled.prepend(Some(block));
                    return Flow::Aborted;
                };
                OutputBlock::write(&*block, &mut *stream, self.with_sequence_numbers)
                    .and_then(|()| stream.flush())
            };

            match result {
                Ok(()) => {
                    self.shared.written.fetch_add(1, Ordering::Relaxed);
                    self.pool.free.append(block);
                }
                Err(err) => {
                    self.shared.discarded.fetch_add(1, Ordering::Relaxed);
                    self.pool.free.append(block);
                    if self.shared.is_aborted() {
                        return Flow::Aborted;
                    }
                    log::error!(
                        "{}: writing to {} failed: {}",
                        self.name,
                        self.connector.description(),
                        err
                    );
                    return Flow::Failed;
                }
            }
        }
    }

    fn discard_remaining(&self, next_sequence: &mut u64) -> Flow {
        let mut discarded = 0u64;
        let flow = loop {
            let Some(block) = self.pool.filled.remove() else {
                break self.end_of_stream();
            };
            if self.shared.is_aborted() {
                self.pool.filled.prepend(Some(block));
                break Flow::Aborted;
            }
            self.track_sequence(next_sequence, block.sequence_number());
            self.pool.free.append(block);
            discarded += 1;
        };

        if discarded > 0 {
            self.shared.discarded.fetch_add(discarded, Ordering::Relaxed);
            log::warn!("{}: discarded {} blocks without a stream", self.name, discarded);
        }
        flow
    }

    fn end_of_stream(&self) -> Flow {
        if self.shared.is_aborted() {
            Flow::Aborted
        } else {
            Flow::EndOfStream
        }
    }

    fn track_sequence(&self, next_sequence: &mut u64, sequence: u64) {
        if sequence > *next_sequence {
            self.shared
                .dropped
                .fetch_add(sequence - *next_sequence, Ordering::Relaxed);
        } else if sequence < *next_sequence {
            log::warn!(
                "{}: block {} arrived after block {}",
                self.name,
                sequence,
                *next_sequence - 1
            );
            return;
        }
        *next_sequence = sequence + 1;
    }
}

/// Owns the dispatch thread of one output stream
pub struct OutputThread<B: OutputBlock + 'static> {
    name: String,
    pool: Arc<Pool<B>>,
    connector: Arc<dyn Connector>,
    resources: Arc<PipelineResources>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl<B: OutputBlock + 'static> OutputThread<B> {
    /// Spawn a named thread writing the blocks of `pool` through `connector`
    ///
    /// With `with_sequence_numbers` every block is preceded by its sequence
    /// number on the stream.
    pub fn start(
        name: impl Into<String>,
        pool: Arc<Pool<B>>,
        connector: Box<dyn Connector>,
        resources: Arc<PipelineResources>,
        with_sequence_numbers: bool,
    ) -> Result<Self> {
        let name = name.into();
        let connector: Arc<dyn Connector> = Arc::from(connector);
        let shared = Arc::new(Shared {
            state: Mutex::new(OutputState::Connecting),
            aborted: AtomicBool::new(false),
            written: CachePadded::new(AtomicU64::new(0)),
            dropped: CachePadded::new(AtomicU64::new(0)),
            discarded: CachePadded::new(AtomicU64::new(0)),
        });

        let worker = Worker {
            name: name.clone(),
            pool: pool.clone(),
            connector: connector.clone(),
            resources: resources.clone(),
            shared: shared.clone(),
            with_sequence_numbers,
        };

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run())?;

        Ok(Self {
            name,
            pool,
            connector,
            resources,
            shared,
            handle: Some(handle),
        })
    }

    /// Thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> OutputState {
        *self.shared.state.lock()
    }

    /// Counters so far
    pub fn stats(&self) -> OutputStats {
        OutputStats {
            written: self.shared.written.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
        }
    }

    /// Stop as soon as possible, even in the middle of connecting or waiting
    /// for a writer permit
    ///
    /// Blocks still queued are counted as discarded once the thread is
    /// joined.
    pub fn abort(&self) {
        self.shared.aborted.store(true, Ordering::Release);
        self.pool.filled.prepend(None);
        self.connector.interrupt();
        self.resources.writers().wake();
    }

    /// Signal the end of the stream and wait for the thread to write
    /// everything queued before it
    pub fn finish(&mut self) -> OutputStats {
        if self.handle.is_some() {
            self.pool.filled.append_untimed(None);
        }
        self.join();
        self.stats()
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("{}: output thread panicked", self.name);
            }
        }

        let leftover = self
            .pool
            .filled
            .drain()
            .into_iter()
            .flatten()
            .map(|block| self.pool.free.append_untimed(block))
            .count() as u64;

        if leftover > 0 {
            self.shared.discarded.fetch_add(leftover, Ordering::Relaxed);
            log::warn!("{}: {} blocks were never written", self.name, leftover);
        }
    }
}

impl<B: OutputBlock + 'static> Drop for OutputThread<B> {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.abort();
        }
        self.join();

        let stats = self.stats();
        log::debug!(
            "{}: {} blocks written, {} dropped, {} discarded",
            self.name,
            stats.written,
            stats.dropped,
            stats.discarded
        );
    }
}
