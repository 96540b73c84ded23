//! Hand-off of finished data blocks to downstream storage
//!
//! Processing threads fill blocks taken from a [`Pool`](pool::Pool) and push
//! them onto its `filled` queue. One [`OutputThread`](thread::OutputThread)
//! per stream serializes them onto a network or file stream and hands them
//! back to the pool's `free` queue.
//!
//! The dispatch thread only needs to know a block's sequence number and how
//! to serialize it, which is the [`OutputBlock`] trait. [`SubbandBlock`] is
//! the block type carrying one subband of station samples with its flags:
//!
//! ```text
//! [sequence number: u64]   only when requested
//! marker: u16 = 0x4C4F     version: u16
//! subband: u32             begin time: i64
//! sample count: u32        lead samples: u32
//! payload bytes: u32       flag bytes: u32
//! crc32 of payload: u32
//! payload                  flags (marshalled SparseSet)
//! ```
//!
//! All integers are little-endian.

pub mod pool;
pub mod queue;
pub mod semaphore;
pub mod stream;
pub mod thread;

use crate::config::OutputConfig;
use crate::memory::beamlet::BeamletBuffer;
use crate::memory::sparse_set::SparseSet;
use semaphore::Semaphore;
use crate::time::TimeStamp;
use bytemuck::Pod;
use crc32fast::Hasher;
use std::io::{self, Read, Write};

/// A unit of output that can be put on a stream
pub trait OutputBlock: Send {
    /// Monotonically increasing number used to detect dropped blocks
    fn sequence_number(&self) -> u64;

    /// Serialize the block, optionally preceded by its sequence number
    fn write(&self, stream: &mut dyn Write, with_sequence_number: bool) -> io::Result<()>;
}

/// Fixed-size header in front of every [`SubbandBlock`] payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Marker identifying a valid block
    pub marker: u16,
    /// Format version
    pub version: u16,
    /// Subband index
    pub subband: u32,
    /// Sample time of the first sample in the payload
    pub begin_time: i64,
    /// Samples (times) in the payload
    pub sample_count: u32,
    /// Padding samples before the requested window
    pub lead: u32,
    /// Payload size in bytes
    pub payload_size: u32,
    /// Size of the marshalled flags in bytes
    pub flag_size: u32,
    /// CRC32 of the payload
    pub crc32: u32,
}

impl BlockHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 36;

    /// Marker value for valid blocks
    pub const MARKER: u16 = 0x4C4F;

    /// Current block format version
    pub const VERSION: u16 = 1;

    /// Check if this header represents a valid block
    pub fn is_valid(&self) -> bool {
        self.marker == Self::MARKER
    }

    /// Write the header in little-endian byte order
    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> io::Result<()> {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..2].copy_from_slice(&self.marker.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.version.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.subband.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.begin_time.to_le_bytes());
        bytes[16..20].copy_from_slice(&self.sample_count.to_le_bytes());
        bytes[20..24].copy_from_slice(&self.lead.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.payload_size.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.flag_size.to_le_bytes());
        bytes[32..36].copy_from_slice(&self.crc32.to_le_bytes());
        out.write_all(&bytes)
    }

    /// Read a header written by [`BlockHeader::write_to`]
    pub fn read_from<R: Read + ?Sized>(input: &mut R) -> io::Result<Self> {
        let mut bytes = [0u8; Self::SIZE];
        input.read_exact(&mut bytes)?;

        let u16_at = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);

        let mut begin = [0u8; 8];
        begin.copy_from_slice(&bytes[8..16]);

        Ok(Self {
            marker: u16_at(0),
            version: u16_at(2),
            subband: u32_at(4),
            begin_time: i64::from_le_bytes(begin),
            sample_count: u32_at(16),
            lead: u32_at(20),
            payload_size: u32_at(24),
            flag_size: u32_at(28),
            crc32: u32_at(32),
        })
    }
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// One subband of station samples for a time window, with its flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubbandBlock {
    /// Sequence number of this block on its stream
    pub sequence_number: u64,
    /// Subband index
    pub subband: u32,
    /// Sample time of the first payload sample
    pub begin_time: i64,
    /// Samples (times) in the payload
    pub sample_count: u32,
    /// Padding samples before the requested window
    pub lead: u32,
    /// Raw sample bytes
    pub payload: Vec<u8>,
    /// Flagged samples relative to the requested window
    pub flags: SparseSet,
}

impl SubbandBlock {
    /// Create an empty block whose payload can hold `payload_capacity` bytes
    /// without reallocating
    pub fn with_capacity(payload_capacity: usize) -> Self {
        Self {
            payload: Vec::with_capacity(payload_capacity),
            ..Self::default()
        }
    }

    /// Fill the block from the buffer's active read transaction
    pub fn fill_from<S: Pod + Send + Sync>(
        &mut self,
        buffer: &BeamletBuffer<S>,
        subband: usize,
        sequence_number: u64,
    ) -> io::Result<()> {
        let window = buffer.aligned_window();

        self.payload.clear();
        buffer.send_subband(&mut self.payload, subband)?;

        self.sequence_number = sequence_number;
        self.subband = subband as u32;
        self.begin_time = window.begin.time();
        self.sample_count = (window.end - window.begin) as u32;
        self.lead = window.lead as u32;
        self.flags = buffer.read_flags();
        Ok(())
    }

    /// First sample time of the payload
    pub fn begin(&self, clock_speed: u32) -> TimeStamp {
        TimeStamp::new(self.begin_time, clock_speed)
    }

    /// Header describing the current contents
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            marker: BlockHeader::MARKER,
            version: BlockHeader::VERSION,
            subband: self.subband,
            begin_time: self.begin_time,
            sample_count: self.sample_count,
            lead: self.lead,
            payload_size: self.payload.len() as u32,
            flag_size: self.flags.marshalled_size() as u32,
            crc32: checksum(&self.payload),
        }
    }

    /// Read a block written by [`OutputBlock::write`]
    ///
    /// Fails with [`io::ErrorKind::InvalidData`] on a bad marker or checksum.
    pub fn read_from<R: Read + ?Sized>(input: &mut R, with_sequence_number: bool) -> io::Result<Self> {
        let sequence_number = if with_sequence_number {
            let mut bytes = [0u8; 8];
            input.read_exact(&mut bytes)?;
            u64::from_le_bytes(bytes)
        } else {
            0
        };

        let header = BlockHeader::read_from(input)?;
        if !header.is_valid() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad block marker 0x{:04x}", header.marker),
            ));
        }

        let mut payload = vec![0u8; header.payload_size as usize];
        input.read_exact(&mut payload)?;
        if checksum(&payload) != header.crc32 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "block checksum mismatch"));
        }

        let flags = SparseSet::unmarshall(input)?;

        Ok(Self {
            sequence_number,
            subband: header.subband,
            begin_time: header.begin_time,
            sample_count: header.sample_count,
            lead: header.lead,
            payload,
            flags,
        })
    }
}

impl OutputBlock for SubbandBlock {
    fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    fn write(&self, stream: &mut dyn Write, with_sequence_number: bool) -> io::Result<()> {
        if with_sequence_number {
            stream.write_all(&self.sequence_number.to_le_bytes())?;
        }

        self.header().write_to(stream)?;
        stream.write_all(&self.payload)?;
        self.flags.marshall(stream)
    }
}

/// Resources shared by all output threads of a process
///
/// Holds the semaphore bounding how many threads write at the same time.
/// Create one per pipeline and hand it to every
/// [`OutputThread`](thread::OutputThread).
#[derive(Debug)]
pub struct PipelineResources {
    writers: Semaphore,
}

impl PipelineResources {
    /// Allow `max_concurrent_writers` threads to write at the same time
    pub fn new(max_concurrent_writers: usize) -> Self {
        Self {
            writers: Semaphore::new(max_concurrent_writers),
        }
    }

    /// Resources sized by the output configuration
    pub fn from_config(config: &OutputConfig) -> Self {
        Self::new(config.max_concurrent_writers)
    }

    /// Semaphore limiting concurrent writers
    pub fn writers(&self) -> &Semaphore {
        &self.writers
    }

    /// Stop every output thread waiting for, or later asking for, a writer permit
    pub fn abort(&self) {
        log::warn!("aborting all output streams");
        self.writers.abort();
    }
}
