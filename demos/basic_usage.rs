//! Basic usage example for the beamlet pipeline
//!
//! This example demonstrates:
//! 1. Loading an observation configuration from JSON
//! 2. Creating the sample buffer, output pools and output threads
//! 3. Feeding samples from a simulated station receiver thread
//! 4. Reading windows and dispatching one block per subband
//! 5. Reading a stream file back and inspecting its flags
//!
//! The simulated receiver loses one packet on purpose, so the matching
//! window carries flags. Output files are written to a temporary directory
//! which is cleaned up at the end.

use beamlet_pipeline::{
    connector_from_descriptor, start_subband_reader, BeamletBuffer, OutputThread, PipelineConfig,
    PipelineResources, Pool, ReaderConfig, SubbandBlock, TimeStamp,
};
use num_complex::Complex;

use std::sync::Arc;
use std::thread;

// Samples per receiver packet and per output block
const PACKET_SAMPLES: usize = 16;
const WINDOW_SAMPLES: usize = 256;
const WINDOWS: u64 = 32;

// Packet index the simulated receiver drops
const LOST_PACKET: usize = 100;

type Sample = Complex<i16>;

fn main() -> beamlet_pipeline::Result<()> {
    let out_dir = std::env::temp_dir().join(format!("beamlet-demo-{}", std::process::id()));
    std::fs::create_dir_all(&out_dir)?;
    println!("Writing subband streams to: {:?}", out_dir);

    let streams: Vec<String> = (0..4)
        .map(|subband| format!("file:{}", out_dir.join(format!("SB{:03}.raw", subband)).display()))
        .collect();

    let json = serde_json::json!({
        "buffer": {
            "capacity": 4096,
            "subbands": 4,
            "polarizations": 2,
            "history": 64,
            "mode": "synchronous",
            "alignment": 16
        },
        "output": {
            "max_concurrent_writers": 2,
            "pool_size": 4,
            "streams": streams
        }
    });
    let config = PipelineConfig::from_json_str(&json.to_string())?;

    let start = TimeStamp::from_seq_block(1_700_000_000, 0, config.buffer.clock_speed);
    println!("Observation starts at {}", start);

    // Sample buffer, shared by the receiver and the reader
    let buffer = Arc::new(BeamletBuffer::<Sample>::new(&config.buffer, start)?);
    let resources = Arc::new(PipelineResources::from_config(&config.output));

    // One pool and output thread per subband
    let pools: Vec<_> = (0..config.buffer.subbands)
        .map(|subband| {
            Arc::new(Pool::with_blocks(&format!("sb{}", subband), config.output.pool_size, || {
                SubbandBlock::with_capacity(WINDOW_SAMPLES * 2 * std::mem::size_of::<Sample>())
            }))
        })
        .collect();

    let mut outputs = Vec::new();
    for (subband, (descriptor, pool)) in config.output.streams.iter().zip(&pools).enumerate() {
        let connector = connector_from_descriptor(descriptor)?;
        outputs.push(OutputThread::start(
            format!("output-sb{}", subband),
            pool.clone(),
            connector,
            resources.clone(),
            true,
        )?);
    }

    let reader = start_subband_reader(
        buffer.clone(),
        pools.clone(),
        ReaderConfig {
            first_window: start,
            window_samples: WINDOW_SAMPLES,
            windows: Some(WINDOWS),
        },
    )?;

    // Simulated station: a tone per subband, one packet at a time
    let receiver = {
        let buffer = buffer.clone();
        let subbands = config.buffer.subbands;
        thread::Builder::new().name("receiver".to_string()).spawn(move || {
            let packets = WINDOW_SAMPLES * WINDOWS as usize / PACKET_SAMPLES;
            let mut packet = vec![Sample::new(0, 0); subbands * PACKET_SAMPLES * 2];

            for index in 0..packets {
                if index == LOST_PACKET {
                    continue;
                }

                let begin = start + (index * PACKET_SAMPLES) as i64;
                for subband in 0..subbands {
                    for t in 0..PACKET_SAMPLES {
                        let phase = (begin.time() + t as i64) as f64 * 0.01 * (subband + 1) as f64;
                        let value = Sample::new((phase.cos() * 1000.0) as i16, (phase.sin() * 1000.0) as i16);
                        let offset = (subband * PACKET_SAMPLES + t) * 2;
                        packet[offset] = value;
                        packet[offset + 1] = value;
                    }
                }
                buffer.write_elements(&packet, begin, PACKET_SAMPLES);
            }

            buffer.no_more_writes();
        })?
    };

    if receiver.join().is_err() {
        eprintln!("receiver thread panicked");
    }
    let windows = reader.join();
    println!("Read {} windows", windows);

    for output in &mut outputs {
        let stats = output.finish();
        println!(
            "{}: {} written, {} dropped, {} discarded",
            output.name(),
            stats.written,
            stats.dropped,
            stats.discarded
        );
    }

    let buffer_stats = buffer.stats();
    println!(
        "Buffer: {} samples written, {} late writes, {} read transactions",
        buffer_stats.samples_written, buffer_stats.late_writes, buffer_stats.read_transactions
    );

    // Read subband 0 back and report flagged windows
    let bytes = std::fs::read(out_dir.join("SB000.raw"))?;
    let mut input = bytes.as_slice();
    while !input.is_empty() {
        let block = SubbandBlock::read_from(&mut input, true)?;
        if !block.flags.is_empty() {
            println!(
                "Block {} starting at {} has {} flagged samples: {:?}",
                block.sequence_number,
                block.begin(config.buffer.clock_speed),
                block.flags.count(),
                block.flags.ranges()
            );
        }
    }

    std::fs::remove_dir_all(&out_dir)?;
    println!("Example completed successfully!");
    Ok(())
}
