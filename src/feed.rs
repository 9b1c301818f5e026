//! Reads an elementary stream in fixed-size chunks and pushes it through a
//! [`DecodeSession`], handing every decoded frame to a sink.

use std::io::{self, ErrorKind, Read};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::{BackendError, BoundedQueueRx, DecodeSession, DecodedFrame, bounded_queue};

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Iterator over chunks of at most `chunk_size` bytes. Every chunk but the last is full.
pub struct ChunkReader<R> {
    reader: R,
    chunk_size: usize,
    done: bool,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
            done: false,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn read_chunk(&mut self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; self.chunk_size];
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_chunk() {
            Ok(chunk) if chunk.is_empty() => {
                self.done = true;
                None
            }
            Ok(chunk) => {
                // A short chunk means the reader hit EOF.
                self.done = chunk.len() < self.chunk_size;
                Some(Ok(chunk))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedOptions {
    pub chunk_size: usize,
    /// Stop once this many frames have been handed to the sink.
    pub max_frames: Option<usize>,
}

impl Default for FeedOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frames: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeedStats {
    pub chunks: usize,
    pub bytes: usize,
    pub frames: usize,
    /// Time spent inside `decode`/`flush`, sink time excluded.
    pub decode_time: Duration,
}

impl FeedStats {
    pub fn frames_per_second(&self) -> f64 {
        let secs = self.decode_time.as_secs_f64();
        if secs > 0.0 {
            self.frames as f64 / secs
        } else {
            0.0
        }
    }
}

/// Decodes everything `reader` yields, then flushes the session.
pub fn run<R, F>(
    reader: R,
    session: &mut DecodeSession,
    options: &FeedOptions,
    sink: F,
) -> Result<FeedStats, BackendError>
where
    R: Read,
    F: FnMut(&DecodedFrame) -> Result<(), BackendError>,
{
    run_chunks(ChunkReader::new(reader, options.chunk_size), session, options, sink)
}

/// Reads chunks on a background thread; at most `capacity` chunks wait in the queue.
pub fn spawn_reader<R>(
    reader: R,
    chunk_size: usize,
    capacity: usize,
) -> (BoundedQueueRx<io::Result<Vec<u8>>>, JoinHandle<()>)
where
    R: Read + Send + 'static,
{
    let (tx, rx) = bounded_queue(capacity);
    let worker = thread::spawn(move || {
        for chunk in ChunkReader::new(reader, chunk_size) {
            let failed = chunk.is_err();
            if tx.send(chunk).is_err() || failed {
                break;
            }
        }
    });
    (rx, worker)
}

/// [`run`], with file reads overlapped with decoding.
pub fn run_threaded<R, F>(
    reader: R,
    session: &mut DecodeSession,
    options: &FeedOptions,
    capacity: usize,
    sink: F,
) -> Result<FeedStats, BackendError>
where
    R: Read + Send + 'static,
    F: FnMut(&DecodedFrame) -> Result<(), BackendError>,
{
    let (mut chunks, worker) = spawn_reader(reader, options.chunk_size, capacity);
    let result = run_chunks(&mut chunks, session, options, sink);
    let queue = chunks.stats();
    // Unblocks a reader still waiting on a full queue after an early stop.
    drop(chunks);
    if worker.join().is_err() {
        return Err(BackendError::Backend(
            "chunk reader thread panicked".to_string(),
        ));
    }
    log::debug!(
        "reader queue: delivered={} peak_depth={}",
        queue.delivered,
        queue.peak_depth
    );
    result
}

fn run_chunks<I, F>(
    chunks: I,
    session: &mut DecodeSession,
    options: &FeedOptions,
    mut sink: F,
) -> Result<FeedStats, BackendError>
where
    I: IntoIterator<Item = io::Result<Vec<u8>>>,
    F: FnMut(&DecodedFrame) -> Result<(), BackendError>,
{
    let limit = options.max_frames.unwrap_or(usize::MAX);
    let mut stats = FeedStats::default();

    for chunk in chunks {
        let chunk = chunk?;
        stats.chunks += 1;
        stats.bytes += chunk.len();

        let started = Instant::now();
        let frames = session.decode(&chunk)?;
        stats.decode_time += started.elapsed();

        if deliver(&frames, &mut stats, limit, &mut sink)? {
            log::debug!("frame limit {limit} reached after {} chunks", stats.chunks);
            return Ok(stats);
        }
    }

    let started = Instant::now();
    let frames = session.flush()?;
    stats.decode_time += started.elapsed();
    deliver(&frames, &mut stats, limit, &mut sink)?;
    Ok(stats)
}

fn deliver<F>(
    frames: &[DecodedFrame],
    stats: &mut FeedStats,
    limit: usize,
    sink: &mut F,
) -> Result<bool, BackendError>
where
    F: FnMut(&DecodedFrame) -> Result<(), BackendError>,
{
    for frame in frames {
        if stats.frames >= limit {
            return Ok(true);
        }
        sink(frame)?;
        stats.frames += 1;
    }
    Ok(stats.frames >= limit)
}
