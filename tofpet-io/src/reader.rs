//! Memory-mapped raw file reader.
//!
//! The reader is the source of a processing chain: it decodes one step of a
//! `.rawE` file on its own thread and pushes blocks of [`RawHit`]s downstream.

use crate::scanner::Step;
use crate::writer::raw_path;
use crate::{Error, Result};
use memmap2::Mmap;
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tofpet_core::{spawn_source, EventBuffer, EventSink, RawHit, SourceHandle, SystemConfig};
use tofpet_raw::{DecodeOutcome, DecoderStats, FrameDecoder, Record};

/// A memory-mapped file reader.
///
/// Uses memmap2 to access file contents without loading the entire file
/// into memory. The mapping is shared with reader threads.
pub struct MappedFileReader {
    mmap: Arc<Mmap>,
    path: PathBuf,
}

impl MappedFileReader {
    /// Opens a file for memory-mapped reading.
    ///
    /// # Errors
    /// Returns [`Error::Open`] if the file cannot be opened and
    /// [`Error::MmapError`] if it cannot be mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|source| Error::Open {
            path: path.clone(),
            source,
        })?;
        // SAFETY: The file is opened read-only and we assume it is not modified concurrently.
        // This is the standard safety contract for memory mapping.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file) }.map_err(|source| Error::MmapError {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            mmap: Arc::new(mmap),
            path,
        })
    }

    /// Returns the file contents as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap[..]
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// Returns true if the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Path of the mapped file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// What a reader pass saw.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStatistics {
    /// Bytes of the range decoded before stopping.
    pub bytes: u64,
    /// Hits pushed downstream.
    pub hits: u64,
    /// Buffers pushed downstream.
    pub buffers: u64,
    /// Hits earlier than the window start of the block they landed in.
    pub late_hits: u64,
    /// Decoder counters.
    pub decoder: DecoderStats,
    /// Type byte and file offset of the record decoding stopped at.
    pub malformed: Option<(u8, u64)>,
}

/// Source reading `<prefix>.rawE`.
pub struct RawReader {
    file: MappedFileReader,
    config: SystemConfig,
}

impl RawReader {
    /// Maps `<prefix>.rawE`.
    ///
    /// # Errors
    /// Returns [`Error::Open`] or [`Error::MmapError`] if the file cannot be
    /// mapped, and [`Error::CoreError`] for an invalid configuration.
    pub fn open<P: AsRef<Path>>(prefix: P, config: SystemConfig) -> Result<Self> {
        config.validate()?;
        let file = MappedFileReader::open(raw_path(prefix))?;
        log::debug!("mapped {} ({} bytes)", file.path().display(), file.len());
        Ok(Self { file, config })
    }

    /// Returns the file size in bytes.
    #[must_use]
    pub fn file_size(&self) -> usize {
        self.file.len()
    }

    /// The system configuration hits are decoded with.
    #[must_use]
    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Acquisition start time from the leading start-time record, if the
    /// file begins with one.
    ///
    /// # Errors
    /// Returns [`Error::RawError`] if the first record is unreadable.
    pub fn start_time(&self) -> Result<Option<i64>> {
        if self.file.is_empty() {
            return Ok(None);
        }
        match Record::decode(self.file.as_bytes(), 0)? {
            Record::StartTime(start) => Ok(Some(start.time)),
            _ => Ok(None),
        }
    }

    fn step_range(&self, step: &Step) -> Result<Range<usize>> {
        let len = self.file.len();
        let to_offset = |offset: u64| usize::try_from(offset).ok().filter(|&o| o <= len);
        match (to_offset(step.begin), to_offset(step.end)) {
            (Some(begin), Some(end)) if begin <= end => Ok(begin..end),
            _ => Err(Error::InvalidFormat(format!(
                "step bytes {}..{} outside {} ({len} bytes)",
                step.begin,
                step.end,
                self.file.path().display()
            ))),
        }
    }

    /// Decodes one step on the calling thread.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFormat`] if the step lies outside the file,
    /// or the first error raised by the sink chain.
    pub fn read_step<S>(&self, step: &Step, sink: &mut S) -> Result<ReaderStatistics>
    where
        S: EventSink<RawHit> + ?Sized,
    {
        let range = self.step_range(step)?;
        Ok(stream_range(self.file.as_bytes(), range, &self.config, sink)?)
    }

    /// Decodes the whole file on the calling thread.
    ///
    /// # Errors
    /// Returns the first error raised by the sink chain.
    pub fn read_all<S>(&self, sink: &mut S) -> Result<ReaderStatistics>
    where
        S: EventSink<RawHit> + ?Sized,
    {
        let range = 0..self.file.len();
        Ok(stream_range(self.file.as_bytes(), range, &self.config, sink)?)
    }

    /// Decodes one step on a new thread that owns `sink`.
    ///
    /// The handle yields the statistics and gives the sink chain back, so
    /// writers can be reused for the next step.
    ///
    /// # Errors
    /// Returns [`Error::InvalidFormat`] if the step lies outside the file,
    /// or [`Error::CoreError`] if the thread cannot be started.
    pub fn spawn_step<S>(&self, step: &Step, mut sink: S) -> Result<SourceHandle<(ReaderStatistics, S)>>
    where
        S: EventSink<RawHit> + 'static,
    {
        let range = self.step_range(step)?;
        let mmap = Arc::clone(&self.file.mmap);
        let config = self.config.clone();
        let name = format!("raw-reader {}..{}", step.begin, step.end);
        let handle = spawn_source(name, move || {
            let stats = stream_range(&mmap[..], range, &config, &mut sink)?;
            Ok((stats, sink))
        })?;
        Ok(handle)
    }
}

/// The block being filled and the window bookkeeping around it.
struct BlockBuilder {
    block: EventBuffer<RawHit>,
    block_size: usize,
    threshold: usize,
    last_t_max: i64,
    t_max: i64,
}

impl BlockBuilder {
    fn new(config: &SystemConfig) -> Self {
        Self {
            block: EventBuffer::new(config.block_size),
            block_size: config.block_size,
            threshold: config.flush_threshold(),
            last_t_max: 0,
            t_max: 0,
        }
    }

    /// Adds a hit. Returns true if it arrived before the block's window.
    fn add(&mut self, hit: RawHit) -> bool {
        let late = hit.time < self.last_t_max;
        self.t_max = self.t_max.max(hit.time.saturating_add(1));
        self.block.push(hit);
        late
    }

    fn is_ready(&self) -> bool {
        self.block.len() >= self.threshold
    }

    /// Takes the block with its window `[previous t_max, max time + 1)`.
    fn take(&mut self) -> EventBuffer<RawHit> {
        let mut block = std::mem::replace(&mut self.block, EventBuffer::new(self.block_size));
        block.set_window(self.last_t_max, self.t_max);
        self.last_t_max = self.t_max;
        block
    }
}

fn stream_range<S>(
    bytes: &[u8],
    range: Range<usize>,
    config: &SystemConfig,
    sink: &mut S,
) -> tofpet_core::Result<ReaderStatistics>
where
    S: EventSink<RawHit> + ?Sized,
{
    let start = range.start;
    let mut stats = ReaderStatistics::default();
    let mut decoder = FrameDecoder::new(config);
    let mut builder = BlockBuilder::new(config);

    log::debug!("reading bytes {}..{}", range.start, range.end);
    sink.push_t0(0.0);

    let outcome = decoder.decode_slice(&bytes[range], |hit| {
        if builder.add(hit) {
            stats.late_hits += 1;
        }
        if builder.is_ready() {
            let block = builder.take();
            stats.hits += block.len() as u64;
            stats.buffers += 1;
            sink.push_events(block)?;
        }
        Ok::<(), tofpet_core::Error>(())
    })?;

    match outcome {
        DecodeOutcome::Complete { consumed } => stats.bytes = consumed as u64,
        DecodeOutcome::Malformed { code, offset } => {
            let at = (start + offset) as u64;
            log::warn!("malformed raw stream: record type {code} at byte {at}, stopping");
            stats.bytes = offset as u64;
            stats.malformed = Some((code, at));
        }
    }

    if !builder.block.is_empty() {
        let block = builder.take();
        stats.hits += block.len() as u64;
        stats.buffers += 1;
        sink.push_events(block)?;
    }
    stats.decoder = decoder.stats();

    sink.finish()?;
    log::info!(
        "raw-reader: {} hits in {} buffers from {} bytes",
        stats.hits,
        stats.buffers,
        stats.bytes
    );
    if stats.late_hits > 0 {
        log::info!(
            "raw-reader: {} hits arrived before their block window",
            stats.late_hits
        );
    }
    if stats.decoder.discarded_channel > 0 {
        log::warn!(
            "raw-reader: {} hits on channels outside the system were discarded",
            stats.decoder.discarded_channel
        );
    }
    sink.report();
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tofpet_core::{CollectingSink, RawData, SinkCall};
    use tofpet_raw::timing::tofpet_times;
    use tofpet_raw::FrameEncoder;

    const T: i64 = 6250;

    fn hit(frame: u64, coarse: u16, channel_id: u32) -> RawHit {
        let (time, time_end) = tofpet_times(frame, coarse, coarse + 10, T);
        RawHit {
            time,
            time_end,
            channel_id,
            channel_idle_time: 0,
            data: RawData::Tofpet {
                tac: 0,
                t_coarse: coarse,
                e_coarse: coarse + 10,
                t_fine: 0,
                e_fine: 0,
                tac_idle_time: 0,
            },
        }
    }

    fn encode(hits: &[RawHit]) -> Vec<u8> {
        let mut encoder = FrameEncoder::new(Vec::new(), T);
        encoder.write_start_time(0).unwrap();
        for h in hits {
            encoder.write_hit(h).unwrap();
        }
        encoder.into_inner()
    }

    fn small_config() -> SystemConfig {
        SystemConfig::default().with_block_size(515).with_n_channels(16)
    }

    #[test]
    fn test_mapped_file_reader() {
        let mut file = NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..64).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let reader = MappedFileReader::open(file.path()).unwrap();
        assert_eq!(reader.len(), 64);
        assert!(!reader.is_empty());
        assert_eq!(reader.as_bytes(), &data[..]);
    }

    #[test]
    fn test_blocks_and_windows() {
        // Threshold of 3 hits per block.
        let hits: Vec<RawHit> = (0_u16..7)
            .map(|i| hit(u64::from(i / 2), 100 * (i % 2), 1))
            .collect();
        let bytes = encode(&hits);
        let sink = CollectingSink::new();
        let mut probe = sink.clone();

        let stats = stream_range(&bytes, 0..bytes.len(), &small_config(), &mut probe).unwrap();
        assert_eq!(stats.hits, 7);
        assert_eq!(stats.buffers, 3);
        assert_eq!(stats.late_hits, 0);
        assert_eq!(stats.bytes, bytes.len() as u64);
        assert!(stats.malformed.is_none());

        let windows = sink.windows();
        assert_eq!(windows[0], (0, hits[2].time + 1));
        assert_eq!(windows[1], (hits[2].time + 1, hits[5].time + 1));
        assert_eq!(windows[2], (hits[5].time + 1, hits[6].time + 1));
        let calls = sink.calls();
        assert_eq!(calls.first(), Some(&SinkCall::T0(0.0)));
        assert_eq!(&calls[calls.len() - 2..], &[SinkCall::Finish, SinkCall::Report]);
    }

    #[test]
    fn test_late_hits_counted() {
        let hits = vec![hit(0, 10, 1), hit(0, 20, 1), hit(0, 30, 1), hit(0, 5, 1)];
        let bytes = encode(&hits);
        let sink = CollectingSink::new();
        let stats = stream_range(&bytes, 0..bytes.len(), &small_config(), &mut sink.clone()).unwrap();
        assert_eq!(stats.late_hits, 1);
        assert_eq!(sink.records().len(), 4);
    }

    #[test]
    fn test_malformed_stream_still_flushes() {
        let mut bytes = encode(&[hit(0, 10, 1), hit(0, 20, 1)]);
        let cut = bytes.len();
        bytes.push(9);
        let sink = CollectingSink::new();
        let stats = stream_range(&bytes, 0..bytes.len(), &small_config(), &mut sink.clone()).unwrap();
        assert_eq!(stats.malformed, Some((9, cut as u64)));
        assert_eq!(stats.hits, 2);
        assert_eq!(sink.records().len(), 2);
        assert!(sink.calls().contains(&SinkCall::Finish));
    }

    #[test]
    fn test_discarded_channels() {
        let bytes = encode(&[hit(0, 10, 1), hit(0, 20, 99)]);
        let sink = CollectingSink::new();
        let stats = stream_range(&bytes, 0..bytes.len(), &small_config(), &mut sink.clone()).unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.decoder.discarded_channel, 1);
    }

    #[test]
    fn test_empty_range_finishes() {
        let sink = CollectingSink::<RawHit>::new();
        let stats = stream_range(&[], 0..0, &small_config(), &mut sink.clone()).unwrap();
        assert_eq!(stats, ReaderStatistics::default());
        assert_eq!(
            sink.calls(),
            vec![SinkCall::T0(0.0), SinkCall::Finish, SinkCall::Report]
        );
    }
}
