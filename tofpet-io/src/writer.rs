//! File writers: raw files with their step index, calibrated singles and
//! grouped photons.

use crate::scanner::Step;
use crate::{Error, Result};
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tofpet_core::{EventBuffer, EventSink, GammaPhoton, Hit, RawHit, SystemConfig};
use tofpet_raw::FrameEncoder;

/// Extension of raw data files.
pub const RAW_EXTENSION: &str = "rawE";
/// Extension of step index files.
pub const INDEX_EXTENSION: &str = "idxE";

fn with_suffix(prefix: &Path, extension: &str) -> PathBuf {
    let mut name = OsString::from(prefix.as_os_str());
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

/// `<prefix>.rawE`
pub fn raw_path<P: AsRef<Path>>(prefix: P) -> PathBuf {
    with_suffix(prefix.as_ref(), RAW_EXTENSION)
}

/// `<prefix>.idxE`
pub fn index_path<P: AsRef<Path>>(prefix: P) -> PathBuf {
    with_suffix(prefix.as_ref(), INDEX_EXTENSION)
}

fn create(path: PathBuf) -> Result<BufWriter<File>> {
    let file = File::create(&path).map_err(|source| Error::Open { path, source })?;
    Ok(BufWriter::new(file))
}

/// Writer for a raw file and its step index.
///
/// Every step starts with a frame header, so a step can be decoded on its
/// own from its index entry.
pub struct RawWriter {
    encoder: FrameEncoder<BufWriter<File>>,
    index: BufWriter<File>,
    open: Option<Step>,
    hits_in_step: u64,
}

impl RawWriter {
    /// Creates `<prefix>.rawE` and `<prefix>.idxE` and writes the start-time record.
    ///
    /// # Errors
    /// Returns [`Error::Open`] if either file cannot be created.
    pub fn create<P: AsRef<Path>>(
        prefix: P,
        acq_start_time: i64,
        config: &SystemConfig,
    ) -> Result<Self> {
        let prefix = prefix.as_ref();
        let data = create(raw_path(prefix))?;
        let index = create(index_path(prefix))?;
        let mut encoder = FrameEncoder::new(data, config.clock_period_ps);
        encoder.write_start_time(acq_start_time)?;
        Ok(Self {
            encoder,
            index,
            open: None,
            hits_in_step: 0,
        })
    }

    /// Bytes written to the raw file so far.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.encoder.position()
    }

    /// Starts a step. A step still open is closed first.
    ///
    /// # Errors
    /// Returns any error raised while closing the previous step.
    pub fn open_step(&mut self, param1: f32, param2: f32) -> Result<()> {
        if self.open.is_some() {
            log::warn!("raw-writer: step opened while another was open, closing it");
            self.close_step()?;
        }
        self.encoder.reset_frame();
        let begin = self.encoder.position();
        self.open = Some(Step {
            param1,
            param2,
            begin,
            end: begin,
        });
        self.hits_in_step = 0;
        Ok(())
    }

    /// Writes the hits of `buffer` whose time lies in `[t_min, t_max)`.
    /// Returns the number written.
    ///
    /// # Errors
    /// Returns [`Error::StepNotOpen`] outside a step, or the write error.
    pub fn add_event_buffer(
        &mut self,
        t_min: i64,
        t_max: i64,
        buffer: &EventBuffer<RawHit>,
    ) -> Result<usize> {
        if self.open.is_none() {
            return Err(Error::StepNotOpen);
        }
        let mut written = 0;
        for hit in buffer.iter().filter(|h| h.time >= t_min && h.time < t_max) {
            self.encoder.write_hit(hit)?;
            written += 1;
        }
        self.hits_in_step += written as u64;
        Ok(written)
    }

    /// Ends the current step, appends its index line and flushes both files.
    ///
    /// # Errors
    /// Returns [`Error::StepNotOpen`] outside a step, or the write error.
    pub fn close_step(&mut self) -> Result<Step> {
        let mut step = self.open.take().ok_or(Error::StepNotOpen)?;
        step.end = self.encoder.position();
        writeln!(self.index, "{}", step.to_index_line())?;
        self.encoder.flush()?;
        self.index.flush()?;
        log::debug!(
            "raw-writer: step ({}, {}) holds {} hits in bytes {}..{}",
            step.param1,
            step.param2,
            self.hits_in_step,
            step.begin,
            step.end
        );
        Ok(step)
    }

    /// Whether a step is open.
    #[must_use]
    pub fn is_step_open(&self) -> bool {
        self.open.is_some()
    }

    /// Closes any open step and flushes.
    ///
    /// # Errors
    /// Returns the write error, if any.
    pub fn finish(mut self) -> Result<()> {
        if self.open.is_some() {
            self.close_step()?;
        }
        self.encoder.flush()?;
        self.index.flush()?;
        Ok(())
    }
}

/// Adapts a [`RawWriter`] into the terminal sink of a raw hit stream.
///
/// Each buffer is written within its own window, so overlapping input is
/// stored once. `finish` closes the step.
pub struct RawWriterSink {
    writer: RawWriter,
    written: u64,
    buffers: u64,
}

impl RawWriterSink {
    /// Wraps `writer` and opens a step with the given parameters.
    ///
    /// # Errors
    /// Returns any error raised while opening the step.
    pub fn new(mut writer: RawWriter, param1: f32, param2: f32) -> Result<Self> {
        writer.open_step(param1, param2)?;
        Ok(Self {
            writer,
            written: 0,
            buffers: 0,
        })
    }

    /// Opens the next step on the same files.
    ///
    /// # Errors
    /// Returns any error raised while closing the previous step.
    pub fn open_step(&mut self, param1: f32, param2: f32) -> Result<()> {
        self.writer.open_step(param1, param2)
    }

    /// Hits written so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> RawWriter {
        self.writer
    }
}

impl EventSink<RawHit> for RawWriterSink {
    fn push_t0(&mut self, t0: f64) {
        log::debug!("raw-writer: t0 = {t0}");
    }

    fn push_events(&mut self, buffer: EventBuffer<RawHit>) -> tofpet_core::Result<()> {
        let written = self
            .writer
            .add_event_buffer(buffer.t_min(), buffer.t_max(), &buffer)
            .map_err(|e| e.into_sink_error("raw-writer"))?;
        self.written += written as u64;
        self.buffers += 1;
        Ok(())
    }

    fn finish(&mut self) -> tofpet_core::Result<()> {
        if self.writer.is_step_open() {
            self.writer
                .close_step()
                .map_err(|e| e.into_sink_error("raw-writer"))?;
        }
        Ok(())
    }

    fn report(&self) {
        log::info!(
            "raw-writer: {} hits written from {} buffers",
            self.written,
            self.buffers
        );
    }
}

/// Size of one singles record.
pub const SINGLES_RECORD_SIZE: usize = 27;

/// Writes calibrated hits as fixed-size binary records.
///
/// Format, little-endian and packed: `step1 f32, step2 f32, time i64,
/// channel u16, tot_ns f32, tac u8, energy f32`.
pub struct SinglesWriter {
    writer: BufWriter<File>,
    step: (f32, f32),
    written: u64,
    truncated_channels: u64,
}

impl SinglesWriter {
    /// Creates the output file.
    ///
    /// # Errors
    /// Returns [`Error::Open`] if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P, param1: f32, param2: f32) -> Result<Self> {
        Ok(Self {
            writer: create(path.as_ref().to_path_buf())?,
            step: (param1, param2),
            written: 0,
            truncated_channels: 0,
        })
    }

    /// Sets the step parameters stamped on following records.
    pub fn set_step(&mut self, param1: f32, param2: f32) {
        self.step = (param1, param2);
    }

    /// Records written so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    fn write_hit(&mut self, hit: &Hit) -> std::io::Result<()> {
        let channel = u16::try_from(hit.raw.channel_id).unwrap_or_else(|_| {
            self.truncated_channels += 1;
            u16::MAX
        });
        let mut record = [0_u8; SINGLES_RECORD_SIZE];
        record[0..4].copy_from_slice(&self.step.0.to_le_bytes());
        record[4..8].copy_from_slice(&self.step.1.to_le_bytes());
        record[8..16].copy_from_slice(&hit.time.to_le_bytes());
        record[16..18].copy_from_slice(&channel.to_le_bytes());
        record[18..22].copy_from_slice(&hit.tot_ns().to_le_bytes());
        record[22] = hit.raw.tac();
        record[23..27].copy_from_slice(&hit.energy.to_le_bytes());
        self.writer.write_all(&record)
    }
}

impl EventSink<Hit> for SinglesWriter {
    fn push_t0(&mut self, _t0: f64) {}

    fn push_events(&mut self, buffer: EventBuffer<Hit>) -> tofpet_core::Result<()> {
        for hit in &buffer {
            self.write_hit(hit)?;
        }
        self.written += buffer.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> tofpet_core::Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn report(&self) {
        log::info!("singles-writer: {} hits written", self.written);
        if self.truncated_channels > 0 {
            log::warn!(
                "singles-writer: {} hits had a channel id above 65535",
                self.truncated_channels
            );
        }
    }
}

/// Output format of a [`PhotonWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhotonFormat {
    /// Comma separated text with a header line.
    Csv,
    /// Packed little-endian records of [`PHOTON_RECORD_SIZE`] bytes.
    Binary,
}

impl PhotonFormat {
    /// CSV for a `.csv` extension, binary otherwise.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension() {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => PhotonFormat::Csv,
            _ => PhotonFormat::Binary,
        }
    }
}

/// CSV header of photon output.
pub const PHOTON_CSV_HEADER: &str = "step1,step2,time,region,x,y,z,energy,n_hits";

/// Size of one binary photon record.
///
/// `step1 f32, step2 f32, time i64, region u16, x f32, y f32, z f32,
/// energy f32, n_hits u16`.
pub const PHOTON_RECORD_SIZE: usize = 36;

/// Writes grouped photons.
pub struct PhotonWriter {
    writer: BufWriter<File>,
    format: PhotonFormat,
    step: (f32, f32),
    written: u64,
}

impl PhotonWriter {
    /// Creates the output file, choosing the format from its extension.
    ///
    /// # Errors
    /// Returns [`Error::Open`] if the file cannot be created, or the error
    /// raised while writing the CSV header.
    pub fn create<P: AsRef<Path>>(path: P, param1: f32, param2: f32) -> Result<Self> {
        let path = path.as_ref();
        let format = PhotonFormat::from_path(path);
        let mut writer = create(path.to_path_buf())?;
        if format == PhotonFormat::Csv {
            writeln!(writer, "{PHOTON_CSV_HEADER}")?;
        }
        Ok(Self {
            writer,
            format,
            step: (param1, param2),
            written: 0,
        })
    }

    /// The output format.
    #[must_use]
    pub fn format(&self) -> PhotonFormat {
        self.format
    }

    /// Sets the step parameters stamped on following records.
    pub fn set_step(&mut self, param1: f32, param2: f32) {
        self.step = (param1, param2);
    }

    /// Photons written so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    fn write_photon(&mut self, p: &GammaPhoton) -> std::io::Result<()> {
        let (step1, step2) = self.step;
        match self.format {
            PhotonFormat::Csv => writeln!(
                self.writer,
                "{step1},{step2},{},{},{},{},{},{},{}",
                p.time,
                p.region,
                p.x,
                p.y,
                p.z,
                p.energy,
                p.n_hits()
            ),
            PhotonFormat::Binary => {
                let n_hits = u16::try_from(p.n_hits()).unwrap_or(u16::MAX);
                self.writer.write_all(&step1.to_le_bytes())?;
                self.writer.write_all(&step2.to_le_bytes())?;
                self.writer.write_all(&p.time.to_le_bytes())?;
                self.writer.write_all(&p.region.to_le_bytes())?;
                self.writer.write_all(&p.x.to_le_bytes())?;
                self.writer.write_all(&p.y.to_le_bytes())?;
                self.writer.write_all(&p.z.to_le_bytes())?;
                self.writer.write_all(&p.energy.to_le_bytes())?;
                self.writer.write_all(&n_hits.to_le_bytes())
            }
        }
    }
}

impl EventSink<GammaPhoton> for PhotonWriter {
    fn push_t0(&mut self, _t0: f64) {}

    fn push_events(&mut self, buffer: EventBuffer<GammaPhoton>) -> tofpet_core::Result<()> {
        for photon in &buffer {
            self.write_photon(photon)?;
        }
        self.written += buffer.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> tofpet_core::Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    fn report(&self) {
        log::info!("photon-writer: {} photons written", self.written);
    }
}
