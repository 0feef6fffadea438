//! Round-robin series files in the rrdtool on-disk format.
//!
//! Files are laid out the way `rrdtool create` and `rrdtool update` leave them
//! on a 64-bit host (format version 0003, native byte order), so the graphing
//! side reads them with the stock tools. Only GAUGE data sources and
//! AVERAGE/MAX archives are handled. The whole file is rewritten through a
//! temporary sibling on every update, so a reader never observes a
//! half-written file.
//!
//! Layout, following `rrd_format.h`:
//!
//! ```text
//! stat_head  cookie[4] version[5] pad[7] float_cookie ds_cnt rra_cnt pdp_step par[10]  128
//! ds_def     ds_nam[20] dst[20] par[10] (heartbeat, min, max)                    120 per ds
//! rra_def    cf_nam[20] pad[4] row_cnt pdp_cnt par[10] (xff)                    120 per rra
//! live_head  last_up last_up_usec                                                        16
//! pdp_prep   last_ds[30] pad[2] scratch[10] (unknown seconds, value)            112 per ds
//! cdp_prep   scratch[10] (value, unknown pdp count)                       80 per rra and ds
//! rra_ptr    cur_row                                                              8 per rra
//! rows       f64 per ds per row, archive after archive (NaN = unknown)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Seconds between primary data points
pub const STEP: u64 = 300;

/// Longest gap between updates before the interval counts as unknown
pub const HEARTBEAT: u64 = 600;

const COOKIE: &[u8; 4] = b"RRD\0";
const VERSION: &[u8; 5] = b"0003\0";
/// Written by rrdtool to detect files from a host with another float layout
const FLOAT_COOKIE: f64 = 8.642135E130;
const PAR_COUNT: usize = 10;
const DS_NAM_SIZE: usize = 20;
const DST_SIZE: usize = 20;
const CF_NAM_SIZE: usize = 20;
const LAST_DS_LEN: usize = 30;
const GAUGE: &str = "GAUGE";

#[derive(Debug, Error)]
pub enum SeriesFileError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} is not an RRD file")]
    BadMagic(PathBuf),

    #[error("{path} has unsupported RRD version {version}")]
    UnsupportedVersion { path: PathBuf, version: String },

    #[error("{path} cannot be handled here: {reason}")]
    Unsupported { path: PathBuf, reason: String },

    #[error("{0} is truncated or corrupt")]
    Truncated(PathBuf),

    #[error("illegal update time {given}: must be after last update {last}")]
    StaleUpdate { last: u64, given: u64 },

    #[error("expected {expected} values, got {given}")]
    ValueCount { expected: usize, given: usize },
}

/// How an archive folds primary data points into rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consolidation {
    Average,
    Max,
}

impl Consolidation {
    fn name(self) -> &'static str {
        match self {
            Consolidation::Average => "AVERAGE",
            Consolidation::Max => "MAX",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "AVERAGE" => Some(Consolidation::Average),
            "MAX" => Some(Consolidation::Max),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DataSource {
    pub name: String,
    pub heartbeat: u64,
    pub min: f64,
    pub max: f64,
}

impl DataSource {
    pub fn gauge(name: &str, min: f64, max: f64) -> Self {
        Self { name: name.to_string(), heartbeat: HEARTBEAT, min, max }
    }

    fn accepts(&self, value: f64) -> bool {
        !value.is_nan() && value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Archive {
    pub consolidation: Consolidation,
    /// Fraction of unknown points a row tolerates before it is unknown itself
    pub xff: f64,
    pub pdp_per_row: u32,
    pub rows: u32,
}

impl Archive {
    pub fn new(consolidation: Consolidation, pdp_per_row: u32, rows: u32) -> Self {
        Self { consolidation, xff: 0.5, pdp_per_row, rows }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub step: u64,
    pub data_sources: Vec<DataSource>,
    pub archives: Vec<Archive>,
}

/// Availability series: STATUS and RESPONSETIME sampled every five minutes,
/// kept for a day at full resolution and rolled up to three years.
///
/// Same definitions as `rrdtool create -s 300 DS:STATUS:GAUGE:600:0:1
/// DS:RESPONSETIME:GAUGE:600:0:300 RRA:AVERAGE:0.5:1:288 ...`.
pub fn availability_schema() -> Schema {
    use Consolidation::{Average, Max};

    Schema {
        step: STEP,
        data_sources: vec![
            DataSource::gauge("STATUS", 0.0, 1.0),
            DataSource::gauge("RESPONSETIME", 0.0, 300.0),
        ],
        archives: vec![
            Archive::new(Average, 1, 288),
            Archive::new(Average, 6, 336),
            Archive::new(Average, 12, 720),
            Archive::new(Max, 12, 720),
            Archive::new(Average, 288, 365),
            Archive::new(Max, 288, 365),
            Archive::new(Average, 288, 1095),
            Archive::new(Max, 288, 1095),
        ],
    }
}

/// Primary data point being built for the current step
#[derive(Debug, Clone, PartialEq)]
struct PdpPrep {
    /// Raw text of the last update, `U` when unknown
    last_ds: String,
    /// Seconds of the current step without a usable value
    unknown: u64,
    /// Sum of value times seconds over the known part of the step
    value: f64,
}

/// Row being consolidated for one archive and data source
#[derive(Debug, Clone, Copy, PartialEq)]
struct CdpPrep {
    value: f64,
    unknown: u64,
}

impl CdpPrep {
    fn empty(unknown: u64) -> Self {
        Self { value: f64::NAN, unknown }
    }

    fn push(&mut self, consolidation: Consolidation, pdp: f64) {
        if pdp.is_nan() {
            self.unknown += 1;
            return;
        }
        self.value = match consolidation {
            _ if self.value.is_nan() => pdp,
            Consolidation::Average => self.value + pdp,
            Consolidation::Max => self.value.max(pdp),
        };
    }

    fn finish(&self, archive: &Archive) -> f64 {
        let per_row = u64::from(archive.pdp_per_row);
        if self.value.is_nan() || self.unknown as f64 > archive.xff * per_row as f64 {
            return f64::NAN;
        }
        match archive.consolidation {
            Consolidation::Average => self.value / per_row.saturating_sub(self.unknown).max(1) as f64,
            Consolidation::Max => self.value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ArchiveState {
    /// Most recently written row
    cur_row: u32,
    cdp: Vec<CdpPrep>,
    /// `rows * ds_count` values, row-major
    data: Vec<f64>,
}

/// An open series file
#[derive(Debug, Clone)]
pub struct SeriesFile {
    path: PathBuf,
    schema: Schema,
    last_update: u64,
    pdp: Vec<PdpPrep>,
    archives: Vec<ArchiveState>,
}

impl SeriesFile {
    /// Create a new, empty series file at `path` starting at `start`.
    ///
    /// Fails if anything already exists at `path`. Steps and rows already
    /// under way at `start` count their elapsed part as unknown.
    pub fn create(path: &Path, schema: Schema, start: u64) -> Result<Self, SeriesFileError> {
        let ds_count = schema.data_sources.len();
        let step = schema.step;
        let pdp_unknown = start % step;

        let archives = schema
            .archives
            .iter()
            .map(|archive| {
                let period = step * u64::from(archive.pdp_per_row);
                let elapsed_pdps = ((start - pdp_unknown) % period) / step;
                ArchiveState {
                    cur_row: archive.rows - 1,
                    cdp: vec![CdpPrep::empty(elapsed_pdps); ds_count],
                    data: vec![f64::NAN; archive.rows as usize * ds_count],
                }
            })
            .collect();

        let pdp = vec![PdpPrep { last_ds: "U".to_string(), unknown: pdp_unknown, value: 0.0 }; ds_count];
        let file = Self { path: path.to_path_buf(), pdp, schema, last_update: start, archives };

        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|source| SeriesFileError::Io { path: path.to_path_buf(), source })?;
        file.save()?;
        Ok(file)
    }

    pub fn open(path: &Path) -> Result<Self, SeriesFileError> {
        let bytes =
            fs::read(path).map_err(|source| SeriesFileError::Io { path: path.to_path_buf(), source })?;
        decode(path, &bytes)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn last_update(&self) -> u64 {
        self.last_update
    }

    /// Record one sample per data source at `timestamp` and persist the file.
    ///
    /// `None` marks a value as unknown.
    pub fn update(&mut self, timestamp: u64, values: &[Option<f64>]) -> Result<(), SeriesFileError> {
        self.apply(timestamp, values)?;
        self.save()
    }

    fn apply(&mut self, timestamp: u64, values: &[Option<f64>]) -> Result<(), SeriesFileError> {
        let expected = self.schema.data_sources.len();
        if values.len() != expected {
            return Err(SeriesFileError::ValueCount { expected, given: values.len() });
        }
        if timestamp <= self.last_update {
            return Err(SeriesFileError::StaleUpdate { last: self.last_update, given: timestamp });
        }

        let interval = timestamp - self.last_update;
        // A gap longer than the heartbeat leaves every step it closes unknown
        let stale: Vec<bool> = self.schema.data_sources.iter().map(|ds| interval > ds.heartbeat).collect();
        let readings: Vec<Option<f64>> = self
            .schema
            .data_sources
            .iter()
            .zip(values)
            .zip(&stale)
            .map(|((ds, value), stale)| value.filter(|v| !stale && ds.accepts(*v)))
            .collect();

        let step = self.schema.step;
        let mut cursor = self.last_update;
        while cursor < timestamp {
            let boundary = (cursor / step + 1) * step;
            let segment_end = boundary.min(timestamp);
            let seconds = segment_end - cursor;

            for (prep, reading) in self.pdp.iter_mut().zip(&readings) {
                match reading {
                    Some(v) => prep.value += v * seconds as f64,
                    None => prep.unknown += seconds,
                }
            }

            cursor = segment_end;
            if cursor == boundary {
                self.close_step(boundary, &stale);
            }
        }

        for (prep, value) in self.pdp.iter_mut().zip(values) {
            prep.last_ds = match value {
                Some(v) => v.to_string(),
                None => "U".to_string(),
            };
        }
        self.last_update = timestamp;
        Ok(())
    }

    /// Turn the accumulated step into primary data points and feed the archives.
    fn close_step(&mut self, boundary: u64, stale: &[bool]) {
        let step = self.schema.step;
        let pdps: Vec<f64> = self
            .pdp
            .iter()
            .zip(stale)
            .map(|(prep, stale)| {
                if *stale || prep.unknown * 2 > step {
                    f64::NAN
                } else {
                    prep.value / (step - prep.unknown) as f64
                }
            })
            .collect();
        for prep in &mut self.pdp {
            prep.unknown = 0;
            prep.value = 0.0;
        }

        let step_index = boundary / step;
        let ds_count = pdps.len();
        for (archive, state) in self.schema.archives.iter().zip(self.archives.iter_mut()) {
            for (cdp, pdp) in state.cdp.iter_mut().zip(&pdps) {
                cdp.push(archive.consolidation, *pdp);
            }
            if step_index % u64::from(archive.pdp_per_row) != 0 {
                continue;
            }

            state.cur_row = (state.cur_row + 1) % archive.rows;
            let offset = state.cur_row as usize * ds_count;
            for (i, cdp) in state.cdp.iter_mut().enumerate() {
                state.data[offset + i] = cdp.finish(archive);
                *cdp = CdpPrep::empty(0);
            }
        }
    }

    /// Rows of one archive, oldest first, each with the end time of its period.
    pub fn archive_rows(&self, index: usize) -> Option<Vec<(u64, Vec<f64>)>> {
        let archive = self.schema.archives.get(index)?;
        let state = self.archives.get(index)?;
        let ds_count = self.schema.data_sources.len();
        let period = self.schema.step * u64::from(archive.pdp_per_row);
        let newest = self.last_update / period * period;
        let rows = archive.rows as usize;

        let result = (0..rows)
            .map(|age| {
                let slot = (state.cur_row as usize + 1 + age) % rows;
                let time = newest.saturating_sub((rows - 1 - age) as u64 * period);
                let values = state.data[slot * ds_count..(slot + 1) * ds_count].to_vec();
                (time, values)
            })
            .collect();
        Some(result)
    }

    fn save(&self) -> Result<(), SeriesFileError> {
        let bytes = encode(self);
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let io_err = |source| SeriesFileError::Io { path: self.path.clone(), source };

        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)
    }
}

/// One slot of rrdtool's `unival` parameter arrays
#[derive(Debug, Clone, Copy)]
enum Unival {
    Count(u64),
    Value(f64),
}

#[derive(Default)]
struct Writer {
    out: Vec<u8>,
}

impl Writer {
    /// NUL padded fixed-width text field
    fn text(&mut self, value: &str, width: usize) {
        let mut field = vec![0u8; width];
        let len = value.len().min(width - 1);
        field[..len].copy_from_slice(&value.as_bytes()[..len]);
        self.out.extend_from_slice(&field);
    }

    fn pad(&mut self, len: usize) {
        self.out.resize(self.out.len() + len, 0);
    }

    fn u64(&mut self, value: u64) {
        self.out.extend_from_slice(&value.to_ne_bytes());
    }

    fn i64(&mut self, value: i64) {
        self.out.extend_from_slice(&value.to_ne_bytes());
    }

    fn f64(&mut self, value: f64) {
        self.out.extend_from_slice(&value.to_ne_bytes());
    }

    /// `unival par[10]`, unused slots zeroed
    fn params(&mut self, slots: &[Unival]) {
        for slot in slots {
            match *slot {
                Unival::Count(count) => self.u64(count),
                Unival::Value(value) => self.f64(value),
            }
        }
        self.pad((PAR_COUNT - slots.len()) * 8);
    }
}

fn encode(file: &SeriesFile) -> Vec<u8> {
    let schema = &file.schema;
    let mut w = Writer::default();

    w.out.extend_from_slice(COOKIE);
    w.out.extend_from_slice(VERSION);
    w.pad(7);
    w.f64(FLOAT_COOKIE);
    w.u64(schema.data_sources.len() as u64);
    w.u64(schema.archives.len() as u64);
    w.u64(schema.step);
    w.params(&[]);

    for ds in &schema.data_sources {
        w.text(&ds.name, DS_NAM_SIZE);
        w.text(GAUGE, DST_SIZE);
        w.params(&[Unival::Count(ds.heartbeat), Unival::Value(ds.min), Unival::Value(ds.max)]);
    }
    for archive in &schema.archives {
        w.text(archive.consolidation.name(), CF_NAM_SIZE);
        w.pad(4);
        w.u64(u64::from(archive.rows));
        w.u64(u64::from(archive.pdp_per_row));
        w.params(&[Unival::Value(archive.xff)]);
    }

    w.i64(file.last_update as i64);
    w.i64(0);

    for prep in &file.pdp {
        w.text(&prep.last_ds, LAST_DS_LEN);
        w.pad(2);
        w.params(&[Unival::Count(prep.unknown), Unival::Value(prep.value)]);
    }
    for state in &file.archives {
        for cdp in &state.cdp {
            w.params(&[Unival::Value(cdp.value), Unival::Count(cdp.unknown)]);
        }
    }
    for state in &file.archives {
        w.u64(u64::from(state.cur_row));
    }
    for state in &file.archives {
        for value in &state.data {
            w.f64(*value);
        }
    }
    w.out
}

/// Cursor over an encoded file
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], SeriesFileError> {
        let chunk = self.slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(chunk);
        Ok(out)
    }

    fn slice(&mut self, len: usize) -> Result<&'a [u8], SeriesFileError> {
        let bytes = self.bytes;
        let end = self.pos + len;
        let chunk = bytes.get(self.pos..end).ok_or_else(|| self.corrupt())?;
        self.pos = end;
        Ok(chunk)
    }

    fn skip(&mut self, len: usize) -> Result<(), SeriesFileError> {
        self.slice(len).map(|_| ())
    }

    fn text(&mut self, width: usize) -> Result<String, SeriesFileError> {
        let raw = self.slice(width)?;
        let len = raw.iter().position(|b| *b == 0).unwrap_or(width);
        Ok(String::from_utf8_lossy(&raw[..len]).into_owned())
    }

    fn u64(&mut self) -> Result<u64, SeriesFileError> {
        Ok(u64::from_ne_bytes(self.take()?))
    }

    fn i64(&mut self) -> Result<i64, SeriesFileError> {
        Ok(i64::from_ne_bytes(self.take()?))
    }

    fn f64(&mut self) -> Result<f64, SeriesFileError> {
        Ok(f64::from_ne_bytes(self.take()?))
    }

    /// `unival par[10]` as raw slots
    fn params(&mut self) -> Result<[[u8; 8]; PAR_COUNT], SeriesFileError> {
        let mut slots = [[0u8; 8]; PAR_COUNT];
        for slot in &mut slots {
            *slot = self.take()?;
        }
        Ok(slots)
    }

    fn corrupt(&self) -> SeriesFileError {
        SeriesFileError::Truncated(self.path.to_path_buf())
    }

    fn unsupported(&self, reason: impl Into<String>) -> SeriesFileError {
        SeriesFileError::Unsupported { path: self.path.to_path_buf(), reason: reason.into() }
    }
}

fn decode(path: &Path, bytes: &[u8]) -> Result<SeriesFile, SeriesFileError> {
    let mut r = Reader { bytes, pos: 0, path };

    if r.take::<4>().ok().as_ref() != Some(COOKIE) {
        return Err(SeriesFileError::BadMagic(path.to_path_buf()));
    }
    let version = r.take::<5>()?;
    if &version != VERSION {
        let version = String::from_utf8_lossy(&version[..4]).into_owned();
        return Err(SeriesFileError::UnsupportedVersion { path: path.to_path_buf(), version });
    }
    r.skip(7)?;
    if r.f64()? != FLOAT_COOKIE {
        return Err(r.unsupported("written on a host with a different number layout"));
    }
    let ds_count = r.u64()? as usize;
    let rra_count = r.u64()? as usize;
    let step = r.u64()?;
    r.params()?;
    if step == 0 || ds_count == 0 {
        return Err(r.corrupt());
    }

    let mut data_sources = Vec::with_capacity(ds_count);
    for _ in 0..ds_count {
        let name = r.text(DS_NAM_SIZE)?;
        let kind = r.text(DST_SIZE)?;
        if kind != GAUGE {
            return Err(r.unsupported(format!("data source {name} is {kind}, not {GAUGE}")));
        }
        let par = r.params()?;
        data_sources.push(DataSource {
            name,
            heartbeat: u64::from_ne_bytes(par[0]),
            min: f64::from_ne_bytes(par[1]),
            max: f64::from_ne_bytes(par[2]),
        });
    }

    let mut archives = Vec::with_capacity(rra_count);
    for _ in 0..rra_count {
        let cf = r.text(CF_NAM_SIZE)?;
        let consolidation =
            Consolidation::from_name(&cf).ok_or_else(|| r.unsupported(format!("archive function {cf}")))?;
        r.skip(4)?;
        let rows = u32::try_from(r.u64()?).map_err(|_| r.corrupt())?;
        let pdp_per_row = u32::try_from(r.u64()?).map_err(|_| r.corrupt())?;
        let par = r.params()?;
        if pdp_per_row == 0 || rows == 0 {
            return Err(r.corrupt());
        }
        archives.push(Archive { consolidation, xff: f64::from_ne_bytes(par[0]), pdp_per_row, rows });
    }

    let last_update = u64::try_from(r.i64()?).map_err(|_| r.corrupt())?;
    r.i64()?;

    let mut pdp = Vec::with_capacity(ds_count);
    for _ in 0..ds_count {
        let last_ds = r.text(LAST_DS_LEN)?;
        r.skip(2)?;
        let scratch = r.params()?;
        pdp.push(PdpPrep {
            last_ds,
            unknown: u64::from_ne_bytes(scratch[0]),
            value: f64::from_ne_bytes(scratch[1]),
        });
    }

    let mut states = Vec::with_capacity(rra_count);
    for _ in 0..rra_count {
        let mut cdp = Vec::with_capacity(ds_count);
        for _ in 0..ds_count {
            let scratch = r.params()?;
            cdp.push(CdpPrep { value: f64::from_ne_bytes(scratch[0]), unknown: u64::from_ne_bytes(scratch[1]) });
        }
        states.push(ArchiveState { cur_row: 0, cdp, data: Vec::new() });
    }
    for (archive, state) in archives.iter().zip(states.iter_mut()) {
        let cur_row = r.u64()?;
        if cur_row >= u64::from(archive.rows) {
            return Err(r.corrupt());
        }
        state.cur_row = cur_row as u32;
    }
    for (archive, state) in archives.iter().zip(states.iter_mut()) {
        let count = archive.rows as usize * ds_count;
        state.data.reserve_exact(count);
        for _ in 0..count {
            state.data.push(r.f64()?);
        }
    }
    if r.pos != bytes.len() {
        return Err(r.corrupt());
    }

    Ok(SeriesFile {
        path: path.to_path_buf(),
        schema: Schema { step, data_sources, archives },
        last_update,
        pdp,
        archives: states,
    })
}
