//! Communication event tracing
//!
//! Records one event per posted operation and flushes them as a JSON array,
//! one file per rank:
//! - `seqnum` starts at 0 and is owned by the tracer instance
//! - optional root / split info is one-shot, consumed by the next event
//! - payload fields only appear when a payload size is known

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{Datelike, Local, NaiveDate};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Environment variable overriding the trace output directory
pub const TRACE_DIR_ENV: &str = "OOB_COMMS_TRACE_OUTPUT_DIR";

/// Tracer shared between the communicators of one process
pub type SharedTracer = Arc<Mutex<CommsTracer>>;

// ─────────────────────────────────────────────────────────────────
// Payload Description
// ─────────────────────────────────────────────────────────────────

/// Element type of a payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    Byte,
    Char,
    Short,
    Int,
    Long,
    Half,
    Float,
    Double,
    Bool,
    BFloat16,
}

/// Device a payload lives on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Cpu,
    Cuda,
}

/// Size and placement of one operation buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PayloadInfo {
    /// Element count
    pub numel: u64,
    pub dtype: DataType,
    pub device: DeviceType,
}

impl PayloadInfo {
    pub fn new(numel: u64, dtype: DataType, device: DeviceType) -> Self {
        Self { numel, dtype, device }
    }

    /// Byte payload on the host
    pub fn bytes(numel: u64) -> Self {
        Self::new(numel, DataType::Byte, DeviceType::Cpu)
    }
}

// ─────────────────────────────────────────────────────────────────
// Trace Record
// ─────────────────────────────────────────────────────────────────

/// One traced event, serialized with the field names trace consumers expect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub markers: Vec<String>,

    #[serde(rename = "startTime_ns")]
    pub start_time_ns: u64,

    pub comms: String,

    pub req: u64,

    pub seqnum: u64,

    pub world_size: usize,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_msg_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_msg_size: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtype: Option<DataType>,

    #[serde(rename = "devType", default, skip_serializing_if = "Option::is_none")]
    pub dev_type: Option<DeviceType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_split: Option<Vec<u64>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_split: Option<Vec<u64>>,
}

// ─────────────────────────────────────────────────────────────────
// Tracer
// ─────────────────────────────────────────────────────────────────

/// Collects trace records for one process
#[derive(Debug)]
pub struct CommsTracer {
    start: Instant,
    seqnum: u64,
    records: Vec<TraceRecord>,
    markers: Vec<String>,
    cur_root: Option<usize>,
    cur_in_split: Vec<u64>,
    cur_out_split: Vec<u64>,
    output_dir: Option<PathBuf>,
}

impl Default for CommsTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl CommsTracer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            seqnum: 0,
            records: Vec::new(),
            markers: Vec::new(),
            cur_root: None,
            cur_in_split: Vec::new(),
            cur_out_split: Vec::new(),
            output_dir: None,
        }
    }

    /// Directory used by `flush` when the environment does not override it
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// Wrap in the shared handle communicators accept
    pub fn shared(self) -> SharedTracer {
        Arc::new(Mutex::new(self))
    }

    /// Sequence number the next record will carry
    pub fn seqnum(&self) -> u64 {
        self.seqnum
    }

    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Open a named block; every record carries the open block names
    pub fn push_marker(&mut self, name: impl Into<String>) {
        self.markers.push(name.into());
    }

    pub fn pop_marker(&mut self) -> Option<String> {
        self.markers.pop()
    }

    /// Root rank for the next record only
    pub fn record_optional_root(&mut self, root: usize) {
        self.cur_root = Some(root);
    }

    /// Split sizes for the next record only
    pub fn record_optional_splits(&mut self, in_split: Vec<u64>, out_split: Vec<u64>) {
        self.cur_in_split = in_split;
        self.cur_out_split = out_split;
    }

    /// Append a record and return its sequence number
    pub fn record_comms(
        &mut self,
        name: &str,
        req: u64,
        world_size: usize,
        input: Option<&PayloadInfo>,
        output: Option<&PayloadInfo>,
    ) -> u64 {
        let in_size = input.map_or(0, |p| p.numel);
        let out_size = output.map_or(0, |p| p.numel);
        let seqnum = self.seqnum;
        self.seqnum += 1;

        let mut record = TraceRecord {
            markers: self.markers.clone(),
            start_time_ns: self.start.elapsed().as_nanos() as u64,
            comms: name.to_string(),
            req,
            seqnum,
            world_size,
            in_msg_size: None,
            out_msg_size: None,
            dtype: None,
            dev_type: None,
            root: self.cur_root.take(),
            in_split: None,
            out_split: None,
        };

        if in_size > 0 || out_size > 0 {
            record.in_msg_size = Some(in_size);
            record.out_msg_size = Some(out_size);
            record.dtype = Some(output.map(|p| p.dtype).unwrap_or_default());
            record.dev_type = Some(output.map(|p| p.device).unwrap_or_default());
        }

        let in_split = std::mem::take(&mut self.cur_in_split);
        let out_split = std::mem::take(&mut self.cur_out_split);
        if !in_split.is_empty() || !out_split.is_empty() {
            record.in_split = Some(in_split);
            record.out_split = Some(out_split);
        }

        debug!(comms = name, req, seqnum, "Recorded comms event");
        self.records.push(record);
        seqnum
    }

    /// Serialize every record as a JSON array
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.records)?)
    }

    /// Write `rank<rank>.json` into the resolved output directory
    ///
    /// Returns the written path, or `None` when nothing was recorded.
    pub fn flush(&self, rank: usize, world_size: usize) -> Result<Option<PathBuf>> {
        if self.records.is_empty() {
            return Ok(None);
        }

        let env_dir = std::env::var_os(TRACE_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let dir = resolve_output_dir(
            env_dir,
            self.output_dir.as_deref(),
            world_size,
            Local::now().date_naive(),
        );

        fs::create_dir_all(&dir).map_err(|source| Error::TraceWrite {
            path: dir.clone(),
            source,
        })?;

        let path = dir.join(format!("rank{}.json", rank));
        let json = self.to_json()?;
        fs::write(&path, json).map_err(|source| Error::TraceWrite {
            path: path.clone(),
            source,
        })?;

        info!(path = %path.display(), records = self.records.len(), "Flushed comms trace");
        Ok(Some(path))
    }
}

/// Pick the trace directory: environment override, then configured
/// directory, then a dated directory under the system temp dir
pub fn resolve_output_dir(
    env_override: Option<PathBuf>,
    configured: Option<&Path>,
    world_size: usize,
    date: NaiveDate,
) -> PathBuf {
    if let Some(dir) = env_override {
        return dir;
    }
    if let Some(dir) = configured {
        return dir.to_path_buf();
    }
    std::env::temp_dir().join(default_dir_name(world_size, date))
}

/// `oob_comms_trace_np<world>_<month>_<day>_<year>`
pub fn default_dir_name(world_size: usize, date: NaiveDate) -> String {
    format!(
        "oob_comms_trace_np{}_{}_{}_{}",
        world_size,
        date.month(),
        date.day(),
        date.year()
    )
}
