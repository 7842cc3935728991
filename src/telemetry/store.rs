// Per-sensor sample buffers behind the recording gate, and their
// persistence at the end of a take

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::protocol::{self, DataFrame, PpiRecord, StreamKind};
use super::Result;

const CSV_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Decoded value of one sample
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Hr { bpm: u8 },
    Ppg { device_time: DateTime<Utc>, channels: [i32; 4] },
    Ppi { device_time: DateTime<Utc>, record: PpiRecord },
    Acc { device_time: DateTime<Utc>, payload: Vec<u8> },
}

impl Reading {
    pub fn kind(&self) -> StreamKind {
        match self {
            Reading::Hr { .. } => StreamKind::Hr,
            Reading::Ppg { .. } => StreamKind::Ppg,
            Reading::Ppi { .. } => StreamKind::Ppi,
            Reading::Acc { .. } => StreamKind::Acc,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetrySample {
    pub device: String,
    /// Host clock at notification arrival
    pub received_at: DateTime<Local>,
    pub reading: Reading,
}

/// One notification exactly as it arrived
#[derive(Debug, Clone, Serialize)]
pub struct RawNotification {
    pub received_at: DateTime<Local>,
    pub characteristic: Uuid,
    pub bytes: Vec<u8>,
}

/// What a sensor left behind for one take
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetryReport {
    pub description: String,
    /// Streams with at least one sample, in file order
    pub saved: Vec<StreamKind>,
    /// Requested streams that delivered nothing
    pub missing: Vec<StreamKind>,
    pub files: Vec<PathBuf>,
    pub raw_file: Option<PathBuf>,
}

impl TelemetryReport {
    pub fn no_data(description: &str, requested: &[StreamKind]) -> Self {
        Self {
            description: description.to_string(),
            missing: requested.to_vec(),
            ..Self::default()
        }
    }

    pub fn csv_count(&self) -> usize {
        self.files.len()
    }

    /// Operator-facing one-liner, e.g. `Polar: HR saved. PPG did not report.`
    pub fn summary(&self) -> String {
        if self.saved.is_empty() {
            return format!("{}: no data", self.description);
        }
        let mut text = format!("{}: {} saved.", self.description, labels(&self.saved));
        if !self.missing.is_empty() {
            text.push_str(&format!(" {} did not report.", labels(&self.missing)));
        }
        text
    }
}

fn labels(kinds: &[StreamKind]) -> String {
    kinds.iter().map(|k| k.label()).collect::<Vec<_>>().join(", ")
}

/// Device id used in file names
pub fn device_id(address: &str) -> String {
    address.replace(':', "-")
}

/// Buffers for one sensor. Owned by its decoder thread.
#[derive(Debug)]
pub struct TelemetryStore {
    device: String,
    description: String,
    requested: Vec<StreamKind>,
    recording: bool,
    samples: BTreeMap<StreamKind, Vec<TelemetrySample>>,
    raw: Vec<RawNotification>,
    seen: BTreeSet<StreamKind>,
}

impl TelemetryStore {
    pub fn new(address: &str, description: &str, requested: &[StreamKind]) -> Self {
        Self {
            device: device_id(address),
            description: description.to_string(),
            requested: requested.to_vec(),
            recording: false,
            samples: BTreeMap::new(),
            raw: Vec::new(),
            seen: BTreeSet::new(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Open the recording gate with empty buffers
    pub fn start(&mut self) {
        self.samples.clear();
        self.raw.clear();
        self.recording = true;
    }

    pub fn sample_count(&self, kind: StreamKind) -> usize {
        self.samples.get(&kind).map_or(0, Vec::len)
    }

    /// Decode one notification. Returns the streams that delivered their
    /// first sample since the decoder started.
    pub fn ingest(
        &mut self,
        characteristic: Uuid,
        bytes: &[u8],
        received_at: DateTime<Local>,
    ) -> Vec<StreamKind> {
        let readings = decode_notification(characteristic, bytes);
        if readings.is_empty() {
            return Vec::new();
        }

        let mut first = Vec::new();
        for reading in &readings {
            if self.seen.insert(reading.kind()) {
                first.push(reading.kind());
            }
        }

        if self.recording {
            self.raw.push(RawNotification {
                received_at,
                characteristic,
                bytes: bytes.to_vec(),
            });
            for reading in readings {
                self.samples
                    .entry(reading.kind())
                    .or_default()
                    .push(TelemetrySample {
                        device: self.device.clone(),
                        received_at,
                        reading,
                    });
            }
        }
        first
    }

    /// Close the gate, write one CSV per non-empty stream plus the raw
    /// snapshot, and clear the buffers.
    pub fn finish(&mut self, output_dir: &Path, prefix: &str) -> Result<TelemetryReport> {
        self.recording = false;
        let samples = std::mem::take(&mut self.samples);
        let raw = std::mem::take(&mut self.raw);

        let mut report = TelemetryReport::no_data(&self.description, &[]);
        if samples.values().any(|s| !s.is_empty()) || !raw.is_empty() {
            std::fs::create_dir_all(output_dir)?;
        }

        for (kind, rows) in &samples {
            if rows.is_empty() {
                continue;
            }
            let path = output_dir.join(format!("{}_{}_{}.csv", prefix, self.device, kind.as_str()));
            write_csv(&path, rows)?;
            report.saved.push(*kind);
            report.files.push(path);
        }
        report.missing = self
            .requested
            .iter()
            .filter(|kind| !report.saved.contains(*kind))
            .copied()
            .collect();

        if !raw.is_empty() {
            let path = output_dir.join(format!("{}_{}_raw.json", prefix, self.device));
            let mut writer = BufWriter::new(File::create(&path)?);
            serde_json::to_writer(&mut writer, &raw)?;
            writer.flush()?;
            report.raw_file = Some(path);
        }
        Ok(report)
    }
}

/// Every sample carried by one notification
fn decode_notification(characteristic: Uuid, bytes: &[u8]) -> Vec<Reading> {
    if characteristic == protocol::HEART_RATE_MEASUREMENT {
        return protocol::decode_heart_rate(bytes)
            .map(|bpm| vec![Reading::Hr { bpm }])
            .unwrap_or_default();
    }
    if characteristic != protocol::PMD_DATA {
        return Vec::new();
    }
    match protocol::decode_data(bytes) {
        Some(DataFrame::Ppg { device_time, samples }) => samples
            .into_iter()
            .map(|channels| Reading::Ppg { device_time, channels })
            .collect(),
        Some(DataFrame::Ppi { device_time, records }) => records
            .into_iter()
            .map(|record| Reading::Ppi { device_time, record })
            .collect(),
        Some(DataFrame::Acc { device_time, payload }) => vec![Reading::Acc { device_time, payload }],
        None => Vec::new(),
    }
}

// ============================================================================
// CSV rows
// ============================================================================

#[derive(Serialize)]
struct HrRow<'a> {
    device: &'a str,
    received_at: String,
    bpm: u8,
}

#[derive(Serialize)]
struct PpgRow<'a> {
    device: &'a str,
    received_at: String,
    device_time: String,
    ppg0: i32,
    ppg1: i32,
    ppg2: i32,
    ambient: i32,
}

#[derive(Serialize)]
struct PpiRow<'a> {
    device: &'a str,
    received_at: String,
    device_time: String,
    hr: u8,
    ppi_ms: u16,
    error_ms: u16,
    flags: u8,
}

#[derive(Serialize)]
struct AccRow<'a> {
    device: &'a str,
    received_at: String,
    device_time: String,
    payload_hex: String,
}

fn csv_time<Tz: chrono::TimeZone>(at: &DateTime<Tz>) -> String
where
    Tz::Offset: std::fmt::Display,
{
    at.format(CSV_TIME_FORMAT).to_string()
}

/// Every row of one file comes from the same stream, so the header is
/// taken from the first serialized row.
fn write_csv(path: &Path, rows: &[TelemetrySample]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for sample in rows {
        let device = sample.device.as_str();
        let received_at = csv_time(&sample.received_at);
        match &sample.reading {
            Reading::Hr { bpm } => writer.serialize(HrRow {
                device,
                received_at,
                bpm: *bpm,
            })?,
            Reading::Ppg { device_time, channels } => writer.serialize(PpgRow {
                device,
                received_at,
                device_time: csv_time(device_time),
                ppg0: channels[0],
                ppg1: channels[1],
                ppg2: channels[2],
                ambient: channels[3],
            })?,
            Reading::Ppi { device_time, record } => writer.serialize(PpiRow {
                device,
                received_at,
                device_time: csv_time(device_time),
                hr: record.heart_rate,
                ppi_ms: record.ppi_ms,
                error_ms: record.error_estimate,
                flags: record.flags,
            })?,
            Reading::Acc { device_time, payload } => writer.serialize(AccRow {
                device,
                received_at,
                device_time: csv_time(device_time),
                payload_hex: payload.iter().map(|b| format!("{:02x}", b)).collect(),
            })?,
        }
    }
    writer.flush()?;
    Ok(())
}
