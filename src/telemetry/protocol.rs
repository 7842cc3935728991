//! Polar PMD (measurement data) protocol.
//!
//! The sensor exposes a control characteristic that accepts commands and
//! answers with response frames, and a data characteristic carrying one
//! multiplexed notification stream whose first byte tags the measurement
//! type. Heart rate arrives separately on the standard BLE heart rate
//! characteristic.
//!
//! Everything here is pure: malformed or short frames decode to `None`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Identifiers and commands
// ============================================================================

pub const PMD_CONTROL: Uuid = Uuid::from_u128(0xFB005C81_02E7_F387_1CAD_8ACD2D8DF0C8);
pub const PMD_DATA: Uuid = Uuid::from_u128(0xFB005C82_02E7_F387_1CAD_8ACD2D8DF0C8);
pub const HEART_RATE_MEASUREMENT: Uuid = Uuid::from_u128(0x00002A37_0000_1000_8000_00805F9B34FB);

pub const SDK_MODE: &[u8] = &[0x02, 0x09];
pub const STOP_SDK: &[u8] = &[0x03, 0x09];
pub const START_PPG: &[u8] = &[
    0x02, 0x01, 0x00, 0x01, 0xB0, 0x00, 0x01, 0x01, 0x16, 0x00, 0x04, 0x01, 0x04,
];
pub const START_PPI: &[u8] = &[0x02, 0x03];
pub const START_ACC: &[u8] = &[
    0x02, 0x02, 0x00, 0x01, 0x34, 0x00, 0x01, 0x01, 0x10, 0x00, 0x02, 0x01, 0x08, 0x00, 0x04,
    0x01, 0x03,
];

/// Response the sensor sends once PPG settings are accepted
pub const PPG_READY_ACK: &[u8] = &[
    0xF0, 0x01, 0x01, 0x00, 0x00, 0x00, 0x01, 0x87, 0x00, 0x01, 0x01, 0x16, 0x00, 0x04, 0x01,
    0x04,
];
/// Response to [`SDK_MODE`]
pub const SDK_MODE_ACK: &[u8] = &[0xF0, 0x02, 0x09, 0x00, 0x00];

const RESPONSE_TAG: u8 = 0xF0;
const OP_GET_SETTINGS: u8 = 0x01;
const OP_START: u8 = 0x02;
const OP_STOP: u8 = 0x03;
const MEASUREMENT_SDK: u8 = 0x09;

/// Data frame header: type tag, 8-byte device timestamp, frame type
pub const DATA_HEADER_LEN: usize = 10;
const PPG_FRAME_LEN: usize = 12;
const PPI_RECORD_LEN: usize = 6;

/// Seconds between 1970-01-01 and the device epoch 2000-01-01 (UTC)
pub const DEVICE_EPOCH_OFFSET_SECS: i64 = 946_684_800;
const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Sample stream a sensor can deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Hr,
    Ppg,
    Ppi,
    Acc,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [StreamKind::Hr, StreamKind::Ppg, StreamKind::Ppi, StreamKind::Acc];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Hr => "hr",
            StreamKind::Ppg => "ppg",
            StreamKind::Ppi => "ppi",
            StreamKind::Acc => "acc",
        }
    }

    /// Upper-case name used in operator messages
    pub fn label(self) -> &'static str {
        match self {
            StreamKind::Hr => "HR",
            StreamKind::Ppg => "PPG",
            StreamKind::Ppi => "PPI",
            StreamKind::Acc => "ACC",
        }
    }

    /// PMD measurement type, `None` for heart rate which is not a PMD stream
    pub fn measurement_type(self) -> Option<u8> {
        match self {
            StreamKind::Hr => None,
            StreamKind::Ppg => Some(0x01),
            StreamKind::Acc => Some(0x02),
            StreamKind::Ppi => Some(0x03),
        }
    }

    pub fn from_measurement_type(code: u8) -> Option<StreamKind> {
        match code {
            0x01 => Some(StreamKind::Ppg),
            0x02 => Some(StreamKind::Acc),
            0x03 => Some(StreamKind::Ppi),
            _ => None,
        }
    }

    /// Start command written to the control characteristic
    pub fn start_command(self) -> Option<&'static [u8]> {
        match self {
            StreamKind::Hr => None,
            StreamKind::Ppg => Some(START_PPG),
            StreamKind::Ppi => Some(START_PPI),
            StreamKind::Acc => Some(START_ACC),
        }
    }

    /// Whether the stream needs SDK mode before it can start
    pub fn needs_sdk_mode(self) -> bool {
        matches!(self, StreamKind::Ppg | StreamKind::Acc)
    }
}

// ============================================================================
// Decoded frames
// ============================================================================

/// One PPI record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PpiRecord {
    pub heart_rate: u8,
    pub ppi_ms: u16,
    pub error_estimate: u16,
    pub flags: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataFrame {
    Ppg {
        device_time: DateTime<Utc>,
        /// Four channel values per delta frame
        samples: Vec<[i32; 4]>,
    },
    Ppi {
        device_time: DateTime<Utc>,
        records: Vec<PpiRecord>,
    },
    Acc {
        device_time: DateTime<Utc>,
        /// Undecoded payload kept for offline processing
        payload: Vec<u8>,
    },
}

/// Classified control-characteristic response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlResponse {
    SdkModeEnabled,
    /// A stream accepted its start (or settings) request
    StreamReady(StreamKind),
    StreamStopped(Option<StreamKind>),
    /// Well-formed response with a non-zero status code
    Rejected { op: u8, measurement: u8, status: u8 },
}

// ============================================================================
// Decoders
// ============================================================================

/// Convert nanoseconds since 2000-01-01T00:00:00Z to UTC
pub fn device_time(nanos: u64) -> Option<DateTime<Utc>> {
    let secs = (nanos / NANOS_PER_SEC) as i64 + DEVICE_EPOCH_OFFSET_SECS;
    let subsec = (nanos % NANOS_PER_SEC) as u32;
    DateTime::from_timestamp(secs, subsec)
}

/// Signed 24-bit little-endian value
fn i24_le(bytes: &[u8]) -> i32 {
    let raw = i32::from(bytes[0]) | (i32::from(bytes[1]) << 8) | (i32::from(bytes[2]) << 16);
    if bytes[2] & 0x80 != 0 {
        raw - (1 << 24)
    } else {
        raw
    }
}

fn header_time(frame: &[u8]) -> Option<DateTime<Utc>> {
    let raw: [u8; 8] = frame.get(1..9)?.try_into().ok()?;
    device_time(u64::from_le_bytes(raw))
}

/// Heart rate in BPM from a heart rate measurement notification
pub fn decode_heart_rate(value: &[u8]) -> Option<u8> {
    value.get(1).copied()
}

pub fn decode_ppg(frame: &[u8]) -> Option<DataFrame> {
    if frame.len() < DATA_HEADER_LEN || frame[0] != 0x01 {
        return None;
    }
    let device_time = header_time(frame)?;
    let samples = frame[DATA_HEADER_LEN..]
        .chunks_exact(PPG_FRAME_LEN)
        .map(|chunk| {
            [
                i24_le(&chunk[0..3]),
                i24_le(&chunk[3..6]),
                i24_le(&chunk[6..9]),
                i24_le(&chunk[9..12]),
            ]
        })
        .collect();
    Some(DataFrame::Ppg { device_time, samples })
}

pub fn decode_ppi(frame: &[u8]) -> Option<DataFrame> {
    if frame.len() < DATA_HEADER_LEN || frame[0] != 0x03 {
        return None;
    }
    let device_time = header_time(frame)?;
    let records = frame[DATA_HEADER_LEN..]
        .chunks_exact(PPI_RECORD_LEN)
        .map(|r| PpiRecord {
            heart_rate: r[0],
            ppi_ms: u16::from_le_bytes([r[1], r[2]]),
            error_estimate: u16::from_le_bytes([r[3], r[4]]),
            flags: r[5],
        })
        .collect();
    Some(DataFrame::Ppi { device_time, records })
}

pub fn decode_acc(frame: &[u8]) -> Option<DataFrame> {
    if frame.len() < DATA_HEADER_LEN || frame[0] != 0x02 {
        return None;
    }
    Some(DataFrame::Acc {
        device_time: header_time(frame)?,
        payload: frame[DATA_HEADER_LEN..].to_vec(),
    })
}

/// Dispatch a data-characteristic notification on its type tag
pub fn decode_data(frame: &[u8]) -> Option<DataFrame> {
    match frame.first()? {
        0x01 => decode_ppg(frame),
        0x02 => decode_acc(frame),
        0x03 => decode_ppi(frame),
        _ => None,
    }
}

/// Classify a control-characteristic notification. Anything that is not a
/// response frame decodes to `None`.
pub fn classify_response(frame: &[u8]) -> Option<ControlResponse> {
    if frame.len() < 4 || frame[0] != RESPONSE_TAG {
        return None;
    }
    let (op, measurement, status) = (frame[1], frame[2], frame[3]);
    if status != 0 {
        return Some(ControlResponse::Rejected { op, measurement, status });
    }
    match (op, measurement) {
        (OP_START, MEASUREMENT_SDK) => Some(ControlResponse::SdkModeEnabled),
        (OP_START, code) | (OP_GET_SETTINGS, code) => {
            StreamKind::from_measurement_type(code).map(ControlResponse::StreamReady)
        }
        (OP_STOP, code) => Some(ControlResponse::StreamStopped(StreamKind::from_measurement_type(code))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(tag: u8, device_nanos: u64) -> Vec<u8> {
        let mut frame = vec![tag];
        frame.extend_from_slice(&device_nanos.to_le_bytes());
        frame.push(0x00);
        frame
    }

    fn push_i24(frame: &mut Vec<u8>, value: i32) {
        let bytes = (value as u32 & 0x00FF_FFFF).to_le_bytes();
        frame.extend_from_slice(&bytes[..3]);
    }

    #[test]
    fn device_epoch_zero_is_new_year_2000() {
        let time = device_time(0).unwrap();
        assert_eq!(time.to_rfc3339(), "2000-01-01T00:00:00+00:00");

        let later = device_time(1_500_000_000).unwrap();
        assert_eq!(later.timestamp(), DEVICE_EPOCH_OFFSET_SECS + 1);
        assert_eq!(later.timestamp_subsec_nanos(), 500_000_000);
    }

    #[test]
    fn ppg_yields_one_sample_per_delta_frame() {
        let expected = [
            [1, -1, 0x7F_FFFF, -0x80_0000],
            [0, 256, -2, 65_536],
            [-300, 300, 42, -42],
        ];
        let mut frame = header(0x01, 0);
        for values in expected {
            for value in values {
                push_i24(&mut frame, value);
            }
        }
        assert_eq!(frame.len(), 10 + 12 * 3);

        match decode_data(&frame) {
            Some(DataFrame::Ppg { device_time: t, samples }) => {
                assert_eq!(t, device_time(0).unwrap());
                assert_eq!(samples, expected.to_vec());
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn all_ones_is_minus_one() {
        assert_eq!(i24_le(&[0xFF, 0xFF, 0xFF]), -1);
        assert_eq!(i24_le(&[0x00, 0x00, 0x80]), -8_388_608);
        assert_eq!(i24_le(&[0xFF, 0xFF, 0x7F]), 8_388_607);
    }

    #[test]
    fn trailing_partial_delta_frame_is_ignored() {
        let mut frame = header(0x01, 0);
        frame.extend_from_slice(&[0u8; 12 + 5]);
        match decode_ppg(&frame) {
            Some(DataFrame::Ppg { samples, .. }) => assert_eq!(samples.len(), 1),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn ppi_records_are_little_endian() {
        let mut frame = header(0x03, 2_000_000_000);
        frame.extend_from_slice(&[72, 0x20, 0x03, 0x05, 0x00, 0x01]);
        frame.extend_from_slice(&[75, 0x00, 0x03, 0x0A, 0x00, 0x00]);
        frame.extend_from_slice(&[80, 0x01]);

        match decode_data(&frame) {
            Some(DataFrame::Ppi { records, device_time: t }) => {
                assert_eq!(t.timestamp(), DEVICE_EPOCH_OFFSET_SECS + 2);
                assert_eq!(
                    records,
                    vec![
                        PpiRecord { heart_rate: 72, ppi_ms: 800, error_estimate: 5, flags: 1 },
                        PpiRecord { heart_rate: 75, ppi_ms: 768, error_estimate: 10, flags: 0 },
                    ]
                );
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn acc_keeps_raw_payload() {
        let mut frame = header(0x02, 0);
        frame.extend_from_slice(&[1, 2, 3]);
        assert!(matches!(
            decode_data(&frame),
            Some(DataFrame::Acc { payload, .. }) if payload == vec![1, 2, 3]
        ));
    }

    #[test]
    fn short_or_unknown_frames_are_dropped() {
        assert_eq!(decode_data(&[]), None);
        assert_eq!(decode_data(&[0x01, 0x00, 0x00]), None);
        assert_eq!(decode_data(&header(0x07, 0)), None);
        assert_eq!(decode_heart_rate(&[0x00]), None);
        assert_eq!(decode_heart_rate(&[0x00, 64]), Some(64));
    }

    #[test]
    fn known_acknowledgements_are_recognised() {
        assert_eq!(classify_response(SDK_MODE_ACK), Some(ControlResponse::SdkModeEnabled));
        assert_eq!(
            classify_response(PPG_READY_ACK),
            Some(ControlResponse::StreamReady(StreamKind::Ppg))
        );
        assert_eq!(
            classify_response(&[0xF0, 0x02, 0x03, 0x00, 0x00]),
            Some(ControlResponse::StreamReady(StreamKind::Ppi))
        );
        assert_eq!(
            classify_response(&[0xF0, 0x02, 0x01, 0x05]),
            Some(ControlResponse::Rejected { op: 2, measurement: 1, status: 5 })
        );
        assert_eq!(classify_response(&[0x0F, 0x02]), None);
        assert_eq!(classify_response(&[0xF0, 0x02, 0x7E, 0x00]), None);
    }

    #[test]
    fn start_commands_carry_their_measurement_type() {
        for kind in [StreamKind::Ppg, StreamKind::Ppi, StreamKind::Acc] {
            let command = kind.start_command().unwrap();
            assert_eq!(command[0], 0x02);
            assert_eq!(Some(command[1]), kind.measurement_type());
        }
        assert!(StreamKind::Hr.start_command().is_none());
    }
}
