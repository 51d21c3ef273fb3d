//! ==============================================================================
//! sensirion.rs - frame codecs for the SPS30 and SDP810 i2c sensors
//! ==============================================================================
//!
//! purpose:
//!     pure byte-level encode/decode so the hal only moves bytes.
//!
//! SPS30 wire format:
//!     every 16-bit word is followed by a CRC-8 (poly 0x31, init 0xFF).
//!     a measured-values read returns 10 big-endian f32s as
//!     [w0 hi, w0 lo, crc, w1 hi, w1 lo, crc] per float = 60 bytes.
//!     float order: pm1.0, pm2.5, pm4.0, pm10 (µg/m³), then number
//!     concentrations and typical particle size.
//!
//! ==============================================================================

use crate::error::SensorError;

pub const SPS30_DEFAULT_ADDRESS: u8 = 0x69;
pub const SPS30_MEASURED_VALUES_LEN: usize = 60;

/// pointer for "start measurement", followed by float-output-mode argument
pub const SPS30_CMD_START: [u8; 2] = [0x00, 0x10];
pub const SPS30_CMD_STOP: [u8; 2] = [0x01, 0x04];
pub const SPS30_CMD_DATA_READY: [u8; 2] = [0x02, 0x02];
pub const SPS30_CMD_READ_VALUES: [u8; 2] = [0x03, 0x00];

const SPS30_FLOAT_MODE: [u8; 2] = [0x03, 0x00];
const PM25_INDEX: usize = 1;

/// SDP810 raw value the sensor emits when the reading is out of range
pub const SDP810_SENTINEL: f64 = 128.0;

pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0xFF;
    for byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x31 } else { crc << 1 };
        }
    }
    crc
}

/// start-measurement frame in float output mode
pub fn sps30_start_frame() -> [u8; 5] {
    [
        SPS30_CMD_START[0],
        SPS30_CMD_START[1],
        SPS30_FLOAT_MODE[0],
        SPS30_FLOAT_MODE[1],
        crc8(&SPS30_FLOAT_MODE),
    ]
}

/// checks the per-word CRCs and strips them
fn strip_crc(frame: &[u8]) -> Result<Vec<u8>, SensorError> {
    if frame.len() % 3 != 0 {
        return Err(SensorError::NoResponse(format!("truncated frame ({} bytes)", frame.len())));
    }
    let mut out = Vec::with_capacity(frame.len() / 3 * 2);
    for (i, chunk) in frame.chunks_exact(3).enumerate() {
        if crc8(&chunk[..2]) != chunk[2] {
            return Err(SensorError::Checksum(i * 3 + 2));
        }
        out.extend_from_slice(&chunk[..2]);
    }
    Ok(out)
}

/// data-ready response: [0x00, flag, crc]
pub fn sps30_data_ready(frame: &[u8]) -> Result<bool, SensorError> {
    let words = strip_crc(frame)?;
    Ok(words.get(1).copied().unwrap_or(0) == 1)
}

/// decodes a measured-values frame into its ten floats
pub fn sps30_measured_values(frame: &[u8]) -> Result<[f32; 10], SensorError> {
    if frame.len() != SPS30_MEASURED_VALUES_LEN {
        return Err(SensorError::NoResponse(format!(
            "expected {} bytes, got {}",
            SPS30_MEASURED_VALUES_LEN,
            frame.len()
        )));
    }
    let raw = strip_crc(frame)?;
    let mut values = [0f32; 10];
    for (slot, bytes) in values.iter_mut().zip(raw.chunks_exact(4)) {
        *slot = f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }
    Ok(values)
}

/// PM2.5 mass concentration from a measured-values frame
pub fn sps30_pm25(frame: &[u8]) -> Result<f64, SensorError> {
    let values = sps30_measured_values(frame)?;
    Ok(f64::from(values[PM25_INDEX]))
}

/// encodes ten floats the way the sensor would send them (for the mock bus)
pub fn sps30_encode_values(values: &[f32; 10]) -> Vec<u8> {
    let mut out = Vec::with_capacity(SPS30_MEASURED_VALUES_LEN);
    for v in values {
        for word in v.to_be_bytes().chunks_exact(2) {
            out.extend_from_slice(word);
            out.push(crc8(word));
        }
    }
    out
}

/// differential pressure (Pa) from the first two bytes of an SDP810 read
///
/// the raw value folds around 128; exactly 128 is the invalid-range code.
pub fn sdp810_pressure(frame: &[u8]) -> Result<f64, SensorError> {
    if frame.len() < 2 {
        return Err(SensorError::NoResponse(format!("short sdp810 frame ({} bytes)", frame.len())));
    }
    let raw = f64::from(frame[0]) + f64::from(frame[1]) / 255.0;
    if raw == SDP810_SENTINEL {
        Err(SensorError::Sentinel(raw))
    } else if raw < SDP810_SENTINEL {
        Ok(raw * 240.0 / 256.0)
    } else {
        Ok(-(256.0 - raw) * 240.0 / 256.0)
    }
}
