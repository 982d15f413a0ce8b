//! OOTX: the slow calibration bitstream a lighthouse modulates onto its sync pulses.
//!
//! Frame layout, one bit per sync pulse:
//! preamble of 17 zeros, a `1`, then 16-bit words each followed by a `1` sync
//! bit. The first word is the payload length in bytes (little-endian on the
//! wire), then the payload padded to an even length, then a CRC32 of the
//! payload carried as two words.

use crate::math::{f16_to_f32, f32_to_f16};
use crate::types::LighthouseId;
use serde::{Deserialize, Serialize};

const PREAMBLE_ZEROS: u32 = 17;
/// Payloads longer than this are treated as corruption.
pub const MAX_PAYLOAD: usize = 64;
/// Size of the lighthouse v1 calibration payload.
pub const CALIBRATION_PAYLOAD_LEN: usize = 33;

/// CRC-32 (IEEE 802.3, reflected, polynomial 0xEDB88320).
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OotxError {
    #[error("missing sync bit after word {word}")]
    MissingSyncBit { word: usize },
    #[error("checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("payload length {0} exceeds limit")]
    PayloadTooLong(usize),
}

/// Decoded lighthouse factory calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LighthouseCalibration {
    pub fw_version: u16,
    /// Lighthouse serial id.
    pub id: u32,
    pub phase: [f32; 2],
    pub tilt: [f32; 2],
    pub sys_unlock_count: u8,
    pub hw_version: u8,
    pub curve: [f32; 2],
    /// Gravity direction in lighthouse coordinates, seeds the "up" vector.
    pub accel_dir: [i8; 3],
    pub gib_phase: [f32; 2],
    pub gib_mag: [f32; 2],
    pub mode_current: u8,
    pub sys_faults: u8,
}

impl LighthouseCalibration {
    pub fn parse(payload: &[u8]) -> Option<LighthouseCalibration> {
        if payload.len() < CALIBRATION_PAYLOAD_LEN {
            return None;
        }
        let u16_at = |i: usize| u16::from_le_bytes([payload[i], payload[i + 1]]);
        let f16_at = |i: usize| f16_to_f32(u16_at(i));
        Some(LighthouseCalibration {
            fw_version: u16_at(0),
            id: u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]),
            phase: [f16_at(6), f16_at(8)],
            tilt: [f16_at(10), f16_at(12)],
            sys_unlock_count: payload[14],
            hw_version: payload[15],
            curve: [f16_at(16), f16_at(18)],
            accel_dir: [payload[20] as i8, payload[21] as i8, payload[22] as i8],
            gib_phase: [f16_at(23), f16_at(25)],
            gib_mag: [f16_at(27), f16_at(29)],
            mode_current: payload[31],
            sys_faults: payload[32],
        })
    }

    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(CALIBRATION_PAYLOAD_LEN);
        let f16 = |v: f32| f32_to_f16(v).to_le_bytes();
        out.extend_from_slice(&self.fw_version.to_le_bytes());
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&f16(self.phase[0]));
        out.extend_from_slice(&f16(self.phase[1]));
        out.extend_from_slice(&f16(self.tilt[0]));
        out.extend_from_slice(&f16(self.tilt[1]));
        out.push(self.sys_unlock_count);
        out.push(self.hw_version);
        out.extend_from_slice(&f16(self.curve[0]));
        out.extend_from_slice(&f16(self.curve[1]));
        out.extend(self.accel_dir.iter().map(|&a| a as u8));
        out.extend_from_slice(&f16(self.gib_phase[0]));
        out.extend_from_slice(&f16(self.gib_phase[1]));
        out.extend_from_slice(&f16(self.gib_mag[0]));
        out.extend_from_slice(&f16(self.gib_mag[1]));
        out.push(self.mode_current);
        out.push(self.sys_faults);
        out
    }
}

/// Serialize a payload into the framed OOTX bitstream.
pub fn encode_frame(payload: &[u8]) -> Vec<bool> {
    let mut bits = vec![false; PREAMBLE_ZEROS as usize];
    bits.push(true);
    let push_word = |bits: &mut Vec<bool>, hi: u8, lo: u8| {
        let word = (hi as u16) << 8 | lo as u16;
        for i in (0..16).rev() {
            bits.push((word >> i) & 1 == 1);
        }
        bits.push(true);
    };
    let len = payload.len() as u16;
    push_word(&mut bits, len as u8, (len >> 8) as u8);
    for pair in payload.chunks(2) {
        push_word(&mut bits, pair[0], pair.get(1).copied().unwrap_or(0));
    }
    let crc = crc32(payload).to_le_bytes();
    push_word(&mut bits, crc[0], crc[1]);
    push_word(&mut bits, crc[2], crc[3]);
    bits
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Counting zeros until a preamble completes.
    Searching,
    /// Reading 16 data bits of word `words_done`.
    Word,
    /// Expecting the `1` sync bit after a word.
    Sync,
}

/// Per-lighthouse OOTX frame decoder.
#[derive(Debug)]
pub struct OotxDecoder {
    lighthouse: LighthouseId,
    tolerant: bool,
    state: State,
    zeros: u32,
    word: u16,
    bit_in_word: u32,
    words_done: usize,
    length: usize,
    bytes: Vec<u8>,
    sync_errors: u64,
    crc_errors: u64,
    decoded: u64,
}

impl OotxDecoder {
    /// `tolerant` ignores missing sync bits and keeps accumulating after a checksum failure.
    pub fn new(lighthouse: LighthouseId, tolerant: bool) -> Self {
        Self {
            lighthouse,
            tolerant,
            state: State::Searching,
            zeros: 0,
            word: 0,
            bit_in_word: 0,
            words_done: 0,
            length: 0,
            bytes: Vec::new(),
            sync_errors: 0,
            crc_errors: 0,
            decoded: 0,
        }
    }

    pub fn lighthouse(&self) -> LighthouseId {
        self.lighthouse
    }

    pub fn sync_errors(&self) -> u64 {
        self.sync_errors
    }

    pub fn crc_errors(&self) -> u64 {
        self.crc_errors
    }

    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    fn restart(&mut self) {
        self.state = State::Searching;
        self.word = 0;
        self.bit_in_word = 0;
        self.words_done = 0;
        self.length = 0;
        self.bytes.clear();
    }

    fn total_words(&self) -> usize {
        1 + self.length.div_ceil(2) + 2
    }

    /// Feed one bit. Returns a verified payload when a frame completes.
    ///
    /// In tolerant mode a checksum mismatch is counted and logged and `Ok(None)`
    /// is returned; in strict mode it is an error. Either way the decoder goes
    /// back to searching for the next preamble.
    pub fn push_bit(&mut self, bit: bool) -> Result<Option<Vec<u8>>, OotxError> {
        let run = self.zeros;
        self.zeros = if bit { 0 } else { self.zeros + 1 };

        // Sync bits bound any zero run inside a frame, so seventeen zeros is a new preamble.
        if self.zeros >= PREAMBLE_ZEROS && self.state != State::Searching {
            log::trace!("ootx lh{}: preamble inside frame, restarting", self.lighthouse);
            self.restart();
            return Ok(None);
        }

        match self.state {
            State::Searching => {
                if bit && run >= PREAMBLE_ZEROS {
                    self.restart();
                    self.state = State::Word;
                }
                Ok(None)
            }
            State::Word => {
                self.word = self.word << 1 | bit as u16;
                self.bit_in_word += 1;
                if self.bit_in_word == 16 {
                    self.bit_in_word = 0;
                    self.state = State::Sync;
                }
                Ok(None)
            }
            State::Sync => {
                if !bit {
                    self.sync_errors += 1;
                    if !self.tolerant {
                        let word = self.words_done;
                        self.restart();
                        return Err(OotxError::MissingSyncBit { word });
                    }
                    log::trace!("ootx lh{}: missing sync bit, continuing", self.lighthouse);
                }
                self.finish_word()
            }
        }
    }

    fn finish_word(&mut self) -> Result<Option<Vec<u8>>, OotxError> {
        let hi = (self.word >> 8) as u8;
        let lo = self.word as u8;
        self.word = 0;
        if self.words_done == 0 {
            self.length = u16::from_le_bytes([hi, lo]) as usize;
            if self.length > MAX_PAYLOAD {
                let len = self.length;
                self.restart();
                return Err(OotxError::PayloadTooLong(len));
            }
        } else {
            self.bytes.push(hi);
            self.bytes.push(lo);
        }
        self.words_done += 1;
        self.state = State::Word;
        if self.words_done < self.total_words() {
            return Ok(None);
        }

        let padded = self.length.div_ceil(2) * 2;
        let crc_bytes = [
            self.bytes[padded],
            self.bytes[padded + 1],
            self.bytes[padded + 2],
            self.bytes[padded + 3],
        ];
        let expected = u32::from_le_bytes(crc_bytes);
        let payload: Vec<u8> = self.bytes[..self.length].to_vec();
        self.restart();
        let actual = crc32(&payload);
        if actual != expected {
            self.crc_errors += 1;
            if self.tolerant {
                log::warn!(
                    "ootx lh{}: checksum mismatch (0x{:08x} != 0x{:08x}), still accumulating",
                    self.lighthouse,
                    actual,
                    expected
                );
                return Ok(None);
            }
            return Err(OotxError::ChecksumMismatch { expected, actual });
        }
        self.decoded += 1;
        log::debug!("ootx lh{}: decoded {}-byte payload", self.lighthouse, payload.len());
        Ok(Some(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_calibration() -> LighthouseCalibration {
        LighthouseCalibration {
            fw_version: 0x0436,
            id: 0xDEAD_BEEF,
            phase: [0.0625, -0.03125],
            tilt: [-0.0078125, 0.00390625],
            sys_unlock_count: 3,
            hw_version: 9,
            curve: [0.001953125, -0.0009765625],
            accel_dir: [0, 127, -3],
            gib_phase: [0.5, 1.25],
            gib_mag: [0.0078125, -0.015625],
            mode_current: 1,
            sys_faults: 0,
        }
    }

    fn feed(decoder: &mut OotxDecoder, bits: &[bool]) -> Vec<Result<Vec<u8>, OotxError>> {
        bits.iter()
            .filter_map(|&b| decoder.push_bit(b).transpose())
            .collect()
    }

    #[test]
    fn test_crc32_known_value() {
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b""), 0);
    }

    #[test]
    fn test_decode_calibration_frame() {
        let cal = sample_calibration();
        let payload = cal.to_payload();
        assert_eq!(payload.len(), CALIBRATION_PAYLOAD_LEN);

        let mut decoder = OotxDecoder::new(0, false);
        // Leading noise must not confuse preamble detection.
        let mut bits = vec![true, false, true, true];
        bits.extend(encode_frame(&payload));
        let results = feed(&mut decoder, &bits);
        assert_eq!(results.len(), 1);
        let decoded = results[0].as_ref().unwrap();
        assert_eq!(decoded, &payload);
        assert_eq!(LighthouseCalibration::parse(decoded), Some(cal));
    }

    #[test]
    fn test_corrupted_checksum_strict() {
        let payload = sample_calibration().to_payload();
        let mut bits = encode_frame(&payload);
        // Flip a data bit in the first payload word (after preamble, 1, length word + sync).
        let idx = 18 + 17 + 3;
        bits[idx] = !bits[idx];

        let mut decoder = OotxDecoder::new(1, false);
        let results = feed(&mut decoder, &bits);
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0], Err(OotxError::ChecksumMismatch { .. })));
        assert_eq!(decoder.decoded(), 0);
    }

    #[test]
    fn test_corrupted_checksum_tolerant_then_valid() {
        let payload = sample_calibration().to_payload();
        let mut bad = encode_frame(&payload);
        let idx = 18 + 17 + 3;
        bad[idx] = !bad[idx];

        let mut decoder = OotxDecoder::new(1, true);
        let mut bits = bad;
        bits.extend(encode_frame(&payload));
        let results = feed(&mut decoder, &bits);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &payload);
        assert_eq!(decoder.crc_errors(), 1);
    }

    #[test]
    fn test_missing_sync_bit() {
        let payload = vec![0xFFu8, 0xEE, 0xAA, 0x55];
        let mut bits = encode_frame(&payload);
        // Sync bit after the length word.
        bits[18 + 16] = false;

        let mut strict = OotxDecoder::new(0, false);
        let results = feed(&mut strict, &bits);
        assert!(matches!(results[0], Err(OotxError::MissingSyncBit { word: 0 })));

        let mut tolerant = OotxDecoder::new(0, true);
        let results = feed(&mut tolerant, &bits);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].as_ref().unwrap(), &payload);
        assert_eq!(tolerant.sync_errors(), 1);
    }

    #[test]
    fn test_odd_length_payload() {
        let payload = vec![9u8, 8, 7];
        let mut decoder = OotxDecoder::new(0, false);
        let results = feed(&mut decoder, &encode_frame(&payload));
        assert_eq!(results[0].as_ref().unwrap(), &payload);
    }
}
