use crate::cipher::FRAME_LEN;
use crate::error::{Error, Result};
use crate::telemetry::TelemetryFrame;

/// The constant header every telemetry frame starts with
pub const MSG_HEADER: [u8; 4] = [0xd1, 0x55, 0x07, 0x00];

/// A field made of consecutive hex nibbles, most significant first.
/// Nibble 0 is the high nibble of byte 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NibbleField {
    pub start: usize,
    pub count: usize,
}

impl NibbleField {
    fn end_byte(&self) -> usize {
        (self.start + self.count).div_ceil(2)
    }

    fn read(&self, frame: &[u8]) -> u32 {
        (self.start..self.start + self.count).fold(0u32, |acc, i| {
            let byte = frame[i / 2];
            let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
            (acc << 4) | nibble as u32
        })
    }
}

/// Byte offsets of the telemetry fields inside a decrypted frame.
///
/// Start Byte | Meaning
/// 0..4       | A constant header with value [0xd1, 0x55, 0x07, 0x00]
/// sign       | Non-zero when the temperature is below zero
/// temperature| Temperature magnitude (°C)
/// soc        | State of charge (%)
/// voltage    | Battery voltage in V/100, as a run of nibbles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub sign: usize,
    pub temperature: usize,
    pub soc: usize,
    pub voltage: NibbleField,
}

pub const LEGACY_LAYOUT: FrameLayout = FrameLayout {
    sign: 4,
    temperature: 5,
    soc: 6,
    voltage: NibbleField { start: 15, count: 3 },
};

pub const MODERN_LAYOUT: FrameLayout = FrameLayout {
    sign: 5,
    temperature: 6,
    soc: 7,
    voltage: NibbleField { start: 16, count: 4 },
};

impl FrameLayout {
    fn min_len(&self) -> usize {
        [
            MSG_HEADER.len(),
            self.sign + 1,
            self.temperature + 1,
            self.soc + 1,
            self.voltage.end_byte(),
        ]
        .into_iter()
        .max()
        .unwrap_or(FRAME_LEN)
    }

    /// Decode a decrypted frame.
    ///
    /// Frames not starting with [`MSG_HEADER`] are rejected with
    /// [`Error::InvalidHeader`] regardless of the rest of their content.
    pub fn decode(&self, plaintext: &[u8]) -> Result<TelemetryFrame> {
        if plaintext.len() < MSG_HEADER.len() {
            return Err(Error::Truncated {
                expected: self.min_len(),
                actual: plaintext.len(),
            });
        }

        if plaintext[..MSG_HEADER.len()] != MSG_HEADER {
            return Err(Error::InvalidHeader);
        }

        if plaintext.len() < self.min_len() {
            return Err(Error::Truncated {
                expected: self.min_len(),
                actual: plaintext.len(),
            });
        }

        let magnitude = plaintext[self.temperature] as i16;
        let temperature_celsius = if plaintext[self.sign] != 0 {
            -magnitude
        } else {
            magnitude
        };
        let soc_percent = plaintext[self.soc].min(100);
        let voltage_volts = self.voltage.read(plaintext) as f32 / 100.0;

        Ok(TelemetryFrame {
            voltage_volts,
            soc_percent,
            temperature_celsius,
        })
    }
}

#[test]
fn test_decode_modern_negative_temperature() {
    let plaintext = hex::decode("d1550700 00 01 2a 1b 00c8 000000000000".replace(' ', "")).unwrap();
    let frame = MODERN_LAYOUT.decode(&plaintext).unwrap();
    assert_eq!(frame.soc_percent, 27);
    assert_eq!(frame.temperature_celsius, -42);
    assert!((frame.voltage_volts - 2.00).abs() < 1e-6);
}

#[test]
fn test_decode_modern_positive_temperature() {
    let plaintext = hex::decode("d155070000001964050f000000000000").unwrap();
    let frame = MODERN_LAYOUT.decode(&plaintext).unwrap();
    assert_eq!(frame.temperature_celsius, 25);
    assert_eq!(frame.soc_percent, 100);
    assert!((frame.voltage_volts - 12.95).abs() < 1e-4);
}

#[test]
fn test_decode_legacy_three_nibble_voltage() {
    // voltage nibbles 15..18: "4" "e" "2" -> 0x4e2 = 1250
    let plaintext = hex::decode("d155070000144b04e200000000000000").unwrap();
    let frame = LEGACY_LAYOUT.decode(&plaintext).unwrap();
    assert_eq!(frame.temperature_celsius, 20);
    assert_eq!(frame.soc_percent, 75);
    assert!((frame.voltage_volts - 12.50).abs() < 1e-4);
}

#[test]
fn test_decode_rejects_header() {
    for bad in [
        "00550700000000000000000000000000",
        "d1550701000000000000000000000000",
        "ffffffffd1550700d1550700d1550700",
    ] {
        let plaintext = hex::decode(bad).unwrap();
        assert_eq!(MODERN_LAYOUT.decode(&plaintext), Err(Error::InvalidHeader));
        assert_eq!(LEGACY_LAYOUT.decode(&plaintext), Err(Error::InvalidHeader));
    }
}

#[test]
fn test_decode_truncated() {
    let plaintext = hex::decode("d15507").unwrap();
    assert!(matches!(
        MODERN_LAYOUT.decode(&plaintext),
        Err(Error::Truncated { actual: 3, .. })
    ));

    let plaintext = hex::decode("d155070000012a1b00").unwrap();
    assert_eq!(
        MODERN_LAYOUT.decode(&plaintext),
        Err(Error::Truncated {
            expected: 10,
            actual: 9
        })
    );
}

#[test]
fn test_soc_is_clamped() {
    let plaintext = hex::decode("d155070000000aff04b0000000000000").unwrap();
    let frame = MODERN_LAYOUT.decode(&plaintext).unwrap();
    assert_eq!(frame.soc_percent, 100);
}
