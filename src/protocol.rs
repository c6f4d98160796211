//! Constants and per-firmware parameters of the battery monitor protocol.
//!
//! The monitor exposes a single GATT service with one write and one notify
//! characteristic. Commands and telemetry are single AES blocks. Two hardware
//! revisions are known that differ in key, telemetry layout and in the order
//! in which the start command and the notification subscription must happen.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cipher::{self, Frame, Key};
use crate::error::Result;
use crate::message::start_command;
use crate::message::telemetry_message::{FrameLayout, LEGACY_LAYOUT, MODERN_LAYOUT};

/// The 16-bit service identifier the monitor advertises
pub const SERVICE_ID_16: u16 = 0xfff0;
const WRITE_CHARACTERISTIC_ID_16: u16 = 0xfff3;
const NOTIFY_CHARACTERISTIC_ID_16: u16 = 0xfff4;

/// Name the monitor advertises out of the box
pub const CANONICAL_NAME: &str = "BM6";
/// Names beginning with this belong to the product family
pub const NAME_PREFIX: &str = "BM6";
/// Case-insensitive substrings found in rebranded units
pub const BRAND_MARKERS: &[&str] = &["battery monitor", "leagend", "ancel"];

const LEGACY_KEY: Key = [
    108, 101, 97, 103, 101, 110, 100, 255, 254, 48, 49, 48, 48, 48, 48, 57,
];
const MODERN_KEY: Key = [
    108, 101, 97, 103, 101, 110, 100, 255, 254, 49, 56, 56, 50, 52, 54, 54,
];

/// Expand a 16-bit assigned number onto the Bluetooth base UUID.
pub const fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// The service and characteristics a session needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattProfile {
    pub service: Uuid,
    pub write: Uuid,
    pub notify: Uuid,
}

pub const PROFILE: GattProfile = GattProfile {
    service: uuid_from_u16(SERVICE_ID_16),
    write: uuid_from_u16(WRITE_CHARACTERISTIC_ID_16),
    notify: uuid_from_u16(NOTIFY_CHARACTERISTIC_ID_16),
};

/// Whether the start command or the notification subscription comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOrdering {
    /// Arm notifications, then send the start command after a short delay
    NotifyFirst,
    /// Send the start command, arm notifications once the write is acknowledged.
    /// Some units silently drop a subscription made before any write.
    CommandFirst,
}

/// Firmware revision of the monitor, selected when connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVariant {
    Legacy,
    Modern,
}

impl ProtocolVariant {
    pub fn key(&self) -> &'static Key {
        match self {
            ProtocolVariant::Legacy => &LEGACY_KEY,
            ProtocolVariant::Modern => &MODERN_KEY,
        }
    }

    pub fn layout(&self) -> &'static FrameLayout {
        match self {
            ProtocolVariant::Legacy => &LEGACY_LAYOUT,
            ProtocolVariant::Modern => &MODERN_LAYOUT,
        }
    }

    pub fn ordering(&self) -> CommandOrdering {
        match self {
            ProtocolVariant::Legacy => CommandOrdering::NotifyFirst,
            ProtocolVariant::Modern => CommandOrdering::CommandFirst,
        }
    }

    /// The variant to fall back to when this one does not decode
    pub fn other(&self) -> Self {
        match self {
            ProtocolVariant::Legacy => ProtocolVariant::Modern,
            ProtocolVariant::Modern => ProtocolVariant::Legacy,
        }
    }

    /// Plaintext of the start command. Identical on both firmware generations.
    pub fn start_command(&self) -> &'static Frame {
        &start_command::REQUEST
    }

    /// The start command, encrypted under this variant's key.
    pub fn encrypted_start_command(&self) -> Result<Frame> {
        cipher::encrypt(self.start_command(), self.key())
    }

    /// Decrypt and decode one notification payload.
    pub fn decode_notification(&self, payload: &[u8]) -> Result<crate::TelemetryFrame> {
        let plaintext = cipher::decrypt(payload, self.key())?;
        self.layout().decode(&plaintext)
    }
}

impl std::str::FromStr for ProtocolVariant {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "legacy" | "a" => Ok(ProtocolVariant::Legacy),
            "modern" | "b" => Ok(ProtocolVariant::Modern),
            _ => Err(format!("unknown protocol variant '{s}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_uuids() {
        assert_eq!(
            PROFILE.service.to_string(),
            "0000fff0-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            PROFILE.notify.to_string(),
            "0000fff4-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_variants_are_distinct() {
        assert_ne!(
            ProtocolVariant::Legacy.key(),
            ProtocolVariant::Modern.key()
        );
        assert_ne!(
            ProtocolVariant::Legacy.ordering(),
            ProtocolVariant::Modern.ordering()
        );
        assert_eq!(ProtocolVariant::Legacy.other(), ProtocolVariant::Modern);
        assert_eq!(ProtocolVariant::Modern.other().other(), ProtocolVariant::Modern);
    }

    #[test]
    fn test_start_command_decrypts_to_request() {
        for variant in [ProtocolVariant::Legacy, ProtocolVariant::Modern] {
            let command = variant.encrypted_start_command().unwrap();
            let plaintext = cipher::decrypt(&command, variant.key()).unwrap();
            assert_eq!(plaintext, start_command::REQUEST);
        }
    }

    #[test]
    fn test_parse_variant() {
        assert_eq!("Legacy".parse(), Ok(ProtocolVariant::Legacy));
        assert_eq!("b".parse(), Ok(ProtocolVariant::Modern));
        assert!("c".parse::<ProtocolVariant>().is_err());
    }
}
