/// A verbatim message which asks the monitor to (keep) streaming telemetry.
///
/// Sent once while connecting and then periodically as a keep-alive; the monitor
/// stops notifying if it is not re-prompted.
pub(crate) const REQUEST: [u8; 16] = [
    0xd1, 0x55, 0x07, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];
