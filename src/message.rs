//! Messages exchanged with the monitor, as plaintext frames.

pub(crate) mod start_command;
pub mod telemetry_message;
