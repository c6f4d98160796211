//! Events delivered to the consumer of a [`crate::BatteryClient`].
//!
//! Radio callbacks happen on background tasks; the consumer receives them
//! in order on a single channel and handles them on whatever context it
//! awaits from.

use tokio::sync::mpsc;
use tracing::trace;

use crate::discovery::{PeerDevice, ScanSummary};
use crate::error::Error;
use crate::telemetry::TelemetryFrame;

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    /// A peer address was seen for the first time during the current scan
    DeviceFound(PeerDevice),
    /// A scan session ended
    ScanStopped(ScanSummary),
    Connected,
    Disconnected,
    Data(TelemetryFrame),
    /// Advisory failure report. Only `Disconnected` and never reaching
    /// `Connected` change the connection status.
    Error(Error),
}

pub type EventReceiver = mpsc::UnboundedReceiver<MonitorEvent>;

#[derive(Debug, Clone)]
pub(crate) struct EventSink(mpsc::UnboundedSender<MonitorEvent>);

impl EventSink {
    pub(crate) fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    pub(crate) fn emit(&self, event: MonitorEvent) {
        if let Err(err) = self.0.send(event) {
            trace!("Event dropped, receiver gone: {:?}", err.0);
        }
    }
}
